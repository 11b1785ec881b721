//! Tolerant parsing of model replies into records.
//!
//! Models are asked for a JSON array of objects but answer in many shapes:
//! fenced blocks with or without a language tag, a sentence of prose before
//! the payload, a bare object, trailing commas, or an array cut off at the
//! output limit. [`parse_reply`] recovers what it can and never fails; the
//! worst case is an empty record list with an outcome saying why.
//!
//! ## Search order
//!
//! 1. Trim, then strip one outer fence.
//! 2. Look inside fenced blocks first, then the whole text.
//! 3. Walk opening brackets left to right; take the first balanced value
//!    that parses and normalises to records.
//! 4. An unclosed array is salvaged up to its last complete element.
//! 5. Greedy first-`[`-to-last-`]`, then first-`{`-to-last-`}`.

use crate::output::Record;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Opening brackets tried per region before giving up.
const MAX_CANDIDATES: usize = 64;

/// How a reply was interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A complete payload with at least one record.
    Records,
    /// A truncated array, recovered up to its last complete element.
    Salvaged,
    /// A valid payload with zero records (`[]`).
    Empty,
    /// Valid JSON, but not an object or a list of objects.
    NotRecords,
    /// Something bracketed was found but would not parse.
    Malformed(String),
    /// Nothing resembling a payload.
    NoPayload,
}

impl ParseOutcome {
    /// True when the reply could not be read as records at all.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ParseOutcome::NotRecords | ParseOutcome::Malformed(_) | ParseOutcome::NoPayload
        )
    }
}

/// Records recovered from one reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedReply {
    pub records: Vec<Record>,
    pub outcome: ParseOutcome,
}

impl ParsedReply {
    fn found(records: Vec<Record>, salvaged: bool) -> Self {
        let outcome = if salvaged {
            ParseOutcome::Salvaged
        } else if records.is_empty() {
            ParseOutcome::Empty
        } else {
            ParseOutcome::Records
        };
        Self { records, outcome }
    }

    fn nothing(outcome: ParseOutcome) -> Self {
        Self {
            records: Vec::new(),
            outcome,
        }
    }
}

/// Raw reply → records. Never fails; unreadable replies give `[]`.
pub fn parse_records(raw: &str) -> Vec<Record> {
    parse_reply(raw).records
}

/// Raw reply → records plus how they were found.
pub fn parse_reply(raw: &str) -> ParsedReply {
    let cleaned = strip_outer_fence(raw.trim());
    if cleaned.is_empty() {
        return ParsedReply::nothing(ParseOutcome::NoPayload);
    }

    let mut regions: Vec<&str> = RE_FENCED_BLOCK
        .captures_iter(cleaned)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .collect();
    regions.push(cleaned);

    let mut best_miss = ParseOutcome::NoPayload;
    for region in regions {
        match scan_region(region) {
            Ok(parsed) => return parsed,
            Err(miss) => keep_best(&mut best_miss, miss),
        }
    }

    // A well-formed value that is not records is a definite answer.
    if best_miss == ParseOutcome::NotRecords {
        return ParsedReply::nothing(best_miss);
    }
    greedy(cleaned).unwrap_or_else(|| ParsedReply::nothing(best_miss))
}

/// First `max_chars` characters of a reply, for log lines.
pub fn preview(raw: &str, max_chars: usize) -> String {
    let mut out: String = raw.chars().take(max_chars).collect();
    if raw.chars().nth(max_chars).is_some() {
        out.push('…');
    }
    out.replace('\n', "\\n")
}

/// Normalise a parsed value: object → one record, list of objects → records,
/// anything else → `None`.
pub fn into_records(value: Value) -> Option<Vec<Record>> {
    match value {
        Value::Object(map) => Some(vec![map]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

// ── Step 1: Outer fence ──────────────────────────────────────────────────

static RE_OPEN_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^```[A-Za-z0-9_+.\-]*[ \t]*\r?\n?").unwrap());
static RE_CLOSE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r?\n?```\s*$").unwrap());
static RE_FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_+.\-]*[ \t]*\r?\n(.*?)```").unwrap());

fn strip_outer_fence(s: &str) -> &str {
    if !s.starts_with("```") {
        return s;
    }
    let body = match RE_OPEN_FENCE.find(s) {
        Some(m) => &s[m.end()..],
        None => s,
    };
    match RE_CLOSE_FENCE.find(body) {
        Some(m) => body[..m.start()].trim(),
        None => body.trim(),
    }
}

// ── Step 3: Balanced scan ────────────────────────────────────────────────

enum Scan {
    Closed(usize),
    Unclosed,
    Mismatched,
}

/// Find the end (exclusive) of the bracketed value opening at `start`,
/// skipping brackets inside JSON strings.
fn balanced_end(text: &str, start: usize) -> Scan {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in text.as_bytes().iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => stack.push(b']'),
            b'{' => stack.push(b'}'),
            b']' | b'}' => {
                if stack.pop() != Some(b) {
                    return Scan::Mismatched;
                }
                if stack.is_empty() {
                    return Scan::Closed(i + 1);
                }
            }
            _ => {}
        }
    }
    Scan::Unclosed
}

fn scan_region(text: &str) -> Result<ParsedReply, ParseOutcome> {
    let mut miss = ParseOutcome::NoPayload;
    let mut from = 0;

    for _ in 0..MAX_CANDIDATES {
        let Some(offset) = text[from..].find(|c: char| c == '[' || c == '{') else {
            break;
        };
        let start = from + offset;

        match balanced_end(text, start) {
            Scan::Closed(end) => match parse_value(&text[start..end]) {
                Ok(value) => match into_records(value) {
                    Some(records) => return Ok(ParsedReply::found(records, false)),
                    None => {
                        keep_best(&mut miss, ParseOutcome::NotRecords);
                        from = end;
                        continue;
                    }
                },
                Err(e) => keep_best(&mut miss, ParseOutcome::Malformed(e)),
            },
            Scan::Unclosed => {
                if text.as_bytes()[start] == b'[' {
                    if let Some(records) = salvage_array(text, start) {
                        return Ok(ParsedReply::found(records, true));
                    }
                }
                keep_best(&mut miss, ParseOutcome::Malformed("unterminated value".into()));
            }
            Scan::Mismatched => {}
        }
        from = start + 1;
    }
    Err(miss)
}

/// Parse, retrying once with trailing commas removed.
fn parse_value(candidate: &str) -> Result<Value, String> {
    serde_json::from_str(candidate).or_else(|first| {
        let repaired = strip_trailing_commas(candidate);
        if repaired == candidate {
            return Err(first.to_string());
        }
        serde_json::from_str(&repaired).map_err(|_| first.to_string())
    })
}

fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = s.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some(']') | Some('}')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

// ── Step 4: Truncated arrays ─────────────────────────────────────────────

/// Close an unterminated array after its last complete element.
fn salvage_array(text: &str, start: usize) -> Option<Vec<Record>> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut last_complete = None;

    for (i, &b) in text.as_bytes().iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' => depth += 1,
            b']' | b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 1 {
                    last_complete = Some(i + 1);
                }
            }
            _ => {}
        }
    }

    let end = last_complete?;
    let candidate = format!("{}]", &text[start..end]);
    let records = into_records(parse_value(&candidate).ok()?)?;
    (!records.is_empty()).then_some(records)
}

// ── Step 5: Greedy fallback ──────────────────────────────────────────────

fn greedy(text: &str) -> Option<ParsedReply> {
    for (open, close) in [('[', ']'), ('{', '}')] {
        let (Some(start), Some(end)) = (text.find(open), text.rfind(close)) else {
            continue;
        };
        if end <= start {
            continue;
        }
        if let Some(records) = parse_value(&text[start..=end]).ok().and_then(into_records) {
            return Some(ParsedReply::found(records, false));
        }
    }
    None
}

fn keep_best(current: &mut ParseOutcome, candidate: ParseOutcome) {
    if rank(&candidate) > rank(current) {
        *current = candidate;
    }
}

fn rank(outcome: &ParseOutcome) -> u8 {
    match outcome {
        ParseOutcome::NoPayload => 0,
        ParseOutcome::Malformed(_) => 1,
        ParseOutcome::NotRecords => 2,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(raw: &str) -> Vec<Value> {
        parse_records(raw).into_iter().map(Value::Object).collect()
    }

    #[test]
    fn fenced_payload_inside_prose() {
        let raw = "Here is the result:\n```json\n[{\"a\":1}]\n```\nThanks";
        assert_eq!(values(raw), vec![json!({"a": 1})]);
    }

    #[test]
    fn no_json_is_empty() {
        let parsed = parse_reply("no json here");
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.outcome, ParseOutcome::NoPayload);
    }

    #[test]
    fn bare_object_promoted() {
        assert_eq!(values("{\"rule\": \"x\"}"), vec![json!({"rule": "x"})]);
    }

    #[test]
    fn fence_without_language_tag() {
        assert_eq!(values("```\n[{\"a\": 2}]\n```"), vec![json!({"a": 2})]);
    }

    #[test]
    fn object_containing_array_is_one_record() {
        assert_eq!(
            values("{\"tags\": [1, 2], \"n\": 3}"),
            vec![json!({"tags": [1, 2], "n": 3})]
        );
    }

    #[test]
    fn prose_brackets_are_skipped() {
        let raw = "See notes [below]. [{\"a\": \"b\"}]";
        assert_eq!(values(raw), vec![json!({"a": "b"})]);
    }

    #[test]
    fn brackets_inside_strings_do_not_confuse_scan() {
        let raw = "[{\"text\": \"use ] and } freely\"}]";
        assert_eq!(values(raw), vec![json!({"text": "use ] and } freely"})]);
    }

    #[test]
    fn trailing_commas_repaired() {
        assert_eq!(values("[{\"a\": 1,}, {\"a\": 2},]").len(), 2);
    }

    #[test]
    fn truncated_array_salvaged() {
        let parsed = parse_reply("[{\"a\": 1}, {\"a\": 2}, {\"a\": 3, \"b\": \"cut of");
        assert_eq!(parsed.outcome, ParseOutcome::Salvaged);
        assert_eq!(parsed.records.len(), 2);
    }

    #[test]
    fn mixed_list_is_no_data() {
        let parsed = parse_reply("[{\"a\": 1}, 2]");
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.outcome, ParseOutcome::NotRecords);
    }

    #[test]
    fn scalar_is_no_data() {
        assert!(parse_records("42").is_empty());
        assert!(parse_records("[\"a\", \"b\"]").is_empty());
    }

    #[test]
    fn empty_array_is_empty_outcome() {
        let parsed = parse_reply("```json\n[]\n```");
        assert_eq!(parsed.outcome, ParseOutcome::Empty);
        assert!(!parsed.outcome.is_failure());
    }

    #[test]
    fn preview_is_bounded() {
        let p = preview(&"x".repeat(500), 10);
        assert_eq!(p.chars().count(), 11);
    }
}
