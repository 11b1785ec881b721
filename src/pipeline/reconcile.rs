//! Record reconciliation.
//!
//! * [`reconcile_extraction`]: fill expected fields, drop blank records, and
//!   drop repeats (overlapping chunks see the same text twice).
//! * [`reconcile_comparison`]: align two record sets on a case-insensitive
//!   (category, attribute) key and classify each pair.
//!
//! Keys are normalised by trimming and lowercasing each component.

use crate::config::{ComparisonKey, ExtractionSchema};
use crate::output::{cell_text, lookup, ChangeKind, ComparisonPair, Record};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

/// Separates key components so ("ab", "c") and ("a", "bc") differ.
const KEY_SEPARATOR: char = '\u{1f}';

// ── Extraction ───────────────────────────────────────────────────────────

/// Normalise, filter, and deduplicate extraction records. First occurrence
/// wins and order is kept.
pub fn reconcile_extraction(records: Vec<Record>, schema: &ExtractionSchema) -> Vec<Record> {
    let mut seen = HashSet::new();
    let mut kept = Vec::with_capacity(records.len());

    for record in records {
        let record = conform(record, &schema.fields);
        if !has_content(&record, &schema.content_fields) {
            continue;
        }
        if seen.insert(identity_key(&record, &schema.key_fields)) {
            kept.push(record);
        }
    }
    kept
}

/// Expected fields first, in schema order and under their schema names;
/// missing ones become "". Extra fields follow in their original order.
fn conform(record: Record, fields: &[String]) -> Record {
    if fields.is_empty() {
        return record;
    }
    let mut out = Record::new();
    for field in fields {
        let value = lookup(&record, field)
            .cloned()
            .unwrap_or_else(|| Value::String(String::new()));
        out.insert(field.clone(), value);
    }
    for (k, v) in record {
        let expected = fields.iter().any(|f| f.trim().eq_ignore_ascii_case(k.trim()));
        if !expected {
            out.insert(k, v);
        }
    }
    out
}

fn has_content(record: &Record, content_fields: &[String]) -> bool {
    if content_fields.is_empty() {
        record.values().any(is_meaningful)
    } else {
        content_fields
            .iter()
            .any(|f| lookup(record, f).is_some_and(is_meaningful))
    }
}

fn is_meaningful(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// Key fields when configured and non-blank; full content otherwise.
fn identity_key(record: &Record, key_fields: &[String]) -> String {
    if !key_fields.is_empty() {
        let parts: Vec<String> = key_fields
            .iter()
            .map(|f| lookup(record, f).map(normalize).unwrap_or_default())
            .collect();
        if parts.iter().any(|p| !p.is_empty()) {
            return parts.join(&KEY_SEPARATOR.to_string());
        }
    }
    let mut fields: Vec<(String, String)> = record
        .iter()
        .map(|(k, v)| (k.trim().to_lowercase(), normalize(v)))
        .collect();
    fields.sort();
    fields
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(&KEY_SEPARATOR.to_string())
}

fn normalize(value: &Value) -> String {
    cell_text(value).trim().to_lowercase()
}

// ── Comparison ───────────────────────────────────────────────────────────

/// Align `a` with `b`.
///
/// Every A record yields exactly one pair, in A order; unmatched B records
/// follow in B order. Several A records with the same key consume matching
/// B records first-come first-served. Records whose key is blank never
/// match.
pub fn reconcile_comparison(
    a: Vec<Record>,
    b: Vec<Record>,
    key: &ComparisonKey,
) -> Vec<ComparisonPair> {
    let mut index: HashMap<String, VecDeque<usize>> = HashMap::new();
    for (i, record) in b.iter().enumerate() {
        if let Some(k) = composite_key(record, key) {
            index.entry(k).or_default().push_back(i);
        }
    }

    let mut slots: Vec<Option<Record>> = b.into_iter().map(Some).collect();
    let mut pairs = Vec::with_capacity(a.len() + slots.len());

    for record in a {
        let matched = composite_key(&record, key)
            .and_then(|k| index.get_mut(&k))
            .and_then(VecDeque::pop_front)
            .and_then(|i| slots[i].take());
        pairs.push(classify(Some(record), matched, key));
    }
    pairs.extend(
        slots
            .into_iter()
            .flatten()
            .map(|record| classify(None, Some(record), key)),
    );
    pairs
}

/// Normalised (category, attribute), or `None` when both are blank.
pub fn composite_key(record: &Record, key: &ComparisonKey) -> Option<String> {
    let category = lookup(record, &key.category_field)
        .map(normalize)
        .unwrap_or_default();
    let attribute = lookup(record, &key.attribute_field)
        .map(normalize)
        .unwrap_or_default();
    if category.is_empty() && attribute.is_empty() {
        None
    } else {
        Some(format!("{category}{KEY_SEPARATOR}{attribute}"))
    }
}

fn classify(a: Option<Record>, b: Option<Record>, key: &ComparisonKey) -> ComparisonPair {
    let (change, differences) = match (&a, &b) {
        (Some(ra), Some(rb)) => {
            let differences = differing_fields(ra, rb, key);
            let change = if differences.is_empty() {
                ChangeKind::Unchanged
            } else {
                ChangeKind::Modified
            };
            (change, differences)
        }
        (Some(_), None) => (ChangeKind::Removed, Vec::new()),
        _ => (ChangeKind::Added, Vec::new()),
    };
    ComparisonPair {
        a,
        b,
        change,
        differences,
    }
}

/// Non-key fields whose trimmed values differ. Field names match
/// case-insensitively; a field missing on one side counts as blank.
fn differing_fields(a: &Record, b: &Record, key: &ComparisonKey) -> Vec<String> {
    let is_key = |field: &str| {
        field.trim().eq_ignore_ascii_case(key.category_field.trim())
            || field.trim().eq_ignore_ascii_case(key.attribute_field.trim())
    };

    let mut fields: Vec<&String> = Vec::new();
    for name in a.keys().chain(b.keys()) {
        if !is_key(name) && !fields.iter().any(|f| f.trim().eq_ignore_ascii_case(name.trim())) {
            fields.push(name);
        }
    }

    fields
        .into_iter()
        .filter(|field| {
            let left = lookup(a, field).map(cell_text).unwrap_or_default();
            let right = lookup(b, field).map(cell_text).unwrap_or_default();
            left.trim() != right.trim()
        })
        .cloned()
        .collect()
}
