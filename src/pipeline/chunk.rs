//! Chunking: cut document text into prompt-sized pieces.
//!
//! Two strategies:
//!
//! * **Token budget** ([`Chunker::split_text`]) packs whole words until the
//!   budget is reached, then starts the next chunk a little earlier so the
//!   last `overlap` tokens are repeated. A word longer than the budget on
//!   its own is cut by characters. Every chunk is an exact slice of the
//!   input, addressed by byte offsets.
//!
//! * **Pages** ([`Chunker::split_pages`]) groups consecutive page segments.
//!   Sizes are not checked against the budget; an oversized chunk is logged
//!   and sent anyway.
//!
//! The budget satisfies
//! `tokens(template) + tokens(chunk) + safety_margin <= max_input_tokens`
//! and is further capped by the model's recommended chunk size.

use crate::config::ModelProfile;
use crate::error::PipelineError;
use crate::pipeline::reader::PageSegment;
use crate::pipeline::split::PageRange;
use crate::pipeline::tokens::TokenEstimator;
use tracing::{debug, warn};

/// Chunk budgets below this leave no room for useful text.
pub const MIN_CHUNK_TOKENS: usize = 16;

/// Where a chunk came from in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChunkOrigin {
    /// Byte offsets `[start, end)` into the joined document text.
    Chars { start: usize, end: usize },
    /// Source pages, inclusive.
    Pages(PageRange),
}

impl std::fmt::Display for ChunkOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkOrigin::Chars { start, end } => write!(f, "bytes {start}..{end}"),
            ChunkOrigin::Pages(range) => write!(f, "{range}"),
        }
    }
}

/// One unit of work for the generation loop. `index` is 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub origin: ChunkOrigin,
    pub estimated_tokens: usize,
}

/// Resolved token limits for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBudget {
    /// Maximum estimated tokens of chunk text.
    pub chunk_tokens: usize,
    /// Tokens repeated between consecutive token-mode chunks.
    pub overlap_tokens: usize,
}

/// Splits text for one model and one instruction template.
#[derive(Debug, Clone)]
pub struct Chunker {
    estimator: TokenEstimator,
    budget: ChunkBudget,
}

impl Chunker {
    /// Derive the chunk budget from the model's limits and the template that
    /// accompanies every chunk.
    pub fn new(
        model: &str,
        profile: &ModelProfile,
        template: &str,
        overlap_tokens: usize,
    ) -> Result<Self, PipelineError> {
        let estimator = TokenEstimator::for_model(model);
        let template_tokens = estimator.estimate(template);
        let available = profile
            .max_input_tokens
            .saturating_sub(template_tokens + profile.safety_margin_tokens);

        if available < MIN_CHUNK_TOKENS {
            return Err(PipelineError::PromptTooLarge {
                model: model.to_string(),
                template_tokens,
                safety_margin: profile.safety_margin_tokens,
                max_input: profile.max_input_tokens,
            });
        }

        let chunk_tokens = available.min(profile.recommended_chunk_tokens.max(MIN_CHUNK_TOKENS));
        let budget = ChunkBudget {
            chunk_tokens,
            overlap_tokens: overlap_tokens.min(chunk_tokens / 2),
        };
        debug!(
            "Chunk budget for {model}: {} tokens (template {template_tokens}, overlap {})",
            budget.chunk_tokens, budget.overlap_tokens
        );
        Ok(Self { estimator, budget })
    }

    pub fn budget(&self) -> ChunkBudget {
        self.budget
    }

    pub fn estimator(&self) -> TokenEstimator {
        self.estimator
    }

    /// Token-budget split. Whitespace-only text yields no chunks.
    pub fn split_text(&self, text: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let units = self.units(text);
        let budget = self.budget.chunk_tokens;
        let mut spans: Vec<(usize, usize)> = Vec::new();
        let mut i = 0;

        while i < units.len() {
            // Every unit fits on its own, so at least one is taken.
            let mut j = i;
            let mut used = 0;
            while j < units.len() && used + units[j].tokens <= budget {
                used += units[j].tokens;
                j += 1;
            }
            spans.push((units[i].start, units[j - 1].end));
            if j == units.len() {
                break;
            }

            // Step back for overlap, but always advance past `i` and leave
            // room for unit `j` so the next chunk reaches new text.
            let mut k = j;
            let mut repeated = 0;
            let room = self
                .budget
                .overlap_tokens
                .min(budget.saturating_sub(units[j].tokens));
            while k > i + 1 && repeated + units[k - 1].tokens <= room {
                repeated += units[k - 1].tokens;
                k -= 1;
            }
            i = k;
        }

        spans
            .into_iter()
            .filter(|&(start, end)| !text[start..end].trim().is_empty())
            .enumerate()
            .map(|(index, (start, end))| {
                let slice = &text[start..end];
                Chunk {
                    index,
                    text: slice.to_string(),
                    origin: ChunkOrigin::Chars { start, end },
                    estimated_tokens: self.estimator.estimate(slice),
                }
            })
            .collect()
    }

    /// Page split: consecutive segments grouped until `pages_per_chunk`
    /// pages are covered. Groups with no text are skipped.
    pub fn split_pages(&self, segments: &[PageSegment], pages_per_chunk: usize) -> Vec<Chunk> {
        let per = pages_per_chunk.max(1);
        let mut chunks = Vec::new();
        let mut group: Vec<&PageSegment> = Vec::new();
        let mut pages = 0;

        let flush = |group: &mut Vec<&PageSegment>, chunks: &mut Vec<Chunk>| {
            if let (Some(first), Some(last)) = (group.first(), group.last()) {
                let range = PageRange::new(first.range.start, last.range.end);
                let text = group
                    .iter()
                    .map(|s| s.text.trim())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                if !text.is_empty() {
                    let estimated_tokens = self.estimator.estimate(&text);
                    if estimated_tokens > self.budget.chunk_tokens {
                        warn!(
                            "Chunk for {range} is ~{estimated_tokens} tokens, over the {} token budget; sending anyway",
                            self.budget.chunk_tokens
                        );
                    }
                    chunks.push(Chunk {
                        index: chunks.len(),
                        text,
                        origin: ChunkOrigin::Pages(range),
                        estimated_tokens,
                    });
                }
            }
            group.clear();
        };

        for segment in segments {
            group.push(segment);
            pages += segment.range.len();
            if pages >= per {
                flush(&mut group, &mut chunks);
                pages = 0;
            }
        }
        flush(&mut group, &mut chunks);
        chunks
    }

    /// Word units (a word plus its trailing whitespace), with any unit over
    /// budget cut into character pieces that fit.
    fn units(&self, text: &str) -> Vec<Unit> {
        let mut bounds = Vec::new();
        let mut start = 0;
        let mut in_space = false;
        for (i, c) in text.char_indices() {
            if c.is_whitespace() {
                in_space = true;
            } else if in_space {
                bounds.push((start, i));
                start = i;
                in_space = false;
            }
        }
        if start < text.len() {
            bounds.push((start, text.len()));
        }

        let mut units = Vec::with_capacity(bounds.len());
        for (start, end) in bounds {
            let tokens = self.estimator.estimate(&text[start..end]);
            if tokens <= self.budget.chunk_tokens {
                units.push(Unit { start, end, tokens });
            } else {
                self.hard_split(text, start, end, &mut units);
            }
        }
        units
    }

    fn hard_split(&self, text: &str, start: usize, end: usize, units: &mut Vec<Unit>) {
        // No character costs more than one token, and a piece of whitespace-free
        // text counts as one word, so `budget` characters always fit.
        let max_chars = self.budget.chunk_tokens;
        let mut piece_start = start;
        let mut count = 0;
        for (offset, _) in text[start..end].char_indices() {
            if count == max_chars {
                let at = start + offset;
                units.push(self.unit(text, piece_start, at));
                piece_start = at;
                count = 0;
            }
            count += 1;
        }
        if piece_start < end {
            units.push(self.unit(text, piece_start, end));
        }
    }

    fn unit(&self, text: &str, start: usize, end: usize) -> Unit {
        Unit {
            start,
            end,
            tokens: self.estimator.estimate(&text[start..end]),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Unit {
    start: usize,
    end: usize,
    tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_chunker(overlap: usize) -> Chunker {
        // 300 input - 200 margin - template = just under 100 tokens of text.
        let profile = ModelProfile::new(300, 100, 60, 200);
        Chunker::new("gpt-4o", &profile, "Extract.", overlap).unwrap()
    }

    #[test]
    fn short_text_is_one_chunk() {
        let c = small_chunker(10);
        let chunks = c.split_text("A short paragraph.");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].origin, ChunkOrigin::Chars { start: 0, end: 18 });
    }

    #[test]
    fn whitespace_only_yields_nothing() {
        assert!(small_chunker(10).split_text(" \n\t ").is_empty());
    }

    #[test]
    fn chunks_respect_budget_and_overlap() {
        let c = small_chunker(10);
        let text = (0..400).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let chunks = c.split_text(&text);
        assert!(chunks.len() > 3);
        for chunk in &chunks {
            assert!(chunk.estimated_tokens <= c.budget().chunk_tokens);
        }
        for pair in chunks.windows(2) {
            let (ChunkOrigin::Chars { end: prev_end, start: prev_start }, ChunkOrigin::Chars { start, .. }) =
                (pair[0].origin, pair[1].origin)
            else {
                panic!("token chunks carry char origins");
            };
            assert!(start < prev_end, "consecutive chunks overlap");
            assert!(start > prev_start, "chunks advance");
        }
    }

    #[test]
    fn giant_word_is_hard_split() {
        let c = small_chunker(0);
        let text = "x".repeat(1_000);
        let chunks = c.split_text(&text);
        assert!(chunks.len() > 1);
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn template_too_large_is_rejected() {
        let profile = ModelProfile::new(100, 50, 50, 80);
        let template = "word ".repeat(100);
        let err = Chunker::new("gpt-4", &profile, &template, 0).unwrap_err();
        assert!(matches!(err, PipelineError::PromptTooLarge { .. }));
    }

    #[test]
    fn pages_grouped_and_blank_groups_skipped() {
        let c = small_chunker(0);
        let segments: Vec<PageSegment> = ["p1", "p2", "", "", "p5"]
            .iter()
            .enumerate()
            .map(|(i, t)| PageSegment::ok(PageRange::single(i + 1), *t))
            .collect();
        let chunks = c.split_pages(&segments, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "p1\n\np2");
        assert_eq!(chunks[1].origin, ChunkOrigin::Pages(PageRange::new(5, 5)));
        assert_eq!(chunks[1].index, 1);
    }
}
