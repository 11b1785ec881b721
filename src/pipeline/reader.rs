//! Document reader: source document → page-ordered text segments.
//!
//! ## Parallel OCR dispatch
//!
//! ```text
//!   split (spawn_blocking) ──► [range 1][range 2]…[range n]  temp PDFs
//!                                  │        │          │
//!                  Semaphore(ocr_workers) bounds calls in flight
//!                                  ▼        ▼          ▼
//!                            tokio::spawn(analyze + timeout)
//!                                  │  completion order is arbitrary
//!                                  ▼
//!                      sort by range start → segments
//! ```
//!
//! Each OCR call runs in a detached task that owns its temp file. If the
//! caller stops waiting (job abandoned), the task still runs to the end of
//! its call and drops the file, so nothing is left on disk. A range whose
//! split or OCR fails contributes an empty segment and a warning; only a
//! document where every range failed is an error.

use crate::error::{OcrError, PipelineError};
use crate::pipeline::ocr::OcrEngine;
use crate::pipeline::split::{PageRange, PageSplitter};
use futures::stream::{FuturesUnordered, StreamExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Text recovered for one page range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSegment {
    pub range: PageRange,
    pub text: String,
    /// Why the range contributed no text, if it failed.
    pub error: Option<String>,
}

impl PageSegment {
    pub fn ok(range: PageRange, text: impl Into<String>) -> Self {
        Self {
            range,
            text: text.into(),
            error: None,
        }
    }

    pub fn failed(range: PageRange, error: impl Into<String>) -> Self {
        Self {
            range,
            text: String::new(),
            error: Some(error.into()),
        }
    }
}

/// All segments of one document, ascending by range start.
#[derive(Debug, Clone, Default)]
pub struct DocumentText {
    pub segments: Vec<PageSegment>,
    pub total_pages: usize,
}

impl DocumentText {
    pub fn failed_segments(&self) -> usize {
        self.segments.iter().filter(|s| s.error.is_some()).count()
    }

    /// Segments joined with a blank line, skipping empty ones.
    pub fn full_text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Reads PDF sources through a splitter and an OCR engine.
#[derive(Clone)]
pub struct DocumentReader {
    splitter: Arc<dyn PageSplitter>,
    engine: Arc<dyn OcrEngine>,
    workers: usize,
    pages_per_request: usize,
    call_timeout: Duration,
}

impl DocumentReader {
    pub fn new(splitter: Arc<dyn PageSplitter>, engine: Arc<dyn OcrEngine>) -> Self {
        Self {
            splitter,
            engine,
            workers: 4,
            pages_per_request: 30,
            call_timeout: Duration::from_secs(300),
        }
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n.max(1);
        self
    }

    pub fn pages_per_request(mut self, n: usize) -> Self {
        self.pages_per_request = n.max(1);
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// OCR `source` range by range. `on_progress(done, total)` fires as each
    /// range finishes, in completion order.
    pub async fn read<F>(&self, source: &Path, on_progress: F) -> Result<DocumentText, PipelineError>
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        // ── Step 1: Split (blocking) ─────────────────────────────────────
        let splitter = Arc::clone(&self.splitter);
        let path = source.to_path_buf();
        let per_request = self.pages_per_request;
        let (total_pages, parts) = tokio::task::spawn_blocking(move || {
            let total = splitter.page_count(&path)?;
            let ranges = PageRange::partition(total, per_request);
            let parts = if ranges.is_empty() {
                Vec::new()
            } else {
                splitter.split(&path, &ranges)?
            };
            Ok::<_, PipelineError>((total, parts))
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("Split task panicked: {e}")))??;

        info!(
            "Reading {} pages in {} range(s), {} worker(s)",
            total_pages,
            parts.len(),
            self.workers
        );

        // ── Step 2: Dispatch OCR ─────────────────────────────────────────
        let total = parts.len();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut segments = Vec::with_capacity(total);
        let mut in_flight = FuturesUnordered::new();

        for (range, part) in parts {
            let file = match part {
                Ok(file) => file,
                Err(reason) => {
                    warn!("Split of {range} failed, continuing without it: {reason}");
                    segments.push(PageSegment::failed(range, reason));
                    continue;
                }
            };
            let engine = Arc::clone(&self.engine);
            let semaphore = Arc::clone(&semaphore);
            let timeout = self.call_timeout;

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = match tokio::time::timeout(timeout, engine.analyze(file.path(), range)).await {
                    Ok(result) => result,
                    Err(_) => Err(OcrError::Timeout {
                        secs: timeout.as_secs(),
                    }),
                };
                // Deletes the segment file whatever the outcome.
                drop(file);
                outcome
            });
            in_flight.push(async move { (range, handle.await) });
        }

        // Ranges that never reached OCR still count toward progress.
        let mut done = segments.len();
        if done > 0 {
            on_progress(done, total);
        }

        // ── Step 3: Collect in completion order ──────────────────────────
        while let Some((range, joined)) = in_flight.next().await {
            let segment = match joined {
                Ok(Ok(text)) => {
                    debug!("OCR {range} done ({} chars)", text.len());
                    PageSegment::ok(range, text)
                }
                Ok(Err(e)) => {
                    warn!("OCR failed for {range}, continuing with an empty segment: {e}");
                    PageSegment::failed(range, e.to_string())
                }
                Err(e) => {
                    warn!("OCR task for {range} panicked: {e}");
                    PageSegment::failed(range, format!("task panicked: {e}"))
                }
            };
            segments.push(segment);
            done += 1;
            on_progress(done, total);
        }

        // ── Step 4: Page order, never completion order ───────────────────
        segments.sort_by_key(|s| s.range.start);

        let document = DocumentText {
            segments,
            total_pages,
        };
        let failed = document.failed_segments();
        if total > 0 && failed == total {
            let first_error = document
                .segments
                .iter()
                .find_map(|s| s.error.clone())
                .unwrap_or_default();
            return Err(PipelineError::SourceReadFailed {
                segments: total,
                first_error,
            });
        }
        Ok(document)
    }
}

/// Segments for an already-extracted text source. Form feeds mark page
/// breaks; text without any is one page.
pub fn text_segments(text: &str) -> DocumentText {
    let segments: Vec<PageSegment> = text
        .split('\u{c}')
        .enumerate()
        .map(|(i, page)| PageSegment::ok(PageRange::single(i + 1), page))
        .collect();
    DocumentText {
        total_pages: segments.len(),
        segments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_feeds_become_pages() {
        let doc = text_segments("one\u{c}two\u{c}three");
        assert_eq!(doc.total_pages, 3);
        assert_eq!(doc.segments[1].range, PageRange::single(2));
        assert_eq!(doc.segments[2].text, "three");
    }

    #[test]
    fn full_text_skips_blank_segments() {
        let doc = DocumentText {
            segments: vec![
                PageSegment::ok(PageRange::single(1), "a"),
                PageSegment::failed(PageRange::single(2), "boom"),
                PageSegment::ok(PageRange::single(3), "c\n"),
            ],
            total_pages: 3,
        };
        assert_eq!(doc.full_text(), "a\n\nc");
        assert_eq!(doc.failed_segments(), 1);
    }
}
