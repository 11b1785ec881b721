//! Splitting a PDF into page-range sub-documents for OCR.
//!
//! Each range is written to its own temporary PDF so the OCR collaborator can
//! receive it as an independent upload. The temp file is owned by the
//! [`NamedTempFile`] handle: dropping the handle deletes the file, which is
//! how the reader guarantees cleanup whatever the OCR outcome.
//!
//! pdfium is synchronous and not `Send`-friendly across awaits, so the
//! splitter is a blocking trait and callers run it under
//! `tokio::task::spawn_blocking`.

use crate::error::PipelineError;
use pdfium_render::prelude::*;
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Inclusive, 1-based page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct PageRange {
    pub start: usize,
    pub end: usize,
}

impl PageRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn single(page: usize) -> Self {
        Self::new(page, page)
    }

    /// Number of pages covered.
    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Cut `total_pages` into consecutive ranges of at most `per_range` pages.
    pub fn partition(total_pages: usize, per_range: usize) -> Vec<PageRange> {
        let per = per_range.max(1);
        (1..=total_pages)
            .step_by(per)
            .map(|start| PageRange::new(start, (start + per - 1).min(total_pages)))
            .collect()
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "page {}", self.start)
        } else {
            write!(f, "pages {}-{}", self.start, self.end)
        }
    }
}

/// Outcome of writing one range: the temp document or why it failed.
pub type SplitPart = (PageRange, Result<NamedTempFile, String>);

/// Blocking page-range splitter.
pub trait PageSplitter: Send + Sync {
    /// Total pages in the source document.
    fn page_count(&self, source: &Path) -> Result<usize, PipelineError>;

    /// Write one temp document per range. A failing range is reported in its
    /// slot; only a source that cannot be opened fails the whole call.
    fn split(&self, source: &Path, ranges: &[PageRange]) -> Result<Vec<SplitPart>, PipelineError>;
}

/// [`PageSplitter`] backed by pdfium.
#[derive(Clone, Default)]
pub struct PdfiumSplitter {
    password: Option<String>,
}

impl fmt::Debug for PdfiumSplitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdfiumSplitter")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl PdfiumSplitter {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }

    /// The document borrows both the bindings and the stored password.
    fn open<'a>(&'a self, pdfium: &'a Pdfium, source: &Path) -> Result<PdfDocument<'a>, PipelineError> {
        pdfium
            .load_pdf_from_file(source, self.password.as_deref())
            .map_err(|e| map_load_error(e, source, self.password.is_some()))
    }
}

impl PageSplitter for PdfiumSplitter {
    fn page_count(&self, source: &Path) -> Result<usize, PipelineError> {
        let pdfium = bind_pdfium()?;
        let document = self.open(&pdfium, source)?;
        Ok(document.pages().len() as usize)
    }

    fn split(&self, source: &Path, ranges: &[PageRange]) -> Result<Vec<SplitPart>, PipelineError> {
        let pdfium = bind_pdfium()?;
        let document = self.open(&pdfium, source)?;

        let parts = ranges
            .iter()
            .map(|range| {
                let written = write_range(&pdfium, &document, *range);
                if let Err(e) = &written {
                    debug!("Split of {range} failed: {e}");
                }
                (*range, written)
            })
            .collect();
        Ok(parts)
    }
}

fn write_range(pdfium: &Pdfium, source: &PdfDocument, range: PageRange) -> Result<NamedTempFile, String> {
    let first = u16::try_from(range.start - 1).map_err(|_| format!("{range} out of range"))?;
    let last = u16::try_from(range.end - 1).map_err(|_| format!("{range} out of range"))?;

    let mut part = pdfium.create_new_pdf().map_err(|e| format!("{e:?}"))?;
    part.pages_mut()
        .copy_page_range_from_document(source, first..=last, 0)
        .map_err(|e| format!("copy {range}: {e:?}"))?;

    let file = tempfile::Builder::new()
        .prefix("docextract-segment-")
        .suffix(".pdf")
        .tempfile()
        .map_err(|e| format!("temp file: {e}"))?;
    part.save_to_file(file.path())
        .map_err(|e| format!("save {range}: {e:?}"))?;
    Ok(file)
}

/// Bind to pdfium: `PDFIUM_LIB_PATH` (file or directory) first, then the
/// system library.
pub fn bind_pdfium() -> Result<Pdfium, PipelineError> {
    let bindings = match std::env::var_os("PDFIUM_LIB_PATH") {
        Some(path) => {
            let path = PathBuf::from(path);
            let lib = if path.is_dir() {
                path.join(PLATFORM_LIBRARY_NAME)
            } else {
                path
            };
            Pdfium::bind_to_library(&lib)
        }
        None => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| PipelineError::PdfiumBindingFailed(format!("{e:?}")))?;
    Ok(Pdfium::new(bindings))
}

#[cfg(target_os = "windows")]
const PLATFORM_LIBRARY_NAME: &str = "pdfium.dll";
#[cfg(target_os = "macos")]
const PLATFORM_LIBRARY_NAME: &str = "libpdfium.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const PLATFORM_LIBRARY_NAME: &str = "libpdfium.so";

fn map_load_error(e: PdfiumError, path: &Path, has_password: bool) -> PipelineError {
    let msg = format!("{e:?}");
    if msg.contains("Password") || msg.contains("password") {
        if has_password {
            PipelineError::WrongPassword {
                path: path.to_path_buf(),
            }
        } else {
            PipelineError::PasswordRequired {
                path: path.to_path_buf(),
            }
        }
    } else {
        PipelineError::CorruptPdf {
            path: path.to_path_buf(),
            detail: msg,
        }
    }
}
