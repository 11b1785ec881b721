//! Source resolution: turn a job's input into something the reader can open.
//!
//! A source arrives as a local path, an `http(s)` URL, or an uploaded byte
//! buffer. PDFs end up as a file on disk because pdfium only opens paths;
//! URL and byte sources are written into a `TempDir` that lives as long as
//! the [`ResolvedSource`]. Plain-text sources skip OCR entirely.
//!
//! The `%PDF` magic is checked before returning so callers get a clear
//! error instead of a pdfium failure later.

use crate::error::PipelineError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

const TEXT_EXTENSIONS: &[&str] = &["txt", "text", "md"];

/// Where a job's document comes from.
#[derive(Debug, Clone)]
pub enum JobSource {
    /// Local path or `http(s)` URL.
    Location(String),
    /// Uploaded content with its original file name.
    Bytes { name: String, bytes: Vec<u8> },
}

impl JobSource {
    /// File name used for output naming.
    pub fn display_name(&self) -> String {
        match self {
            JobSource::Location(loc) if is_url(loc) => url_filename(loc)
                .unwrap_or_else(|| "downloaded.pdf".to_string()),
            JobSource::Location(loc) => Path::new(loc)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| loc.clone()),
            JobSource::Bytes { name, .. } => name.clone(),
        }
    }
}

impl From<&str> for JobSource {
    fn from(s: &str) -> Self {
        JobSource::Location(s.to_string())
    }
}

/// A source ready for reading.
#[derive(Debug)]
pub enum ResolvedSource {
    /// A PDF on disk. `_temp` keeps a downloaded or uploaded copy alive.
    Pdf {
        path: PathBuf,
        _temp: Option<TempDir>,
    },
    /// Already text; no OCR needed.
    Text { name: String, text: String },
}

impl ResolvedSource {
    pub fn name(&self) -> String {
        match self {
            ResolvedSource::Pdf { path, .. } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            ResolvedSource::Text { name, .. } => name.clone(),
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// File name without extension, for output naming. Falls back to
/// `"document"` when nothing usable remains.
pub fn source_stem(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.trim_matches('_').is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}

/// Resolve `source` to a readable document.
pub async fn resolve_source(
    source: &JobSource,
    download_timeout_secs: u64,
) -> Result<ResolvedSource, PipelineError> {
    match source {
        JobSource::Location(loc) if is_url(loc) => download_url(loc, download_timeout_secs).await,
        JobSource::Location(loc) => resolve_local(loc).await,
        JobSource::Bytes { name, bytes } => from_bytes(name, bytes).await,
    }
}

fn is_text_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| TEXT_EXTENSIONS.iter().any(|t| e.eq_ignore_ascii_case(t)))
}

fn check_magic(path: PathBuf, bytes: &[u8]) -> Result<PathBuf, PipelineError> {
    if bytes.len() >= 4 && &bytes[..4] != b"%PDF" {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        return Err(PipelineError::UnsupportedSource { path, magic });
    }
    Ok(path)
}

async fn resolve_local(path_str: &str) -> Result<ResolvedSource, PipelineError> {
    let path = PathBuf::from(path_str);
    if !path.exists() {
        return Err(PipelineError::FileNotFound { path });
    }

    if is_text_name(path_str) {
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| io_error(path.clone(), e))?;
        debug!("Resolved text source: {}", path.display());
        return Ok(ResolvedSource::Text {
            name: JobSource::Location(path_str.to_string()).display_name(),
            text,
        });
    }

    let mut head = [0u8; 4];
    match std::fs::File::open(&path) {
        Ok(mut f) => {
            use std::io::Read;
            if f.read_exact(&mut head).is_ok() {
                check_magic(path.clone(), &head)?;
            }
        }
        Err(e) => return Err(io_error(path, e)),
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedSource::Pdf { path, _temp: None })
}

fn io_error(path: PathBuf, e: std::io::Error) -> PipelineError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        PipelineError::PermissionDenied { path }
    } else {
        PipelineError::FileNotFound { path }
    }
}

async fn from_bytes(name: &str, bytes: &[u8]) -> Result<ResolvedSource, PipelineError> {
    if is_text_name(name) {
        return Ok(ResolvedSource::Text {
            name: name.to_string(),
            text: String::from_utf8_lossy(bytes).into_owned(),
        });
    }
    let file_name = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "upload.pdf".to_string());
    write_temp(&file_name, bytes).await
}

async fn write_temp(file_name: &str, bytes: &[u8]) -> Result<ResolvedSource, PipelineError> {
    let temp_dir = TempDir::new().map_err(|e| PipelineError::Internal(e.to_string()))?;
    let path = temp_dir.path().join(file_name);
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| PipelineError::Internal(format!("Failed to write temp file: {e}")))?;
    let path = check_magic(path, bytes)?;
    Ok(ResolvedSource::Pdf {
        path,
        _temp: Some(temp_dir),
    })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedSource, PipelineError> {
    info!("Downloading source from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let failed = |e: reqwest::Error| {
        if e.is_timeout() {
            PipelineError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            PipelineError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };

    let response = client.get(url).send().await.map_err(failed)?;
    if !response.status().is_success() {
        return Err(PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }
    let bytes = response.bytes().await.map_err(failed)?;

    let file_name = url_filename(url).unwrap_or_else(|| "downloaded.pdf".to_string());
    if is_text_name(&file_name) {
        return Ok(ResolvedSource::Text {
            name: file_name,
            text: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    let resolved = write_temp(&file_name, &bytes).await?;
    info!("Downloaded {} bytes from {}", bytes.len(), url);
    Ok(resolved)
}

/// Last path segment of `url` when it looks like a file name.
fn url_filename(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    (!last.is_empty() && last.contains('.')).then(|| last.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn stems_are_file_safe() {
        assert_eq!(source_stem("Q3 report.pdf"), "Q3_report");
        assert_eq!(source_stem("/a/b/policy-v2.PDF"), "policy-v2");
        assert_eq!(source_stem(""), "document");
        assert_eq!(source_stem("..."), "document");
    }

    #[test]
    fn display_name_from_url() {
        let src = JobSource::from("https://example.com/files/rules.pdf?x=1");
        assert_eq!(src.display_name(), "rules.pdf");
        assert_eq!(
            JobSource::from("https://example.com/").display_name(),
            "downloaded.pdf"
        );
    }

    #[tokio::test]
    async fn missing_file_is_reported() {
        let err = resolve_source(&JobSource::from("/nonexistent/x.pdf"), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::FileNotFound { .. }));
    }

    #[tokio::test]
    async fn text_files_skip_ocr() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "rule one\nrule two").unwrap();
        let resolved = resolve_source(&JobSource::from(path.to_str().unwrap()), 5)
            .await
            .unwrap();
        match resolved {
            ResolvedSource::Text { name, text } => {
                assert_eq!(name, "notes.md");
                assert!(text.contains("rule two"));
            }
            other => panic!("expected text source, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_pdf_bytes_rejected() {
        let err = resolve_source(
            &JobSource::Bytes {
                name: "scan.pdf".into(),
                bytes: b"PK\x03\x04zip".to_vec(),
            },
            5,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::UnsupportedSource { magic, .. } if &magic == b"PK\x03\x04"
        ));
    }

    #[tokio::test]
    async fn pdf_bytes_land_in_temp_dir() {
        let resolved = resolve_source(
            &JobSource::Bytes {
                name: "upload.pdf".into(),
                bytes: b"%PDF-1.7\n".to_vec(),
            },
            5,
        )
        .await
        .unwrap();
        let ResolvedSource::Pdf { path, _temp } = &resolved else {
            panic!("expected pdf");
        };
        assert!(path.exists());
        let kept = path.clone();
        drop(resolved);
        assert!(!kept.exists());
    }
}
