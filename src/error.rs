//! Error types for the docextract library.
//!
//! Errors are split by how far they are allowed to travel:
//!
//! * [`PipelineError`]: **Job-fatal**: the job cannot deliver its artifact
//!   (missing credentials, unreadable source, zero chunks, spreadsheet write
//!   failure). The orchestrator publishes these as the session's `failed`
//!   state.
//!
//! * [`ChunkError`]: **Non-fatal**: one chunk's generate step failed. The
//!   chunk contributes zero records, the error is kept in the job report, and
//!   the loop moves on to the next chunk.
//!
//! * [`GenerateError`] and [`OcrError`] describe failures of the two external
//!   collaborators. Where they end up (fatal or tolerated) depends on the
//!   stage that raised them.
//!
//! * [`MaterializeError`]: the tabular writer failed; always surfaced as
//!   [`PipelineError::MaterializationFailed`].

use std::path::PathBuf;
use thiserror::Error;

/// All job-fatal errors returned by the docextract library.
///
/// Per-chunk failures use [`ChunkError`] and are stored in
/// [`crate::output::JobReport`] rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Source file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is neither a PDF nor plain text.
    #[error("Unsupported source '{path}': expected a PDF or a UTF-8 text file (first bytes: {magic:?})")]
    UnsupportedSource { path: PathBuf, magic: [u8; 4] },

    // ── Source read errors ────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// Every OCR page range failed; there is no text at all.
    #[error("OCR failed for all {segments} page range(s).\nFirst error: {first_error}")]
    SourceReadFailed { segments: usize, first_error: String },

    /// The source produced no usable text, so zero chunks exist.
    #[error("No content: '{source_name}' produced no extractable text")]
    NoContent { source_name: String },

    /// A record source (spreadsheet or JSON) could not be loaded.
    #[error("Failed to read records from '{path}': {detail}")]
    RecordSourceFailed { path: PathBuf, detail: String },

    // ── Configuration errors ──────────────────────────────────────────────
    /// The selected provider is missing credentials or could not be created.
    #[error("Provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// The selected model is not offered for the selected provider.
    #[error("Unsupported model '{model}' for provider '{provider}'")]
    UnsupportedModel { provider: String, model: String },

    /// The instruction alone leaves no room for document text.
    #[error(
        "Instruction too large for model '{model}': {template_tokens} template tokens \
         + {safety_margin} reserved exceed the {max_input} token input limit"
    )]
    PromptTooLarge {
        model: String,
        template_tokens: usize,
        safety_margin: usize,
        max_input: usize,
    },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Output errors ─────────────────────────────────────────────────────
    /// The spreadsheet artifact could not be rendered.
    #[error("Failed to write artifact '{path}': {source}")]
    MaterializationFailed {
        path: PathBuf,
        #[source]
        source: MaterializeError,
    },

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
         Set PDFIUM_LIB_PATH=/path/to/libpdfium (or its directory) or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of [`PipelineError`], matching the error taxonomy
/// exposed to callers of the job API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    SourceRead,
    NoContent,
    Materialization,
    Internal,
}

impl PipelineError {
    /// Which part of the taxonomy this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::ProviderNotConfigured { .. }
            | PipelineError::UnsupportedModel { .. }
            | PipelineError::PromptTooLarge { .. }
            | PipelineError::InvalidConfig(_)
            | PipelineError::PdfiumBindingFailed(_) => ErrorKind::Configuration,
            PipelineError::NoContent { .. } => ErrorKind::NoContent,
            PipelineError::MaterializationFailed { .. } => ErrorKind::Materialization,
            PipelineError::Internal(_) => ErrorKind::Internal,
            _ => ErrorKind::SourceRead,
        }
    }
}

impl From<GenerateError> for PipelineError {
    /// Only reached while building a client, so every variant is treated as
    /// a configuration problem.
    fn from(e: GenerateError) -> Self {
        match e {
            GenerateError::UnsupportedModel { provider, model } => {
                PipelineError::UnsupportedModel { provider, model }
            }
            GenerateError::CredentialsMissing { provider, hint } => {
                PipelineError::ProviderNotConfigured { provider, hint }
            }
            other => PipelineError::ProviderNotConfigured {
                provider: "unknown".into(),
                hint: other.to_string(),
            },
        }
    }
}

/// A non-fatal error for a single chunk.
///
/// Stored in [`crate::output::JobReport`] when a chunk fails. The job
/// continues with the next chunk.
#[derive(Debug, Clone, Error, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ChunkError {
    /// The generation call failed after retries.
    #[error("Chunk {chunk}: generation failed after {attempts} attempt(s): {detail}")]
    GenerationFailed {
        chunk: usize,
        attempts: u32,
        detail: String,
    },

    /// The provider refused to answer because of content filtering.
    #[error("Chunk {chunk}: blocked by provider content filter: {detail}")]
    ContentFiltered { chunk: usize, detail: String },

    /// Every attempt hit the per-call timeout.
    #[error("Chunk {chunk}: generation timed out after {secs}s")]
    Timeout { chunk: usize, secs: u64 },
}

impl ChunkError {
    /// 1-based chunk number the error belongs to.
    pub fn chunk(&self) -> usize {
        match self {
            ChunkError::GenerationFailed { chunk, .. }
            | ChunkError::ContentFiltered { chunk, .. }
            | ChunkError::Timeout { chunk, .. } => *chunk,
        }
    }
}

/// Failure of a single call to a generation backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GenerateError {
    /// Required credentials for the provider are absent.
    #[error("Credentials missing for provider '{provider}': {hint}")]
    CredentialsMissing { provider: String, hint: String },

    /// The model is not offered by the provider.
    #[error("Unsupported model '{model}' for provider '{provider}'")]
    UnsupportedModel { provider: String, model: String },

    /// HTTP 429, 5xx, or a transport failure. Worth retrying.
    #[error("Provider '{provider}' rate limit or network failure: {detail}")]
    RateLimitOrNetwork { provider: String, detail: String },

    /// Provider-side safety or content filtering blocked the reply.
    #[error("Provider '{provider}' blocked the request: {detail}")]
    ContentFiltered { provider: String, detail: String },

    /// The call exceeded its deadline.
    #[error("Generation call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Non-retryable API error (400, 401, 403, 404 …).
    #[error("Provider '{provider}' returned HTTP {status}: {detail}")]
    Api {
        provider: String,
        status: u16,
        detail: String,
    },

    /// The reply envelope did not have the expected shape.
    #[error("Provider '{provider}' returned an unexpected response: {detail}")]
    MalformedResponse { provider: String, detail: String },
}

impl GenerateError {
    /// Transient failures that a retry can plausibly fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerateError::RateLimitOrNetwork { .. } | GenerateError::Timeout { .. }
        )
    }

    /// Failures caused by configuration rather than the call itself.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            GenerateError::CredentialsMissing { .. } | GenerateError::UnsupportedModel { .. }
        )
    }
}

/// Failure of one OCR call. Tolerated per page range by the document reader.
#[derive(Debug, Error)]
pub enum OcrError {
    /// Transport or HTTP failure talking to the OCR service.
    #[error("OCR request failed: {0}")]
    Request(String),

    /// The service accepted the document but reported a failed analysis.
    #[error("OCR analysis failed: {0}")]
    AnalysisFailed(String),

    /// The call exceeded its deadline.
    #[error("OCR timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Reading the segment file failed.
    #[error("OCR segment I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure rendering a table to a spreadsheet artifact.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("spreadsheet writer error: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),

    #[error("table has {0} columns; the sheet format allows at most 16384")]
    TooManyColumns(usize),

    #[error("table has {0} rows; the sheet format allows at most 1048575 data rows")]
    TooManyRows(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
