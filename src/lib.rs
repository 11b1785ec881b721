//! # docextract
//!
//! Extract structured records from long documents with OCR and an LLM, and
//! compare two documents record by record.
//!
//! ## Why chunked map-reduce?
//!
//! A scanned policy manual is far larger than any model's context window, and
//! one bad reply should not sink a 200-page job. The document is OCR'd in
//! parallel page ranges, cut into chunks sized against the model's input
//! budget, and each chunk is sent on its own. Replies are parsed tolerantly;
//! a failed chunk is recorded and skipped. The surviving records are
//! deduplicated (chunks overlap) and written to a spreadsheet.
//!
//! ## Pipeline Overview
//!
//! ```text
//! Source (path / URL / upload)
//!  │
//!  ├─ 1. Read       pdfium split + parallel OCR, reassembled by page
//!  ├─ 2. Chunk      token-budget windows with overlap, or page groups
//!  ├─ 3. Generate   one LLM call per chunk, retried on transient errors
//!  ├─ 4. Parse      JSON records recovered from free-form replies
//!  ├─ 5. Reconcile  dedup (extraction) or align + classify (comparison)
//!  └─ 6. Write      .xlsx artifact + preview + job report
//! ```
//!
//! Progress for every job lives in a [`ProgressStore`] keyed by
//! [`SessionId`]; poll it with [`ProgressStore::snapshot`] or follow it with
//! [`progress_stream`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docextract::{
//!     Credentials, ExtractionJob, JobSource, Pipeline, PipelineConfig, ProgressStore,
//!     ProviderSelection,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(ProgressStore::new());
//!     let pipeline = Pipeline::new(PipelineConfig::default(), Credentials::from_env(), store.clone());
//!     let session = store.create();
//!     let result = pipeline
//!         .run_extraction(
//!             session,
//!             ExtractionJob {
//!                 source: JobSource::from("manual.pdf"),
//!                 instruction: None,
//!                 selection: ProviderSelection::new("gemini", "gemini-1.5-pro-latest"),
//!             },
//!         )
//!         .await?;
//!     println!("{} rows → {}", result.record_count(), result.artifact.path.display());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docextract` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod provider;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ChunkingMode, ComparisonKey, Credentials, ExtractionSchema, GenerationOptions, ModelProfile,
    PipelineConfig, PipelineConfigBuilder, ProviderKind, ProviderSelection,
};
pub use error::{ChunkError, ErrorKind, GenerateError, PipelineError};
pub use orchestrator::{ComparisonJob, ComparisonSource, ExtractionJob, Pipeline};
pub use output::{ChangeKind, ComparisonPair, JobKind, JobReport, JobResult, Record, Table};
pub use pipeline::input::JobSource;
pub use progress::{
    JobStage, JobStatus, NoopProgressSink, ProgressSink, ProgressStore, SessionId, SessionSnapshot,
};
pub use provider::{Generation, GenerationClient, TextGenerator};
pub use stream::{progress_stream, sse_event, ProgressStream};
