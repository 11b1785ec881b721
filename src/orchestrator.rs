//! Job orchestration: source → chunks → per-chunk generation → records →
//! artifact, with progress published to the [`ProgressStore`].
//!
//! ## Lifecycle
//!
//! ```text
//! Created ─▶ ReadingSource ─▶ Chunking ─▶ Generating(i/n) ⇄ Parsing(i/n)
//!        ─▶ Reconciling ─▶ Materializing ─▶ Completed
//!                       (any non-terminal) ─▶ Failed
//! ```
//!
//! Only job-fatal errors reach `Failed`: configuration problems, a source
//! that cannot be read, zero chunks, or a failed artifact write. A chunk
//! whose generation fails is recorded in the [`JobReport`] and the loop moves
//! on; a reply that cannot be parsed contributes zero records.
//!
//! ## Progress
//!
//! | Percent | Stage |
//! |---|---|
//! | 2 | generation client ready |
//! | 5 → 35 | OCR, per finished page range |
//! | 40 | chunking |
//! | 45 → 90 | `45 + ⌊done/total × 45⌋` per chunk |
//! | 90 / 92 / 95 | reconciling / materializing / written |
//! | 100 | completed (published with the result) |
//!
//! A comparison job runs the read-and-generate stages twice, scaled into
//! 0–45 for the first document and 45–90 for the second.

use crate::config::{ChunkingMode, Credentials, ExtractionSchema, PipelineConfig, ProviderSelection};
use crate::error::PipelineError;
use crate::output::{ArtifactHandle, JobKind, JobReport, JobResult, Record, Table};
use crate::pipeline::chunk::{Chunk, Chunker};
use crate::pipeline::input::{resolve_source, source_stem, JobSource, ResolvedSource};
use crate::pipeline::llm::generate_chunk;
use crate::pipeline::materialize::{Materializer, XlsxMaterializer};
use crate::pipeline::ocr::{DocumentIntelligenceOcr, OcrEngine};
use crate::pipeline::parse::{parse_reply, preview};
use crate::pipeline::reader::{text_segments, DocumentReader, DocumentText};
use crate::pipeline::reconcile::{reconcile_comparison, reconcile_extraction};
use crate::pipeline::sheet::read_records;
use crate::pipeline::split::{PageSplitter, PdfiumSplitter};
use crate::progress::{JobStage, NoopProgressSink, ProgressSink, ProgressStore, SessionId};
use crate::prompts::{
    build_prompt, prompt_template, DEFAULT_COMPARISON_INSTRUCTION, DEFAULT_EXTRACTION_INSTRUCTION,
};
use crate::provider::{GenerationClient, TextGenerator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Characters of an unparseable reply kept in the log.
const REPLY_PREVIEW_CHARS: usize = 300;

/// Extract records from one document.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub source: JobSource,
    /// Defaults to [`DEFAULT_EXTRACTION_INSTRUCTION`].
    pub instruction: Option<String>,
    pub selection: ProviderSelection,
}

/// One side of a comparison.
#[derive(Debug, Clone)]
pub enum ComparisonSource {
    /// A document, run through extraction first.
    Document(JobSource),
    /// Records already in memory.
    Records { name: String, records: Vec<Record> },
    /// A workbook or JSON file of records, e.g. an earlier extraction artifact.
    Sheet(PathBuf),
}

impl ComparisonSource {
    fn name(&self) -> String {
        match self {
            ComparisonSource::Document(source) => source.display_name(),
            ComparisonSource::Records { name, .. } => name.clone(),
            ComparisonSource::Sheet(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    fn is_document(&self) -> bool {
        matches!(self, ComparisonSource::Document(_))
    }
}

/// Align the records of two sources and classify the differences.
#[derive(Debug, Clone)]
pub struct ComparisonJob {
    pub base: ComparisonSource,
    pub revised: ComparisonSource,
    /// Defaults to [`DEFAULT_COMPARISON_INSTRUCTION`].
    pub instruction: Option<String>,
    pub selection: ProviderSelection,
}

/// Maps a stage-local percent (0–100) into part of the overall range.
#[derive(Debug, Clone, Copy)]
struct Span {
    start: u8,
    width: u8,
}

impl Span {
    const FULL: Span = Span {
        start: 0,
        width: 100,
    };

    fn at(self, local: usize) -> u8 {
        let local = local.min(100);
        (usize::from(self.start) + local * usize::from(self.width) / 100) as u8
    }
}

/// Records from one document plus the accounting for them.
struct Extracted {
    records: Vec<Record>,
    report: JobReport,
}

/// Runs jobs and publishes their progress.
///
/// Collaborators default to the real adapters (pdfium, Document
/// Intelligence, the provider named in the job, `.xlsx` output); each can be
/// replaced with `with_*`.
pub struct Pipeline {
    config: PipelineConfig,
    credentials: Credentials,
    store: Arc<ProgressStore>,
    splitter: Option<Arc<dyn PageSplitter>>,
    ocr: Option<Arc<dyn OcrEngine>>,
    generator: Option<Arc<dyn TextGenerator>>,
    materializer: Arc<dyn Materializer>,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig, credentials: Credentials, store: Arc<ProgressStore>) -> Self {
        Self {
            config,
            credentials,
            store,
            splitter: None,
            ocr: None,
            generator: None,
            materializer: Arc::new(XlsxMaterializer::default()),
            sink: Arc::new(NoopProgressSink),
        }
    }

    pub fn with_splitter(mut self, splitter: Arc<dyn PageSplitter>) -> Self {
        self.splitter = Some(splitter);
        self
    }

    pub fn with_ocr_engine(mut self, engine: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(engine);
        self
    }

    /// Use `generator` for every job instead of building one from the job's
    /// provider selection.
    pub fn with_generator(mut self, generator: Arc<dyn TextGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_materializer(mut self, materializer: Arc<dyn Materializer>) -> Self {
        self.materializer = materializer;
        self
    }

    /// Extra observer, notified alongside the store.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn store(&self) -> &Arc<ProgressStore> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // ── Submission ───────────────────────────────────────────────────────

    /// Start an extraction in the background and return its session.
    pub fn submit_extraction(self: &Arc<Self>, job: ExtractionJob) -> SessionId {
        let session = self.store.create();
        let worker = Arc::clone(self);
        self.spawn_guarded(session, async move {
            let _ = worker.run_extraction(session, job).await;
        });
        session
    }

    /// Start a comparison in the background and return its session.
    pub fn submit_comparison(self: &Arc<Self>, job: ComparisonJob) -> SessionId {
        let session = self.store.create();
        let worker = Arc::clone(self);
        self.spawn_guarded(session, async move {
            let _ = worker.run_comparison(session, job).await;
        });
        session
    }

    /// Run `job` on its own task; a panic there still fails the session.
    fn spawn_guarded<F>(self: &Arc<Self>, session: SessionId, job: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = tokio::spawn(job).await {
                error!("Session {}: job task aborted: {}", session.short(), e);
                store.fail(session, &format!("Internal error: {e}"));
            }
        });
    }

    // ── Jobs ─────────────────────────────────────────────────────────────

    /// Run an extraction to completion on the current task, publishing the
    /// outcome to `session`.
    pub async fn run_extraction(
        &self,
        session: SessionId,
        job: ExtractionJob,
    ) -> Result<Arc<JobResult>, PipelineError> {
        let start = Instant::now();
        info!("Session {}: extraction of {}", session.short(), job.source.display_name());
        let outcome = self.extraction(session, &job).await.map(Arc::new);
        self.publish(session, outcome, start)
    }

    /// Run a comparison to completion on the current task, publishing the
    /// outcome to `session`.
    pub async fn run_comparison(
        &self,
        session: SessionId,
        job: ComparisonJob,
    ) -> Result<Arc<JobResult>, PipelineError> {
        let start = Instant::now();
        info!(
            "Session {}: comparison of {} vs {}",
            session.short(),
            job.base.name(),
            job.revised.name()
        );
        let outcome = self.comparison(session, &job).await.map(Arc::new);
        self.publish(session, outcome, start)
    }

    fn publish(
        &self,
        session: SessionId,
        outcome: Result<Arc<JobResult>, PipelineError>,
        start: Instant,
    ) -> Result<Arc<JobResult>, PipelineError> {
        match &outcome {
            Ok(result) => {
                info!(
                    "Session {}: completed in {:?}, {} rows, {}/{} chunks ok",
                    session.short(),
                    start.elapsed(),
                    result.record_count(),
                    result.report.chunks_total - result.report.chunks_failed,
                    result.report.chunks_total
                );
                self.store.complete(session, Arc::clone(result));
                self.sink.update(session, 100, "Completed");
            }
            Err(e) => {
                error!("Session {}: failed ({:?}): {}", session.short(), e.kind(), e);
                self.store.fail(session, &e.to_string());
            }
        }
        outcome
    }

    async fn extraction(
        &self,
        session: SessionId,
        job: &ExtractionJob,
    ) -> Result<JobResult, PipelineError> {
        let instruction = job
            .instruction
            .as_deref()
            .unwrap_or(DEFAULT_EXTRACTION_INSTRUCTION);

        // ── Step 1: Fail fast on configuration ───────────────────────────
        let generator = self.generator_for(&job.selection)?;
        let chunker = self.chunker_for(&job.selection, instruction)?;
        self.report(session, JobStage::Created, 2, "Generation client ready");

        // ── Steps 2–4: Read, chunk, generate ─────────────────────────────
        let extracted = self
            .extract_document(session, &job.source, instruction, generator.as_ref(), &chunker, Span::FULL)
            .await?;

        // ── Step 5: Reconcile ────────────────────────────────────────────
        self.report(session, JobStage::Reconciling, 90, "Reconciling records");
        let mut report = extracted.report;
        let records = reconcile_extraction(extracted.records, &self.config.extraction);
        report.records_kept = records.len();
        debug!(
            "Session {}: {} records kept of {}",
            session.short(),
            report.records_kept,
            report.records_extracted
        );

        // ── Step 6: Materialize ──────────────────────────────────────────
        let table = Table::from_records(&records);
        let artifact = self.materialize(session, table, "extraction").await?;

        Ok(JobResult {
            kind: JobKind::Extraction,
            artifact,
            filename: format!("extraction_{}.xlsx", source_stem(&job.source.display_name())),
            preview: records,
            pairs: Vec::new(),
            report,
        })
    }

    async fn comparison(
        &self,
        session: SessionId,
        job: &ComparisonJob,
    ) -> Result<JobResult, PipelineError> {
        let instruction = job
            .instruction
            .as_deref()
            .unwrap_or(DEFAULT_COMPARISON_INSTRUCTION);

        let tools = if job.base.is_document() || job.revised.is_document() {
            let generator = self.generator_for(&job.selection)?;
            let chunker = self.chunker_for(&job.selection, instruction)?;
            self.report(session, JobStage::Created, 2, "Generation client ready");
            Some((generator, chunker))
        } else {
            None
        };

        let spans = [
            Span { start: 0, width: 50 },
            Span { start: 45, width: 50 },
        ];
        let mut report = JobReport::default();
        let mut sides: Vec<Vec<Record>> = Vec::with_capacity(2);

        for (side, span) in [&job.base, &job.revised].into_iter().zip(spans) {
            let records = match (side, &tools) {
                (ComparisonSource::Document(source), Some((generator, chunker))) => {
                    let extracted = self
                        .extract_document(session, source, instruction, generator.as_ref(), chunker, span)
                        .await?;
                    report.merge(extracted.report);
                    extracted.records
                }
                (ComparisonSource::Records { records, .. }, _) => records.clone(),
                (ComparisonSource::Sheet(path), _) => {
                    self.report(session, JobStage::ReadingSource, span.at(5), "Loading records");
                    load_sheet(path.clone()).await?
                }
                (ComparisonSource::Document(_), None) => {
                    return Err(PipelineError::Internal("no generator for document side".into()))
                }
            };
            let kept = reconcile_extraction(records, &ExtractionSchema::default());
            report.records_kept += kept.len();
            sides.push(kept);
        }
        let revised = sides.pop().unwrap_or_default();
        let base = sides.pop().unwrap_or_default();

        self.report(session, JobStage::Reconciling, 90, "Aligning records");
        let pairs = reconcile_comparison(base, revised, &self.config.comparison);
        info!("Session {}: {} comparison pairs", session.short(), pairs.len());

        let table = Table::from_comparison(
            &pairs,
            &self.config.comparison.category_field,
            &self.config.comparison.attribute_field,
        );
        let preview = table.to_records();
        let artifact = self.materialize(session, table, "comparison").await?;

        Ok(JobResult {
            kind: JobKind::Comparison,
            artifact,
            filename: format!(
                "comparison_{}_vs_{}.xlsx",
                source_stem(&job.base.name()),
                source_stem(&job.revised.name())
            ),
            preview,
            pairs,
            report,
        })
    }

    // ── Stages ───────────────────────────────────────────────────────────

    /// Read `source`, chunk it, and run every chunk through the generator.
    /// Stage percentages are mapped through `span`.
    async fn extract_document(
        &self,
        session: SessionId,
        source: &JobSource,
        instruction: &str,
        generator: &dyn TextGenerator,
        chunker: &Chunker,
        span: Span,
    ) -> Result<Extracted, PipelineError> {
        let mut report = JobReport::default();

        // ── Read ─────────────────────────────────────────────────────────
        self.report(session, JobStage::ReadingSource, span.at(5), "Reading source");
        let resolved = resolve_source(source, self.config.download_timeout_secs).await?;
        let name = resolved.name();
        let document = self.read(session, &resolved, span).await?;
        report.ocr_segments_failed = document.failed_segments();
        self.report(session, JobStage::ReadingSource, span.at(35), "Source read");

        // ── Chunk ────────────────────────────────────────────────────────
        self.report(session, JobStage::Chunking, span.at(40), "Chunking text");
        let chunks = match self.config.chunking {
            ChunkingMode::Tokens { .. } => chunker.split_text(&document.full_text()),
            ChunkingMode::Pages { pages_per_chunk } => {
                chunker.split_pages(&document.segments, pages_per_chunk)
            }
        };
        if chunks.is_empty() {
            return Err(PipelineError::NoContent { source_name: name });
        }
        info!(
            "Session {}: {} chunk(s) from {} ({} pages)",
            session.short(),
            chunks.len(),
            name,
            document.total_pages
        );

        // ── Generate + parse, one chunk at a time ────────────────────────
        let records = self
            .process_chunks(session, &chunks, instruction, generator, span, &mut report)
            .await;
        report.records_extracted = records.len();
        Ok(Extracted { records, report })
    }

    async fn read(
        &self,
        session: SessionId,
        resolved: &ResolvedSource,
        span: Span,
    ) -> Result<DocumentText, PipelineError> {
        let path = match resolved {
            ResolvedSource::Text { text, .. } => return Ok(text_segments(text)),
            ResolvedSource::Pdf { path, .. } => path,
        };

        let engine = match &self.ocr {
            Some(engine) => Arc::clone(engine),
            None => Arc::new(DocumentIntelligenceOcr::from_credentials(&self.credentials)?),
        };
        let splitter = match &self.splitter {
            Some(splitter) => Arc::clone(splitter),
            None => Arc::new(PdfiumSplitter::new(self.config.password.clone())),
        };
        let reader = DocumentReader::new(splitter, engine)
            .workers(self.config.ocr_workers)
            .pages_per_request(self.config.ocr_request_pages())
            .call_timeout(Duration::from_secs(self.config.ocr_timeout_secs));

        reader
            .read(path, |done, total| {
                let local = 5 + 30 * done / total.max(1);
                self.report(
                    session,
                    JobStage::ReadingSource,
                    span.at(local),
                    &format!("OCR {done}/{total} page ranges"),
                );
            })
            .await
    }

    /// The isolation boundary: a failed chunk is reported and skipped.
    async fn process_chunks(
        &self,
        session: SessionId,
        chunks: &[Chunk],
        instruction: &str,
        generator: &dyn TextGenerator,
        span: Span,
        report: &mut JobReport,
    ) -> Vec<Record> {
        let total = chunks.len();
        let mut records = Vec::new();
        report.chunks_total += total;

        for chunk in chunks {
            let done = chunk.index;
            let number = done + 1;
            let percent = span.at(45 + done * 45 / total);

            self.report(
                session,
                JobStage::Generating { done, total },
                percent,
                &format!("Processing chunk {number}/{total}"),
            );
            let prompt = build_prompt(instruction, &chunk.text);

            match generate_chunk(generator, number, &prompt, &self.config).await {
                Ok(generation) => {
                    if generation.truncated {
                        report.chunks_truncated += 1;
                        warn!(
                            "Session {}: chunk {number} reply truncated at the output limit",
                            session.short()
                        );
                    }
                    self.report(
                        session,
                        JobStage::Parsing { done, total },
                        percent,
                        &format!("Parsing chunk {number}/{total}"),
                    );
                    let parsed = parse_reply(&generation.text);
                    if parsed.outcome.is_failure() {
                        warn!(
                            "Session {}: chunk {number} ({}) yielded no records ({:?}); reply: {}",
                            session.short(),
                            chunk.origin,
                            parsed.outcome,
                            preview(&generation.text, REPLY_PREVIEW_CHARS)
                        );
                    }
                    if parsed.records.is_empty() {
                        report.chunks_empty += 1;
                    } else {
                        report.chunks_succeeded += 1;
                    }
                    debug!(
                        "Session {}: chunk {number} → {} records",
                        session.short(),
                        parsed.records.len()
                    );
                    self.sink
                        .on_chunk_complete(session, number, total, parsed.records.len());
                    records.extend(parsed.records);
                }
                Err(e) => {
                    warn!("Session {}: skipping chunk {number}: {}", session.short(), e);
                    self.sink.on_chunk_error(session, number, total, &e.to_string());
                    report.push_error(e);
                }
            }

            self.report(
                session,
                JobStage::Generating {
                    done: number,
                    total,
                },
                span.at(45 + number * 45 / total),
                &format!("Chunk {number}/{total} done"),
            );
        }
        records
    }

    async fn materialize(
        &self,
        session: SessionId,
        table: Table,
        prefix: &str,
    ) -> Result<ArtifactHandle, PipelineError> {
        self.report(session, JobStage::Materializing, 92, "Writing spreadsheet");
        let path = self.artifact_path(session, prefix);
        let materializer = Arc::clone(&self.materializer);
        let target = path.clone();

        let written = tokio::task::spawn_blocking(move || materializer.write(&table, &target))
            .await
            .map_err(|e| PipelineError::Internal(format!("Writer task panicked: {e}")))?;
        let artifact = written.map_err(|source| PipelineError::MaterializationFailed {
            path: path.clone(),
            source,
        })?;

        self.report(session, JobStage::Materializing, 95, "Spreadsheet written");
        Ok(artifact)
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn generator_for(
        &self,
        selection: &ProviderSelection,
    ) -> Result<Arc<dyn TextGenerator>, PipelineError> {
        if let Some(generator) = &self.generator {
            return Ok(Arc::clone(generator));
        }
        let client = GenerationClient::from_selection(selection, &self.credentials, &self.config)?;
        Ok(Arc::new(client))
    }

    fn chunker_for(
        &self,
        selection: &ProviderSelection,
        instruction: &str,
    ) -> Result<Chunker, PipelineError> {
        let overlap = match self.config.chunking {
            ChunkingMode::Tokens { overlap_tokens } => overlap_tokens,
            ChunkingMode::Pages { .. } => 0,
        };
        Chunker::new(
            &selection.model,
            &self.config.model_profile(&selection.model),
            &prompt_template(instruction),
            overlap,
        )
    }

    fn artifact_path(&self, session: SessionId, prefix: &str) -> PathBuf {
        let dir = self
            .config
            .output_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        dir.join(format!("{prefix}_{session}.xlsx"))
    }

    fn report(&self, session: SessionId, stage: JobStage, percent: u8, message: &str) {
        if self.store.advance(session, stage, percent, message) {
            self.sink.update(session, percent, message);
        }
    }
}

async fn load_sheet(path: PathBuf) -> Result<Vec<Record>, PipelineError> {
    tokio::task::spawn_blocking(move || read_records(Path::new(&path)))
        .await
        .map_err(|e| PipelineError::Internal(format!("Record loader panicked: {e}")))?
}
