//! End-to-end orchestrator tests against in-process fakes.
//!
//! No network, OCR service, pdfium, or LLM is needed: every collaborator is
//! replaced through the `Pipeline::with_*` seams.

use async_trait::async_trait;
use docextract::error::{MaterializeError, OcrError};
use docextract::output::ArtifactHandle;
use docextract::pipeline::materialize::Materializer;
use docextract::pipeline::ocr::OcrEngine;
use docextract::pipeline::reader::DocumentReader;
use docextract::pipeline::split::{PageRange, PageSplitter, SplitPart};
use docextract::{
    progress_stream, ChangeKind, ChunkingMode, ComparisonJob, ComparisonSource, Credentials,
    ErrorKind, ExtractionJob, GenerateError, Generation, GenerationOptions, JobSource, JobStatus,
    Pipeline, PipelineConfig, PipelineError, ProgressStore, ProviderSelection, Record, Table,
    TextGenerator,
};
use futures::StreamExt;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};

// ── Fakes ────────────────────────────────────────────────────────────────

/// Answers each prompt with one record naming the page marker it saw.
/// Prompts containing a marker listed in `fail_on` get a non-retryable error.
#[derive(Default)]
struct EchoGenerator {
    fail_on: Vec<&'static str>,
    calls: AtomicUsize,
}

#[async_trait]
impl TextGenerator for EchoGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _options: &GenerationOptions,
    ) -> Result<Generation, GenerateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.iter().any(|m| prompt.contains(m)) {
            return Err(GenerateError::Api {
                provider: "echo".into(),
                status: 400,
                detail: "rejected".into(),
            });
        }
        let markers: Vec<&str> = prompt
            .split_whitespace()
            .filter(|w| w.starts_with("PAGE"))
            .collect();
        let records: Vec<_> = markers
            .iter()
            .map(|m| json!({"Category": "Pages", "Attribute": m, "rule": format!("rule from {m}")}))
            .collect();
        Ok(Generation {
            text: format!("Here you go:\n```json\n{}\n```", json!(records)),
            ..Default::default()
        })
    }

    fn label(&self) -> String {
        "echo".into()
    }
}

/// Pretends the PDF has `pages` pages; writes a real temp file per range.
struct FakeSplitter {
    pages: usize,
    written: Mutex<Vec<PathBuf>>,
}

impl FakeSplitter {
    fn new(pages: usize) -> Self {
        Self {
            pages,
            written: Mutex::new(Vec::new()),
        }
    }
}

impl PageSplitter for FakeSplitter {
    fn page_count(&self, _source: &Path) -> Result<usize, PipelineError> {
        Ok(self.pages)
    }

    fn split(&self, _source: &Path, ranges: &[PageRange]) -> Result<Vec<SplitPart>, PipelineError> {
        Ok(ranges
            .iter()
            .map(|&range| {
                let file = NamedTempFile::new().map_err(|e| e.to_string());
                if let Ok(f) = &file {
                    self.written.lock().unwrap().push(f.path().to_path_buf());
                }
                (range, file)
            })
            .collect())
    }
}

/// OCR that returns one marker word per page. Earlier ranges take longer,
/// so completion order is the reverse of page order.
struct FakeOcr {
    fail_start: Option<usize>,
    calls: AtomicUsize,
}

impl FakeOcr {
    fn new(fail_start: Option<usize>) -> Self {
        Self {
            fail_start,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OcrEngine for FakeOcr {
    async fn analyze(&self, segment: &Path, range: PageRange) -> Result<String, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(segment.exists(), "segment file must exist during OCR");
        tokio::time::sleep(Duration::from_millis(60 / range.start as u64)).await;
        if self.fail_start == Some(range.start) {
            return Err(OcrError::AnalysisFailed("service unavailable".into()));
        }
        Ok((range.start..=range.end)
            .map(|p| format!("PAGE{p} text"))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

/// OCR that records the peak number of calls in flight at once.
#[derive(Default)]
struct PeakOcr {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl OcrEngine for PeakOcr {
    async fn analyze(&self, _segment: &Path, range: PageRange) -> Result<String, OcrError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("PAGE{} text", range.start))
    }
}

struct BrokenMaterializer;

impl Materializer for BrokenMaterializer {
    fn write(&self, _table: &Table, _path: &Path) -> Result<ArtifactHandle, MaterializeError> {
        Err(MaterializeError::TooManyColumns(20_000))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn page_config(out: &TempDir) -> PipelineConfig {
    PipelineConfig::builder()
        .chunking(ChunkingMode::Pages { pages_per_chunk: 1 })
        .max_retries(0)
        .retry_backoff_ms(1)
        .output_dir(out.path())
        .build()
        .unwrap()
}

fn selection() -> ProviderSelection {
    ProviderSelection::new("gemini", "gemini-1.5-pro-latest")
}

fn five_page_text() -> JobSource {
    let text = (1..=5)
        .map(|p| format!("PAGE{p} body"))
        .collect::<Vec<_>>()
        .join("\u{c}");
    JobSource::Bytes {
        name: "manual.txt".into(),
        bytes: text.into_bytes(),
    }
}

fn pdf_source() -> JobSource {
    JobSource::Bytes {
        name: "scan.pdf".into(),
        bytes: b"%PDF-1.7\n%fake\n".to_vec(),
    }
}

fn extraction(source: JobSource) -> ExtractionJob {
    ExtractionJob {
        source,
        instruction: Some("List the rules as JSON.".into()),
        selection: selection(),
    }
}

fn rec(v: serde_json::Value) -> Record {
    v.as_object().cloned().unwrap()
}

// ── Extraction ───────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_chunk_is_skipped_and_job_completes() {
    let out = tempfile::tempdir().unwrap();
    let store = Arc::new(ProgressStore::new());
    let generator = Arc::new(EchoGenerator {
        fail_on: vec!["PAGE3"],
        ..Default::default()
    });
    let pipeline = Pipeline::new(page_config(&out), Credentials::default(), Arc::clone(&store))
        .with_generator(generator.clone());

    let session = store.create();
    let result = pipeline
        .run_extraction(session, extraction(five_page_text()))
        .await
        .unwrap();

    assert_eq!(generator.calls.load(Ordering::SeqCst), 5);
    assert_eq!(result.report.chunks_total, 5);
    assert_eq!(result.report.chunks_failed, 1);
    assert_eq!(result.report.errors[0].chunk(), 3);
    let attributes: Vec<_> = result.preview.iter().map(|r| r["Attribute"].clone()).collect();
    assert_eq!(attributes, vec![json!("PAGE1"), json!("PAGE2"), json!("PAGE4"), json!("PAGE5")]);
    assert_eq!(result.filename, "extraction_manual.xlsx");
    assert!(result.artifact.path.exists());
    assert!(result.artifact.path.starts_with(out.path()));

    let snap = store.snapshot(session).unwrap();
    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.progress(), 100);
    assert!(snap.result.is_some());
}

#[tokio::test]
async fn blank_source_fails_with_no_content() {
    let out = tempfile::tempdir().unwrap();
    let store = Arc::new(ProgressStore::new());
    let generator = Arc::new(EchoGenerator::default());
    let pipeline = Pipeline::new(page_config(&out), Credentials::default(), Arc::clone(&store))
        .with_generator(generator.clone());

    let session = store.create();
    let err = pipeline
        .run_extraction(
            session,
            extraction(JobSource::Bytes {
                name: "blank.txt".into(),
                bytes: b"  \n\x0c \t ".to_vec(),
            }),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NoContent);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    let snap = store.snapshot(session).unwrap();
    assert_eq!(snap.status, JobStatus::Failed);
    assert_eq!(snap.progress(), -1);
    assert!(snap.error.unwrap().contains("blank.txt"));
}

#[tokio::test]
async fn progress_is_monotonic_and_ends_at_100() {
    let out = tempfile::tempdir().unwrap();
    let store = Arc::new(ProgressStore::new());
    let pipeline = Arc::new(
        Pipeline::new(page_config(&out), Credentials::default(), Arc::clone(&store))
            .with_generator(Arc::new(EchoGenerator::default())),
    );

    let session = pipeline.submit_extraction(extraction(five_page_text()));
    let percents: Vec<i32> = progress_stream(&store, session)
        .unwrap()
        .map(|s| s.progress())
        .collect()
        .await;

    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    assert_eq!(percents.last(), Some(&100));
    assert!(percents[..percents.len() - 1].iter().all(|p| *p < 100));
}

#[tokio::test]
async fn missing_credentials_fail_before_any_work() {
    let out = tempfile::tempdir().unwrap();
    let store = Arc::new(ProgressStore::new());
    let ocr = Arc::new(FakeOcr::new(None));
    let pipeline = Pipeline::new(page_config(&out), Credentials::default(), Arc::clone(&store))
        .with_splitter(Arc::new(FakeSplitter::new(4)))
        .with_ocr_engine(ocr.clone());

    let session = store.create();
    let err = pipeline
        .run_extraction(session, extraction(pdf_source()))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(matches!(err, PipelineError::ProviderNotConfigured { .. }));
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);
    assert_eq!(store.snapshot(session).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn materializer_failure_fails_the_job() {
    let out = tempfile::tempdir().unwrap();
    let store = Arc::new(ProgressStore::new());
    let pipeline = Pipeline::new(page_config(&out), Credentials::default(), Arc::clone(&store))
        .with_generator(Arc::new(EchoGenerator::default()))
        .with_materializer(Arc::new(BrokenMaterializer));

    let session = store.create();
    let err = pipeline
        .run_extraction(session, extraction(five_page_text()))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Materialization);
    let snap = store.snapshot(session).unwrap();
    assert_eq!(snap.status, JobStatus::Failed);
    assert!(snap.result.is_none());
}

#[tokio::test]
async fn pdf_source_tolerates_one_failed_ocr_range() {
    let out = tempfile::tempdir().unwrap();
    let store = Arc::new(ProgressStore::new());
    let config = PipelineConfig::builder()
        .chunking(ChunkingMode::Tokens { overlap_tokens: 0 })
        .ocr_pages_per_request(2)
        .output_dir(out.path())
        .build()
        .unwrap();
    let pipeline = Pipeline::new(config, Credentials::default(), Arc::clone(&store))
        .with_splitter(Arc::new(FakeSplitter::new(6)))
        .with_ocr_engine(Arc::new(FakeOcr::new(Some(3))))
        .with_generator(Arc::new(EchoGenerator::default()));

    let session = store.create();
    let result = pipeline
        .run_extraction(session, extraction(pdf_source()))
        .await
        .unwrap();

    assert_eq!(result.report.ocr_segments_failed, 1);
    let attributes: Vec<_> = result.preview.iter().map(|r| r["Attribute"].clone()).collect();
    assert_eq!(
        attributes,
        vec![json!("PAGE1"), json!("PAGE2"), json!("PAGE5"), json!("PAGE6")]
    );
}

#[tokio::test]
async fn pdf_page_mode_chunks_by_pages_per_chunk() {
    let out = tempfile::tempdir().unwrap();
    let store = Arc::new(ProgressStore::new());
    let config = PipelineConfig::builder()
        .chunking(ChunkingMode::Pages { pages_per_chunk: 2 })
        .max_retries(0)
        .output_dir(out.path())
        .build()
        .unwrap();
    let generator = Arc::new(EchoGenerator::default());
    let pipeline = Pipeline::new(config, Credentials::default(), Arc::clone(&store))
        .with_splitter(Arc::new(FakeSplitter::new(10)))
        .with_ocr_engine(Arc::new(FakeOcr::new(None)))
        .with_generator(generator.clone());

    let session = store.create();
    let result = pipeline
        .run_extraction(session, extraction(pdf_source()))
        .await
        .unwrap();

    assert_eq!(result.report.chunks_total, 5, "10 pages at 2 pages per chunk");
    assert_eq!(generator.calls.load(Ordering::SeqCst), 5);
    assert_eq!(result.record_count(), 10);
    assert_eq!(result.preview[0]["Attribute"], json!("PAGE1"));
    assert_eq!(result.preview[9]["Attribute"], json!("PAGE10"));
}

// ── Document reader ──────────────────────────────────────────────────────

#[tokio::test]
async fn reader_orders_by_page_and_removes_segment_files() {
    let splitter = Arc::new(FakeSplitter::new(7));
    let reader = DocumentReader::new(splitter.clone(), Arc::new(FakeOcr::new(None)))
        .workers(4)
        .pages_per_request(2);

    let progress = Mutex::new(Vec::new());
    let doc = reader
        .read(Path::new("ignored.pdf"), |done, total| {
            progress.lock().unwrap().push((done, total))
        })
        .await
        .unwrap();

    let starts: Vec<usize> = doc.segments.iter().map(|s| s.range.start).collect();
    assert_eq!(starts, vec![1, 3, 5, 7]);
    let text = doc.full_text();
    let positions: Vec<usize> = (1..=7)
        .map(|p| text.find(&format!("PAGE{p} ")).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));

    assert_eq!(progress.lock().unwrap().last(), Some(&(4, 4)));
    for path in splitter.written.lock().unwrap().iter() {
        assert!(!path.exists(), "{} was not cleaned up", path.display());
    }
}

#[tokio::test]
async fn reader_bounds_ocr_calls_in_flight() {
    let ocr = Arc::new(PeakOcr::default());
    let reader = DocumentReader::new(Arc::new(FakeSplitter::new(12)), ocr.clone())
        .workers(3)
        .pages_per_request(1);

    let doc = reader.read(Path::new("x.pdf"), |_, _| {}).await.unwrap();

    assert_eq!(doc.segments.len(), 12);
    assert_eq!(ocr.peak.load(Ordering::SeqCst), 3);
    assert_eq!(ocr.current.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reader_fails_when_every_range_fails() {
    let reader = DocumentReader::new(Arc::new(FakeSplitter::new(1)), Arc::new(FakeOcr::new(Some(1))));
    let err = reader.read(Path::new("x.pdf"), |_, _| {}).await.unwrap_err();
    assert!(matches!(err, PipelineError::SourceReadFailed { segments: 1, .. }));
}

// ── Comparison ───────────────────────────────────────────────────────────

#[tokio::test]
async fn comparison_of_record_sets_needs_no_generator() {
    let out = tempfile::tempdir().unwrap();
    let store = Arc::new(ProgressStore::new());
    let pipeline = Pipeline::new(page_config(&out), Credentials::default(), Arc::clone(&store));

    let base = vec![
        rec(json!({"Category": "Fees", "Attribute": "Late fee", "Value": "5%"})),
        rec(json!({"Category": "Fees", "Attribute": "Setup", "Value": "none"})),
    ];
    let revised = vec![
        rec(json!({"Category": "fees", "Attribute": "late fee ", "Value": "7%"})),
        rec(json!({"Category": "Terms", "Attribute": "Notice", "Value": "30 days"})),
    ];

    let session = store.create();
    let result = pipeline
        .run_comparison(
            session,
            ComparisonJob {
                base: ComparisonSource::Records {
                    name: "policy-2023.xlsx".into(),
                    records: base,
                },
                revised: ComparisonSource::Records {
                    name: "policy-2024.pdf".into(),
                    records: revised,
                },
                instruction: None,
                selection: selection(),
            },
        )
        .await
        .unwrap();

    let kinds: Vec<ChangeKind> = result.pairs.iter().map(|p| p.change).collect();
    assert_eq!(
        kinds,
        vec![ChangeKind::Modified, ChangeKind::Removed, ChangeKind::Added]
    );
    assert_eq!(result.pairs[0].differences, vec!["Value".to_string()]);
    assert_eq!(result.filename, "comparison_policy-2023_vs_policy-2024.xlsx");
    assert_eq!(result.preview[0]["Change"], json!("Modified"));
    assert_eq!(store.snapshot(session).unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn comparison_of_documents_runs_both_extractions() {
    let out = tempfile::tempdir().unwrap();
    let store = Arc::new(ProgressStore::new());
    let generator = Arc::new(EchoGenerator::default());
    let pipeline = Arc::new(
        Pipeline::new(page_config(&out), Credentials::default(), Arc::clone(&store))
            .with_generator(generator.clone()),
    );

    let revised = JobSource::Bytes {
        name: "v2.txt".into(),
        bytes: "PAGE1 a\u{c}PAGE9 b".as_bytes().to_vec(),
    };
    let session = pipeline.submit_comparison(ComparisonJob {
        base: ComparisonSource::Document(five_page_text()),
        revised: ComparisonSource::Document(revised),
        instruction: None,
        selection: selection(),
    });

    let last = progress_stream(&store, session)
        .unwrap()
        .fold(None, |_, s| async move { Some(s) })
        .await
        .unwrap();
    assert_eq!(last.status, JobStatus::Completed);

    let result = last.result.unwrap();
    assert_eq!(generator.calls.load(Ordering::SeqCst), 7);
    assert_eq!(result.report.chunks_total, 7);
    let count = |kind: ChangeKind| result.pairs.iter().filter(|p| p.change == kind).count();
    assert_eq!(count(ChangeKind::Unchanged), 1);
    assert_eq!(count(ChangeKind::Removed), 4);
    assert_eq!(count(ChangeKind::Added), 1);
}
