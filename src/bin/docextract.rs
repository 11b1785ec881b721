//! CLI binary for docextract.
//!
//! A thin shim over the library crate: maps flags onto `PipelineConfig`,
//! submits one job, follows its progress stream, and reports the result.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use docextract::{
    progress_stream, ChunkingMode, ComparisonJob, ComparisonSource, Credentials, ExtractionJob,
    ExtractionSchema, JobResult, JobSource, JobStatus, Pipeline, PipelineConfig, ProgressSink,
    ProgressStore, ProviderSelection, SessionId,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── Per-chunk log lines above the bar ────────────────────────────────────────

/// Prints one line per finished chunk above the progress bar. The bar
/// position itself is driven by the session's progress stream.
struct ChunkLog {
    bar: ProgressBar,
}

impl ProgressSink for ChunkLog {
    fn update(&self, _session: SessionId, _percent: u8, _message: &str) {}

    fn on_chunk_complete(&self, _session: SessionId, chunk: usize, total: usize, records: usize) {
        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {}",
            green("✓"),
            chunk,
            total,
            dim(&format!("{records:>4} records")),
        ));
    }

    fn on_chunk_error(&self, _session: SessionId, chunk: usize, total: usize, error: &str) {
        let msg: String = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Chunk {:>3}/{:<3}  {}",
            red("✗"),
            chunk,
            total,
            red(&msg)
        ));
    }
}

fn progress_bar(visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  {msg}  ⏱ {elapsed_precise}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ")
    .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
    bar.set_style(style);
    bar.set_prefix("Working");
    bar.enable_steady_tick(Duration::from_millis(80));
    bar
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Extract rules from a scanned manual with Gemini
  docextract extract manual.pdf --provider gemini --model gemini-1.5-pro-latest

  # Custom instruction, page-based chunks, copy the sheet next to the input
  docextract extract manual.pdf --instruction-file rules.txt --pages-per-chunk 5 -o manual.xlsx

  # Compare two policy versions with Azure OpenAI
  docextract compare policy-2023.pdf policy-2024.pdf --provider azure --model gpt-4o

  # Compare a new document against an earlier extraction
  docextract compare extraction_policy-2023.xlsx policy-2024.pdf

  # Print the extracted records as JSON
  docextract extract notes.txt --json > records.json

ENVIRONMENT VARIABLES:
  AZURE_OPENAI_API_KEY      Azure OpenAI key
  AZURE_OPENAI_ENDPOINT     Azure OpenAI endpoint (https://<name>.openai.azure.com)
  AZURE_OPENAI_DEPLOYMENT   Azure OpenAI deployment (defaults to the model name)
  GEMINI_API_KEY            Google Gemini key
  AZURE_DI_ENDPOINT         Document Intelligence endpoint (OCR for PDFs)
  AZURE_DI_KEY              Document Intelligence key
  PDFIUM_LIB_PATH           libpdfium file or directory (defaults to the system library)
  RUST_LOG                  Log filter, e.g. docextract=debug
"#;

/// Extract structured records from documents with OCR + LLMs, and compare
/// two documents record by record.
#[derive(Parser, Debug)]
#[command(
    name = "docextract",
    version,
    about = "Extract structured records from documents with OCR + LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract records from one document.
    Extract {
        /// Local file path (PDF, .txt, .md) or HTTP/HTTPS URL.
        input: String,

        /// Expect rule records (major_section, minor_section, rule) and
        /// deduplicate on those fields.
        #[arg(long)]
        rules: bool,
    },
    /// Compare two documents or record sets.
    Compare {
        /// First (base) source: document, URL, or .xlsx/.json records.
        base: String,
        /// Second (revised) source.
        revised: String,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// LLM provider: azure, gemini, or any provider edgequake-llm knows.
    #[arg(long, global = true, env = "DOCEXTRACT_PROVIDER", default_value = "gemini")]
    provider: String,

    /// Model ID for the provider.
    #[arg(long, global = true, env = "DOCEXTRACT_MODEL", default_value = "gemini-1.5-pro-latest")]
    model: String,

    /// Instruction sent with every chunk.
    #[arg(long, global = true, conflicts_with = "instruction_file")]
    instruction: Option<String>,

    /// File holding the instruction.
    #[arg(long, global = true, env = "DOCEXTRACT_INSTRUCTION_FILE")]
    instruction_file: Option<PathBuf>,

    /// Copy the spreadsheet to this path.
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Directory for artifacts (defaults to the system temp dir).
    #[arg(long, global = true, env = "DOCEXTRACT_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Chunk by pages instead of tokens.
    #[arg(long, global = true, env = "DOCEXTRACT_PAGES_PER_CHUNK",
          value_parser = clap::value_parser!(u32).range(1..=50))]
    pages_per_chunk: Option<u32>,

    /// Tokens repeated between consecutive chunks (token mode).
    #[arg(long, global = true, env = "DOCEXTRACT_OVERLAP", default_value_t = 200)]
    overlap: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, global = true, env = "DOCEXTRACT_TEMPERATURE", default_value_t = 0.5)]
    temperature: f32,

    /// Max LLM output tokens per chunk.
    #[arg(long, global = true, env = "DOCEXTRACT_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: usize,

    /// Nucleus sampling top-p (0.0–1.0).
    #[arg(long, global = true, default_value_t = 1.0)]
    top_p: f32,

    /// Stop sequence; repeat for several.
    #[arg(long = "stop", global = true)]
    stop: Vec<String>,

    /// Retries per chunk on transient LLM failure.
    #[arg(long, global = true, env = "DOCEXTRACT_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Per-chunk LLM call timeout in seconds.
    #[arg(long, global = true, env = "DOCEXTRACT_API_TIMEOUT", default_value_t = 180)]
    api_timeout: u64,

    /// Concurrent OCR requests.
    #[arg(long, global = true, env = "DOCEXTRACT_OCR_WORKERS", default_value_t = 4)]
    ocr_workers: usize,

    /// Pages per OCR request.
    #[arg(long, global = true, default_value_t = 30)]
    ocr_pages: usize,

    /// PDF user password for encrypted documents.
    #[arg(long, global = true, env = "DOCEXTRACT_PASSWORD")]
    password: Option<String>,

    /// HTTP download timeout in seconds.
    #[arg(long, global = true, default_value_t = 120)]
    download_timeout: u64,

    /// Print the preview records as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "DOCEXTRACT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "DOCEXTRACT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let common = &cli.common;

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar carries the feedback that matters; keep library
    // logs to errors while it is shown.
    let show_progress = !common.quiet && !common.no_progress && !common.json;
    let filter = if common.verbose {
        "debug"
    } else if common.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build pipeline ───────────────────────────────────────────────────
    let rules = matches!(cli.command, Command::Extract { rules: true, .. });
    let config = build_config(common, rules)?;
    let instruction = read_instruction(common).await?;
    let selection = ProviderSelection::new(&common.provider, common.model.clone());

    let bar = progress_bar(show_progress);
    let store = Arc::new(ProgressStore::new());
    let pipeline = Arc::new(
        Pipeline::new(config, Credentials::from_env(), Arc::clone(&store))
            .with_sink(Arc::new(ChunkLog { bar: bar.clone() })),
    );

    // ── Submit ───────────────────────────────────────────────────────────
    let started = Instant::now();
    let session = match &cli.command {
        Command::Extract { input, .. } => pipeline.submit_extraction(ExtractionJob {
            source: JobSource::from(input.as_str()),
            instruction,
            selection,
        }),
        Command::Compare { base, revised } => pipeline.submit_comparison(ComparisonJob {
            base: comparison_source(base),
            revised: comparison_source(revised),
            instruction,
            selection,
        }),
    };

    // ── Follow progress ──────────────────────────────────────────────────
    let mut updates = progress_stream(&store, session).context("Session vanished")?;
    let mut last = None;
    while let Some(snapshot) = updates.next().await {
        bar.set_position(u64::from(snapshot.percent));
        bar.set_message(snapshot.message.clone());
        last = Some(snapshot);
    }
    bar.finish_and_clear();

    let snapshot = last.context("No progress received")?;
    if snapshot.status != JobStatus::Completed {
        bail!(
            "{} {}",
            red("✘"),
            snapshot.error.unwrap_or_else(|| "job did not complete".into())
        );
    }
    let result = snapshot.result.context("Completed job carries no result")?;

    // ── Report ───────────────────────────────────────────────────────────
    if let Some(ref dest) = common.output {
        copy_artifact(&result.artifact.path, dest)?;
    }
    if common.json {
        let json =
            serde_json::to_string_pretty(&result.preview).context("Failed to serialise records")?;
        println!("{json}");
    }
    if !common.quiet {
        print_summary(&result, common.output.as_deref(), started.elapsed());
    }
    store.evict(session);
    Ok(())
}

/// Map CLI args to `PipelineConfig`.
fn build_config(common: &CommonArgs, rules: bool) -> Result<PipelineConfig> {
    let chunking = match common.pages_per_chunk {
        Some(pages) => ChunkingMode::Pages {
            pages_per_chunk: pages as usize,
        },
        None => ChunkingMode::Tokens {
            overlap_tokens: common.overlap,
        },
    };

    let mut builder = PipelineConfig::builder()
        .chunking(chunking)
        .temperature(common.temperature)
        .max_output_tokens(common.max_tokens)
        .top_p(common.top_p)
        .stop_sequences(common.stop.clone())
        .max_retries(common.max_retries)
        .api_timeout_secs(common.api_timeout)
        .ocr_workers(common.ocr_workers)
        .ocr_pages_per_request(common.ocr_pages)
        .download_timeout_secs(common.download_timeout);

    if rules {
        builder = builder.extraction(ExtractionSchema::rules());
    }
    if let Some(ref dir) = common.output_dir {
        builder = builder.output_dir(dir);
    }
    if let Some(ref pwd) = common.password {
        builder = builder.password(pwd);
    }
    builder.build().context("Invalid configuration")
}

async fn read_instruction(common: &CommonArgs) -> Result<Option<String>> {
    if let Some(ref text) = common.instruction {
        return Ok(Some(text.clone()));
    }
    match common.instruction_file {
        Some(ref path) => tokio::fs::read_to_string(path)
            .await
            .map(Some)
            .with_context(|| format!("Failed to read instruction from {path:?}")),
        None => Ok(None),
    }
}

/// Spreadsheets and JSON files are record sets; anything else is a document.
fn comparison_source(arg: &str) -> ComparisonSource {
    let ext = Path::new(arg)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("xlsx" | "xlsm" | "xls" | "ods" | "json") if !arg.starts_with("http") => {
            ComparisonSource::Sheet(PathBuf::from(arg))
        }
        _ => ComparisonSource::Document(JobSource::from(arg)),
    }
}

fn copy_artifact(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::copy(from, to)
        .with_context(|| format!("Failed to copy artifact to {}", to.display()))?;
    Ok(())
}

fn print_summary(result: &JobResult, copied_to: Option<&Path>, elapsed: Duration) {
    let report = &result.report;
    let ok = report.chunks_total - report.chunks_failed;
    eprintln!(
        "{}  {} rows  {}/{} chunks  {:.1}s  →  {}",
        if report.chunks_failed == 0 {
            green("✔")
        } else {
            cyan("⚠")
        },
        bold(&result.record_count().to_string()),
        ok,
        report.chunks_total,
        elapsed.as_secs_f64(),
        bold(
            &copied_to
                .unwrap_or(result.artifact.path.as_path())
                .display()
                .to_string()
        ),
    );
    if report.chunks_truncated > 0 || report.ocr_segments_failed > 0 {
        eprintln!(
            "   {}",
            dim(&format!(
                "{} truncated replies, {} OCR ranges failed",
                report.chunks_truncated, report.ocr_segments_failed
            ))
        );
    }
    for e in &report.errors {
        eprintln!("   {} {}", red("✗"), e);
    }
    eprintln!("   {}", dim(&format!("suggested name: {}", result.filename)));
}
