//! Result types produced by a job.
//!
//! A job ends with a [`JobResult`]: the artifact handle, a preview of the
//! rows, the suggested download filename, and a [`JobReport`] that makes the
//! per-chunk failure isolation visible instead of leaving it to the logs.

use crate::error::ChunkError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// One extracted record. Field order is preserved and drives column order.
pub type Record = serde_json::Map<String, Value>;

/// Maximum number of [`ChunkError`] samples kept in a report.
pub const MAX_ERROR_SAMPLES: usize = 5;

/// Which kind of job produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Extraction,
    Comparison,
}

/// Reference to a written artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    pub path: PathBuf,
    /// Data rows written, header excluded.
    pub rows: usize,
}

/// Terminal payload of a completed job. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub kind: JobKind,
    pub artifact: ArtifactHandle,
    /// Suggested download name, e.g. `extraction_manual.xlsx`.
    pub filename: String,
    /// Final rows as records (comparison rows use the fixed column set).
    pub preview: Vec<Record>,
    /// Classified pairs; empty for extraction jobs.
    pub pairs: Vec<ComparisonPair>,
    pub report: JobReport,
}

impl JobResult {
    pub fn record_count(&self) -> usize {
        self.preview.len()
    }
}

/// Per-job accounting of chunk outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub chunks_total: usize,
    /// Chunks whose reply yielded at least one record.
    pub chunks_succeeded: usize,
    /// Chunks whose generate step failed (see `errors`).
    pub chunks_failed: usize,
    /// Chunks answered without any recoverable records.
    pub chunks_empty: usize,
    /// Chunks whose reply was cut off at the output limit.
    pub chunks_truncated: usize,
    /// OCR page ranges that contributed an empty segment.
    pub ocr_segments_failed: usize,
    /// Records collected across chunks before reconciliation.
    pub records_extracted: usize,
    /// Records left after reconciliation.
    pub records_kept: usize,
    /// First few chunk errors, in chunk order.
    pub errors: Vec<ChunkError>,
}

impl JobReport {
    pub fn push_error(&mut self, error: ChunkError) {
        self.chunks_failed += 1;
        if self.errors.len() < MAX_ERROR_SAMPLES {
            self.errors.push(error);
        }
    }

    /// Fold another report into this one (comparison jobs run two reads).
    pub fn merge(&mut self, other: JobReport) {
        self.chunks_total += other.chunks_total;
        self.chunks_succeeded += other.chunks_succeeded;
        self.chunks_empty += other.chunks_empty;
        self.chunks_truncated += other.chunks_truncated;
        self.ocr_segments_failed += other.ocr_segments_failed;
        self.records_extracted += other.records_extracted;
        self.records_kept += other.records_kept;
        for e in other.errors {
            if self.errors.len() < MAX_ERROR_SAMPLES {
                self.errors.push(e);
            }
        }
        self.chunks_failed += other.chunks_failed;
    }
}

// ── Comparison ───────────────────────────────────────────────────────────

/// Classification of an aligned pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Unchanged,
    Modified,
    /// Only source B has the record.
    Added,
    /// Only source A has the record.
    Removed,
}

impl ChangeKind {
    pub fn label(&self) -> &'static str {
        match self {
            ChangeKind::Unchanged => "Unchanged",
            ChangeKind::Modified => "Modified",
            ChangeKind::Added => "Added",
            ChangeKind::Removed => "Removed",
        }
    }
}

/// One record of A aligned with zero or one record of B, or a leftover B.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonPair {
    pub a: Option<Record>,
    pub b: Option<Record>,
    pub change: ChangeKind,
    /// Fields whose values differ, for `Modified` pairs.
    pub differences: Vec<String>,
}

// ── Tables ───────────────────────────────────────────────────────────────

/// Rectangular view of the final rows, handed to the materializer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Columns of a comparison artifact.
pub const COMPARISON_COLUMNS: [&str; 6] = [
    "Category",
    "Attribute",
    "Change",
    "Differences",
    "Source A",
    "Source B",
];

impl Table {
    /// Columns come from the first record's keys; later records are read by
    /// those names and missing cells are blank.
    pub fn from_records(records: &[Record]) -> Self {
        let Some(first) = records.first() else {
            return Table::default();
        };
        let columns: Vec<String> = first.keys().cloned().collect();
        let rows = records
            .iter()
            .map(|r| {
                columns
                    .iter()
                    .map(|c| r.get(c).map(cell_text).unwrap_or_default())
                    .collect()
            })
            .collect();
        Table { columns, rows }
    }

    /// Fixed comparison layout: key, classification, then both sides as
    /// pretty JSON.
    pub fn from_comparison(pairs: &[ComparisonPair], category: &str, attribute: &str) -> Self {
        let rows = pairs
            .iter()
            .map(|p| {
                let side = p.a.as_ref().or(p.b.as_ref());
                let key = |field: &str| {
                    side.and_then(|r| lookup(r, field))
                        .map(cell_text)
                        .unwrap_or_default()
                };
                vec![
                    key(category),
                    key(attribute),
                    p.change.label().to_string(),
                    p.differences.join(", "),
                    p.a.as_ref().map(render_record).unwrap_or_default(),
                    p.b.as_ref().map(render_record).unwrap_or_default(),
                ]
            })
            .collect();
        Table {
            columns: COMPARISON_COLUMNS.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    /// Rows re-keyed by column, for the result preview.
    pub fn to_records(&self) -> Vec<Record> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().map(|v| Value::String(v.clone())))
                    .collect()
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Case-insensitive field lookup.
pub fn lookup<'r>(record: &'r Record, field: &str) -> Option<&'r Value> {
    record.get(field).or_else(|| {
        record
            .iter()
            .find(|(k, _)| k.trim().eq_ignore_ascii_case(field.trim()))
            .map(|(_, v)| v)
    })
}

/// Cell text for one value: strings as-is, null blank, anything else as
/// pretty JSON.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

fn render_record(record: &Record) -> String {
    serde_json::to_string_pretty(record).unwrap_or_default()
}
