//! Pipeline stages for document extraction and comparison.
//!
//! Each submodule implements one step and is testable on its own; the
//! [`crate::orchestrator`] wires them together.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ split ──▶ ocr ──▶ reader ──▶ chunk ──▶ llm ──▶ parse ──▶ reconcile ──▶ materialize
//! (path/URL) (pdfium)  (DI)  (ordered)  (budget)  (retry) (tolerant)  (dedup/align)  (xlsx)
//! ```
//!
//! 1. [`input`]: resolve a path, URL, or upload to a PDF on disk or to text
//! 2. [`split`]: cut the PDF into page-range segments; blocking, run under
//!    `spawn_blocking`
//! 3. [`ocr`]: OCR one segment through Document Intelligence
//! 4. [`reader`]: bounded parallel OCR, reassembled in page order
//! 5. [`tokens`] and [`chunk`]: size chunks against the model's input budget
//! 6. [`llm`]: one generation call per chunk with timeout and backoff
//! 7. [`parse`]: recover records from a free-form reply
//! 8. [`reconcile`]: dedup extraction records, or align two record sets
//! 9. [`materialize`] and [`sheet`]: write and read spreadsheets

pub mod chunk;
pub mod input;
pub mod llm;
pub mod materialize;
pub mod ocr;
pub mod parse;
pub mod reader;
pub mod reconcile;
pub mod sheet;
pub mod split;
pub mod tokens;
