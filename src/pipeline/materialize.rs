//! Write a [`Table`] to a spreadsheet artifact.
//!
//! The [`Materializer`] trait is the seam the orchestrator writes through, so
//! tests can substitute a failing or in-memory writer. [`XlsxMaterializer`]
//! produces one sheet: a styled header row, wrapped cells, a frozen header.
//! A table with no rows still produces a file carrying a single notice row.

use crate::error::MaterializeError;
use crate::output::{ArtifactHandle, Table};
use rust_xlsxwriter::{Color, Format, FormatAlign, Workbook};
use std::path::Path;
use tracing::debug;

/// Cell text shown when a job produced no rows.
pub const EMPTY_NOTICE: &str = "No structured data was extracted or generated.";

const MAX_COLUMNS: usize = 16_384;
const MAX_DATA_ROWS: usize = 1_048_575;
const MAX_CELL_CHARS: usize = 32_767;
const COLUMN_WIDTH: f64 = 35.0;

/// Renders tables to files.
pub trait Materializer: Send + Sync {
    fn write(&self, table: &Table, path: &Path) -> Result<ArtifactHandle, MaterializeError>;
}

/// `.xlsx` writer.
#[derive(Debug, Clone)]
pub struct XlsxMaterializer {
    sheet_name: String,
}

impl Default for XlsxMaterializer {
    fn default() -> Self {
        Self::new("Results")
    }
}

impl XlsxMaterializer {
    pub fn new(sheet_name: impl Into<String>) -> Self {
        Self {
            sheet_name: sheet_name.into(),
        }
    }
}

impl Materializer for XlsxMaterializer {
    fn write(&self, table: &Table, path: &Path) -> Result<ArtifactHandle, MaterializeError> {
        if table.columns.len() > MAX_COLUMNS {
            return Err(MaterializeError::TooManyColumns(table.columns.len()));
        }
        if table.rows.len() > MAX_DATA_ROWS {
            return Err(MaterializeError::TooManyRows(table.rows.len()));
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let header = Format::new()
            .set_bold()
            .set_font_color(Color::White)
            .set_background_color(Color::RGB(0x366092))
            .set_align(FormatAlign::Center)
            .set_align(FormatAlign::VerticalCenter);
        let body = Format::new().set_text_wrap().set_align(FormatAlign::Top);

        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.set_name(&self.sheet_name)?;

        if table.is_empty() {
            sheet.write_string_with_format(0, 0, EMPTY_NOTICE, &body)?;
            sheet.set_column_width(0, COLUMN_WIDTH * 2.0)?;
            workbook.save(path)?;
            debug!("Wrote empty notice to {}", path.display());
            return Ok(ArtifactHandle {
                path: path.to_path_buf(),
                rows: 0,
            });
        }

        for (col, name) in table.columns.iter().enumerate() {
            let col = col as u16;
            sheet.write_string_with_format(0, col, title_case(name), &header)?;
            sheet.set_column_width(col, COLUMN_WIDTH)?;
        }
        for (r, row) in table.rows.iter().enumerate() {
            let r = (r + 1) as u32;
            for (col, value) in row.iter().enumerate().take(table.columns.len()) {
                sheet.write_string_with_format(r, col as u16, clip(value), &body)?;
            }
        }
        sheet.set_freeze_panes(1, 0)?;
        workbook.save(path)?;

        debug!(
            "Wrote {} rows x {} columns to {}",
            table.rows.len(),
            table.columns.len(),
            path.display()
        );
        Ok(ArtifactHandle {
            path: path.to_path_buf(),
            rows: table.rows.len(),
        })
    }
}

/// `major_section` → `Major Section`.
pub fn title_case(name: &str) -> String {
    name.split(|c: char| c == '_' || c.is_whitespace())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Sheet cells hold at most 32767 characters.
fn clip(value: &str) -> &str {
    match value.char_indices().nth(MAX_CELL_CHARS) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
