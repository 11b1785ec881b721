//! Load an existing record set as a comparison side.
//!
//! `.xlsx`/`.xls`/`.ods` workbooks are read with calamine: the first sheet's
//! first row is the header, every later non-blank row is a record. `.json`
//! files go through the reply parser: an array of objects, or a single
//! object as one record.

use crate::error::PipelineError;
use crate::output::Record;
use crate::pipeline::parse::parse_records;
use calamine::{open_workbook_auto, Data, Reader};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

/// Read records from a workbook or JSON file.
pub fn read_records(path: &Path) -> Result<Vec<Record>, PipelineError> {
    if !path.exists() {
        return Err(PipelineError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let records = match ext.as_str() {
        "json" => {
            let text = std::fs::read_to_string(path).map_err(|e| failed(path, e))?;
            parse_records(&text)
        }
        "xlsx" | "xlsm" | "xls" | "ods" => read_workbook(path)?,
        other => {
            return Err(PipelineError::RecordSourceFailed {
                path: path.to_path_buf(),
                detail: format!("unsupported record file type '.{other}'"),
            })
        }
    };
    debug!("Loaded {} records from {}", records.len(), path.display());
    Ok(records)
}

fn read_workbook(path: &Path) -> Result<Vec<Record>, PipelineError> {
    let mut workbook = open_workbook_auto(path).map_err(|e| failed(path, e))?;
    let range = match workbook.worksheet_range_at(0) {
        Some(range) => range.map_err(|e| failed(path, e))?,
        None => return Ok(Vec::new()),
    };

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let columns: Vec<String> = header.iter().map(|c| c.to_string().trim().to_string()).collect();

    let mut records = Vec::new();
    for row in rows {
        if row.iter().all(|c| matches!(c, Data::Empty) || c.to_string().trim().is_empty()) {
            continue;
        }
        let mut record = Record::new();
        for (i, column) in columns.iter().enumerate() {
            if column.is_empty() {
                continue;
            }
            let value = row.get(i).map(cell_value).unwrap_or(Value::String(String::new()));
            record.insert(column.clone(), value);
        }
        records.push(record);
    }
    Ok(records)
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::String(String::new()),
        Data::Bool(b) => Value::Bool(*b),
        Data::Int(i) => Value::from(*i),
        other => Value::String(other.to_string()),
    }
}

fn failed(path: &Path, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::RecordSourceFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    }
}
