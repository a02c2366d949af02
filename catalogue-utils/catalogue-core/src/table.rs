use anyhow::{Context, Result};
use csv::Writer;
use log::{info, warn};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// One flattened output row. Keys are column names.
pub type Row = BTreeMap<String, Value>;

/// Renders a scalar cell as text. Nested values are written as compact JSON.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Falsy values in the catalogue payload: null, empty text, `false`, zero and
/// empty containers.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Sorted union of every key across all rows.
pub fn header(rows: &[Row]) -> Vec<String> {
    let columns: BTreeSet<&String> = rows.iter().flat_map(|row| row.keys()).collect();
    columns.into_iter().cloned().collect()
}

/// Writes `rows` as CSV with a header row. Cells a row does not carry are left empty.
pub fn write_rows<W: Write>(writer: W, rows: &[Row]) -> Result<usize> {
    let headers = header(rows);
    let mut csv_writer = Writer::from_writer(writer);

    csv_writer.write_record(&headers)
        .context("Failed to write CSV header")?;

    for row in rows {
        let record: Vec<String> = headers
            .iter()
            .map(|column| row.get(column).map(cell_text).unwrap_or_default())
            .collect();
        csv_writer.write_record(&record)?;
    }

    csv_writer.flush()
        .context("Failed to flush CSV output")?;
    Ok(rows.len())
}

/// Writes `rows` to `path`, creating parent directories. Nothing is written
/// for an empty row set.
pub fn write_rows_to_path<P: AsRef<Path>>(path: P, rows: &[Row]) -> Result<usize> {
    let file_path = path.as_ref();
    if rows.is_empty() {
        warn!("No data to write to {}", file_path.display());
        return Ok(0);
    }

    if let Some(parent) = file_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory structure for: {}", file_path.display()))?;
    }

    let file = File::create(file_path)
        .with_context(|| format!("Failed to create output file: {}", file_path.display()))?;

    let written = write_rows(file, rows)?;
    info!("Wrote {} rows ({} columns) to {}", written, header(rows).len(), file_path.display());
    Ok(written)
}
