//! Tabular payload parsing.
//!
//! Turns a fetched CSV payload into [`RawRecord`]s. No typing happens
//! here; the normalizer decides what each column means.

use crate::error::PipelineResult;
use crate::models::{RawRecord, RawValue};
use tracing::debug;

/// Parse a CSV payload with a header row.
pub fn parse_csv(payload: &[u8]) -> PipelineResult<Vec<RawRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .trim(csv::Trim::Headers)
        .from_reader(payload);

    let headers = reader.headers()?.clone();
    let mut records = Vec::new();

    for row in reader.records() {
        let row = row?;
        let mut record = RawRecord::new();
        for (column, cell) in headers.iter().zip(row.iter()) {
            record.insert(column, RawValue::from_cell(cell));
        }
        records.push(record);
    }

    debug!("Parsed {} rows across {} columns", records.len(), headers.len());
    Ok(records)
}
