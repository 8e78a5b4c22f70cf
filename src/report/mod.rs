//! Report formatting.
//!
//! Tables for the movement, comparison and rolling outputs, rendered as CSV
//! or JSON, plus the plain-text notification messages.

pub mod generator;
pub mod messages;

pub use generator::*;
pub use messages::*;

use crate::cli::OutputFormat;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// A single table cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    Text(String),
    Number(f64),
    Integer(i64),
    Empty,
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Number(value)
    }
}

impl From<usize> for Cell {
    fn from(value: usize) -> Self {
        Cell::Integer(value as i64)
    }
}

impl From<Option<f64>> for Cell {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Cell::Empty, Cell::Number)
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Text(s) => write!(f, "{}", s),
            // Whole numbers print with one decimal, e.g. `5.0`.
            Cell::Number(n) if n.fract() == 0.0 => write!(f, "{:.1}", n),
            Cell::Number(n) => write!(f, "{}", n),
            Cell::Integer(i) => write!(f, "{}", i),
            Cell::Empty => Ok(()),
        }
    }
}

/// A named output table.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    /// File stem the table is written under.
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<Cell>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell at `row` under `column`, if both exist.
    pub fn cell(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

/// Render a table as CSV with a header row.
pub fn render_csv(table: &Table) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&table.columns)?;
    for row in &table.rows {
        writer.write_record(row.iter().map(|cell| cell.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush CSV writer: {}", e))?;
    String::from_utf8(bytes).context("CSV output is not valid UTF-8")
}

/// Render a table as a JSON array of row objects.
pub fn render_json(table: &Table) -> Result<String> {
    let mut records = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let mut record = serde_json::Map::new();
        for (column, cell) in table.columns.iter().zip(row) {
            record.insert(column.clone(), serde_json::to_value(cell)?);
        }
        records.push(serde_json::Value::Object(record));
    }
    serde_json::to_string_pretty(&records).map_err(Into::into)
}

pub fn render(table: &Table, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Csv => render_csv(table),
        OutputFormat::Json => render_json(table),
    }
}

/// Write a table into `dir` as `{name}.{ext}`.
pub fn write_table(table: &Table, dir: &Path, format: OutputFormat) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    let path = dir.join(format!("{}.{}", table.name, format.extension()));
    let content = render(table, format)?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write table to {}", path.display()))?;
    Ok(path)
}
