//! Data models for the tracking pipeline.
//!
//! Raw records arrive from a fetched payload, are normalized into
//! [`CanonicalRecord`]s that share one [`Schema`], and flow through the
//! aggregation and join stages as summaries, movement rows and
//! comparison rows.

use crate::error::{PipelineError, PipelineResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single raw field value as received from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
    Missing,
}

static MISSING: RawValue = RawValue::Missing;

impl RawValue {
    /// Builds a value from a CSV cell; blank cells are missing.
    pub fn from_cell(cell: &str) -> Self {
        let trimmed = cell.trim();
        if trimmed.is_empty() {
            RawValue::Missing
        } else {
            RawValue::Text(trimmed.to_string())
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, RawValue::Missing)
    }

    /// Returns the value as text (numbers are rendered without a trailing `.0`).
    pub fn as_text(&self) -> Option<String> {
        match self {
            RawValue::Text(s) => Some(s.clone()),
            RawValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                Some(format!("{}", *n as i64))
            }
            RawValue::Number(n) => Some(n.to_string()),
            RawValue::Missing => None,
        }
    }

    /// Returns the value as a number, parsing text when needed.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            RawValue::Number(n) => Some(*n),
            RawValue::Text(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
            RawValue::Missing => None,
        }
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => write!(f, "{}", text),
            None => write!(f, "<missing>"),
        }
    }
}

/// An opaque column name → value mapping produced per fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    fields: BTreeMap<String, RawValue>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly for tests and programmatic sources.
    pub fn with(mut self, column: &str, value: RawValue) -> Self {
        self.fields.insert(column.to_string(), value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: RawValue) {
        self.fields.insert(column.into(), value);
    }

    /// Value of a column; absent columns read as [`RawValue::Missing`].
    pub fn get(&self, column: &str) -> &RawValue {
        self.fields.get(column).unwrap_or(&MISSING)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.fields.contains_key(column)
    }
}

/// Closed calendar interval a record was collected over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// A single-date record (`as_of_date`).
    pub fn single(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    /// Whether the interval is active on the pivot date itself or across it.
    pub fn straddles(&self, pivot: NaiveDate) -> bool {
        self.start <= pivot && self.end >= pivot
    }
}

/// A normalized record. Field positions and names live in the batch [`Schema`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// Identity components, aligned with `Schema::identity`.
    pub identity: Vec<String>,
    /// Collection interval; present for every record iff `Schema::has_dates`.
    pub span: Option<DateSpan>,
    /// Named numeric measurements.
    pub values: BTreeMap<String, f64>,
    /// Non-key descriptive strings (poll id, candidate names, ...).
    pub labels: BTreeMap<String, String>,
    /// Model expression / variant tag, when the source declares one.
    pub variant: Option<String>,
}

impl CanonicalRecord {
    pub fn value(&self, field: &str) -> Option<f64> {
        self.values.get(field).copied()
    }

    pub fn label(&self, field: &str) -> Option<&str> {
        self.labels.get(field).map(String::as_str)
    }
}

/// Field layout shared by every record of a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub identity: Vec<String>,
    pub labels: Vec<String>,
    pub values: Vec<String>,
    pub has_dates: bool,
    pub has_variant: bool,
}

impl Schema {
    fn available_keys(&self) -> String {
        self.identity
            .iter()
            .chain(self.labels.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Resolves grouping/join key field names against this schema.
    pub fn key_resolver(&self, fields: &[String]) -> PipelineResult<KeyResolver> {
        let mut sources = Vec::with_capacity(fields.len());
        for field in fields {
            if let Some(idx) = self.identity.iter().position(|f| f == field) {
                sources.push(KeySource::Identity(idx));
            } else if self.labels.iter().any(|f| f == field) {
                sources.push(KeySource::Label(field.clone()));
            } else {
                return Err(PipelineError::JoinKeyMismatch {
                    field: field.clone(),
                    available: self.available_keys(),
                });
            }
        }
        Ok(KeyResolver { sources })
    }

    /// Fails when any of `fields` is not a declared value field.
    pub fn require_values(&self, fields: &[String]) -> PipelineResult<()> {
        match fields.iter().find(|f| !self.values.contains(f)) {
            Some(missing) => Err(PipelineError::UnknownValueField(missing.clone())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum KeySource {
    Identity(usize),
    Label(String),
}

/// Extracts an ordered key tuple from records of one schema.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyResolver {
    sources: Vec<KeySource>,
}

impl KeyResolver {
    pub fn key_of(&self, record: &CanonicalRecord) -> Vec<String> {
        self.sources
            .iter()
            .map(|source| match source {
                KeySource::Identity(idx) => record.identity.get(*idx).cloned().unwrap_or_default(),
                KeySource::Label(name) => record.labels.get(name).cloned().unwrap_or_default(),
            })
            .collect()
    }
}

/// Normalized records plus the schema they share.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    pub schema: Schema,
    pub records: Vec<CanonicalRecord>,
}

impl RecordBatch {
    pub fn new(schema: Schema, records: Vec<CanonicalRecord>) -> Self {
        Self { schema, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// A new batch with the same schema holding only matching records.
    pub fn filtered<F>(&self, keep: F) -> RecordBatch
    where
        F: Fn(&CanonicalRecord) -> bool,
    {
        RecordBatch {
            schema: self.schema.clone(),
            records: self.records.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }
}

/// Reduced statistics of one group within one cohort.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CohortStats {
    /// Rounded arithmetic mean per value field.
    pub means: BTreeMap<String, f64>,
    /// Number of contributing records.
    pub count: usize,
    /// Rounded difference of two rounded means, when a margin is configured.
    pub margin: Option<f64>,
}

impl CohortStats {
    /// Zero-filled stats for a group absent from one side of an outer join.
    pub fn zeroed(fields: &[String], with_margin: bool) -> Self {
        Self {
            means: fields.iter().map(|f| (f.clone(), 0.0)).collect(),
            count: 0,
            margin: with_margin.then_some(0.0),
        }
    }

    pub fn mean(&self, field: &str) -> Option<f64> {
        self.means.get(field).copied()
    }
}

/// One group's summary within a cohort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortSummary {
    pub key: Vec<String>,
    pub stats: CohortStats,
}

/// Before/after join of two cohort summaries on the group key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementRow {
    pub key: Vec<String>,
    pub before: CohortStats,
    pub after: CohortStats,
    /// `after − before` per mean field (and `margin`), rounded.
    pub changes: BTreeMap<String, f64>,
}

impl MovementRow {
    pub fn change(&self, field: &str) -> Option<f64> {
        self.changes.get(field).copied()
    }
}

/// Signed difference between two variants of one value field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VariantDelta {
    pub value: f64,
    pub magnitude: f64,
}

/// One entity with each requested variant's values side by side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    /// Entity key (after any configured truncation).
    pub entity: Vec<String>,
    pub span: Option<DateSpan>,
    /// Variant → value field → value, in requested variant order.
    pub values: Vec<(String, BTreeMap<String, f64>)>,
    /// Labels carried from the first variant's record.
    pub labels: BTreeMap<String, String>,
    pub delta: Option<VariantDelta>,
}

impl ComparisonRow {
    pub fn value(&self, variant: &str, field: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|(v, _)| v == variant)
            .and_then(|(_, fields)| fields.get(field).copied())
    }
}

/// National control forecast as persisted under the chamber key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChamberForecast {
    /// Democratic control probability, whole percent.
    #[serde(rename = "probD")]
    pub prob_d: i64,
    #[serde(rename = "probR")]
    pub prob_r: i64,
    /// Median seat counts.
    #[serde(rename = "seatsD")]
    pub seats_d: i64,
    #[serde(rename = "seatsR")]
    pub seats_r: i64,
    /// Model expression without its leading underscore.
    pub expression: String,
}

/// One seat's forecast as persisted under `{chamber}_{SEAT}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeatForecast {
    #[serde(rename = "nameD")]
    pub name_d: String,
    #[serde(rename = "nameR")]
    pub name_r: String,
    #[serde(rename = "probD")]
    pub prob_d: i64,
    #[serde(rename = "probR")]
    pub prob_r: i64,
    /// Absolute projected margin, one decimal.
    pub margin: f64,
    pub margin_leader: String,
}

/// Compact summary of one movement table, persisted per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementDigest {
    pub rows: usize,
    /// Group key of the first (largest) mover, joined with " / ".
    pub top: Option<String>,
    pub change: Option<f64>,
}

/// One poll in a pollster's recent history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollLine {
    pub span: DateSpan,
    pub sample_size: String,
    pub population: String,
    pub dem: f64,
    pub rep: f64,
    /// `dem - rep`, one decimal.
    pub margin: f64,
    /// Margin move since the next older poll; `None` for the oldest.
    pub change: Option<f64>,
}

/// A newly published poll shown with the matching polls before it,
/// newest first. Pollster details come from the newest poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollHistory {
    pub pollster: String,
    pub grade: String,
    pub methodology: String,
    pub sponsors: String,
    pub partisan: String,
    pub internal: String,
    pub polls: Vec<PollLine>,
}
