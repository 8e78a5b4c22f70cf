//! Error taxonomy for the tracking pipeline.
//!
//! The core stages (normalization, aggregation, joining) return these typed
//! errors. The application layer wraps them in `anyhow` with context.

use thiserror::Error;

/// A raw batch could not be mapped onto the canonical record shape.
///
/// Fatal for the batch it came from; never touches persisted state.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("row {row}: field '{field}' {reason}")]
pub struct NormalizationError {
    /// Zero-based index of the offending row in the raw batch.
    pub row: usize,
    /// Canonical (or raw column) name of the field.
    pub field: String,
    /// What was wrong with it.
    pub reason: String,
}

impl NormalizationError {
    pub fn new(row: usize, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            row,
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Failures raised by the pipeline stages.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("normalization failed: {0}")]
    Normalization(#[from] NormalizationError),

    /// A grouping/join key names a field the batch schema does not carry.
    #[error("join key field '{field}' is not present in the input schema (available: {available})")]
    JoinKeyMismatch { field: String, available: String },

    #[error("value field '{0}' is not present in the input schema")]
    UnknownValueField(String),

    /// A date split was requested on a batch normalized without dates.
    #[error("records carry no dates; a date split is not possible")]
    MissingDates,

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
