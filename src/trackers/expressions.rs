//! Side-by-side comparison of forecast model expressions per seat.

use super::{load_batch, TrackerOutput};
use crate::analysis::{rejoin_variants, KeyTruncation, RejoinConfig, VariantDiff};
use crate::config::ExpressionComparisonConfig;
use crate::models::RecordBatch;
use crate::normalize::DateRules;
use crate::report::{comparison_table, Table};
use crate::sources::{self, Chamber};
use anyhow::{Context, Result};

pub fn run(payload: &[u8], chamber: Chamber, config: &ExpressionComparisonConfig) -> Result<TrackerOutput> {
    let batch = load_batch(payload, &sources::district_toplines(), &DateRules::default())?;
    Ok(TrackerOutput {
        tables: vec![comparison(&batch, chamber, config)?],
        ..Default::default()
    })
}

/// One row per seat with the compared field under every expression, sorted
/// by the first-minus-last difference.
pub fn comparison(batch: &RecordBatch, chamber: Chamber, config: &ExpressionComparisonConfig) -> Result<Table> {
    let (first, last) = match (config.variants.first(), config.variants.last()) {
        (Some(first), Some(last)) if config.variants.len() >= 2 => (first.clone(), last.clone()),
        _ => anyhow::bail!("Expression comparison needs at least two expressions"),
    };
    let diff = VariantDiff {
        field: config.field.clone(),
        minuend: first,
        subtrahend: last,
    };
    let rejoin = RejoinConfig {
        variants: config.variants.clone(),
        entity_key: vec!["district".to_string()],
        match_dates: false,
        truncation: chamber.is_statewide().then(|| KeyTruncation {
            field: "district".to_string(),
            length: config.statewide_prefix,
        }),
        margin: None,
        diff: Some(diff.clone()),
        precision: config.precision,
    };
    let rows = rejoin_variants(batch, &rejoin)
        .with_context(|| format!("Failed to compare {} expressions", chamber))?;

    Ok(comparison_table(
        chamber.name(),
        &["seat".to_string()],
        &[],
        std::slice::from_ref(&config.field),
        &config.variants,
        Some(&diff),
        &rows,
    ))
}
