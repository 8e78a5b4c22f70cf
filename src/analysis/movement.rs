//! Before/after movement per group.
//!
//! The batch is split at a pivot date into a "before" cohort (`end < pivot`)
//! and an "after" cohort (`start > pivot`). A record whose interval touches
//! the pivot belongs to neither. The two cohort summaries are joined on the
//! group key and differenced.

use super::aggregator::{aggregate, DatePredicate, Reducers};
use super::Precision;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CohortStats, MovementRow, RecordBatch};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Ordering applied to movement rows, always descending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum MovementSort {
    /// By a change field (`margin` or a mean field), optionally by magnitude.
    Change {
        field: String,
        #[serde(default)]
        magnitude: bool,
    },
    /// By the number of records in the after cohort.
    CountAfter,
    /// By the number of records in the before cohort.
    CountBefore,
}

impl Default for MovementSort {
    fn default() -> Self {
        MovementSort::Change {
            field: "margin".to_string(),
            magnitude: true,
        }
    }
}

impl MovementSort {
    fn sort_value(&self, row: &MovementRow) -> f64 {
        match self {
            MovementSort::Change { field, magnitude } => {
                let change = row.change(field).unwrap_or(0.0);
                if *magnitude {
                    change.abs()
                } else {
                    change
                }
            }
            MovementSort::CountAfter => row.after.count as f64,
            MovementSort::CountBefore => row.before.count as f64,
        }
    }
}

/// Parameters of one movement computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementConfig {
    pub group_key: Vec<String>,
    pub reducers: Reducers,
    pub pivot: NaiveDate,
    /// Records starting before this date are dropped from both cohorts.
    #[serde(default)]
    pub warmup: Option<NaiveDate>,
    /// Inner join when true; otherwise every group from either cohort is
    /// kept and the missing side is zero-filled.
    pub keep_only_common_groups: bool,
    pub precision: Precision,
    #[serde(default)]
    pub sort: MovementSort,
}

impl MovementConfig {
    fn validate_sort(&self) -> PipelineResult<()> {
        if let MovementSort::Change { ref field, .. } = self.sort {
            let is_margin = field == "margin" && self.reducers.margin.is_some();
            if !is_margin && !self.reducers.means.contains(field) {
                return Err(PipelineError::UnknownValueField(field.clone()));
            }
        }
        Ok(())
    }
}

/// Compute per-group movement across the pivot date.
///
/// An empty result is a normal outcome ("no movement to report").
pub fn compute_movement(
    batch: &RecordBatch,
    config: &MovementConfig,
) -> PipelineResult<Vec<MovementRow>> {
    config.validate_sort()?;

    let eligible: Cow<'_, RecordBatch> = match config.warmup {
        Some(first_eligible) => {
            let keep = DatePredicate::starts_on_or_after(first_eligible);
            Cow::Owned(batch.filtered(|r| r.span.map_or(false, |s| keep.matches(&s))))
        }
        None => Cow::Borrowed(batch),
    };

    let before = aggregate(
        &eligible,
        &config.group_key,
        &DatePredicate::ends_before(config.pivot),
        &config.reducers,
        config.precision,
    )?;
    let after = aggregate(
        &eligible,
        &config.group_key,
        &DatePredicate::starts_after(config.pivot),
        &config.reducers,
        config.precision,
    )?;

    let before: BTreeMap<_, _> = before.into_iter().map(|s| (s.key, s.stats)).collect();
    let after: BTreeMap<_, _> = after.into_iter().map(|s| (s.key, s.stats)).collect();
    let keys: BTreeSet<&Vec<String>> = before.keys().chain(after.keys()).collect();

    let with_margin = config.reducers.margin.is_some();
    let mut rows = Vec::new();

    for key in keys {
        let (b, a) = match (before.get(key), after.get(key)) {
            (Some(b), Some(a)) => (b.clone(), a.clone()),
            _ if config.keep_only_common_groups => continue,
            (b, a) => (
                b.cloned()
                    .unwrap_or_else(|| CohortStats::zeroed(&config.reducers.means, with_margin)),
                a.cloned()
                    .unwrap_or_else(|| CohortStats::zeroed(&config.reducers.means, with_margin)),
            ),
        };

        let changes = diff_stats(&b, &a, config.precision);
        rows.push(MovementRow {
            key: key.clone(),
            before: b,
            after: a,
            changes,
        });
    }

    rows.sort_by(|x, y| {
        config
            .sort
            .sort_value(y)
            .total_cmp(&config.sort.sort_value(x))
    });

    debug!(
        "Movement at {}: {} before groups, {} after groups, {} rows",
        config.pivot,
        before.len(),
        after.len(),
        rows.len()
    );

    Ok(rows)
}

fn diff_stats(before: &CohortStats, after: &CohortStats, precision: Precision) -> BTreeMap<String, f64> {
    let mut changes: BTreeMap<String, f64> = after
        .means
        .iter()
        .map(|(field, a)| {
            let b = before.mean(field).unwrap_or(0.0);
            (field.clone(), precision.round(a - b))
        })
        .collect();
    if let (Some(b), Some(a)) = (before.margin, after.margin) {
        changes.insert("margin".to_string(), precision.round(a - b));
    }
    changes
}
