//! Cohort aggregation.
//!
//! Filters a batch by a date predicate, groups the survivors by a key tuple
//! and reduces each group to rounded means, a row count and an optional
//! margin.
//!
//! Rounding order is fixed: each base mean is rounded first, the margin is
//! taken from the rounded means and then rounded again.

use super::Precision;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CohortStats, CohortSummary, DateSpan, RecordBatch, Schema};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Which end of a record's interval a predicate looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateField {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateComparison {
    Before,
    OnOrBefore,
    After,
    OnOrAfter,
}

/// Comparison of one interval end against a pivot date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatePredicate {
    pub field: DateField,
    pub comparison: DateComparison,
    pub pivot: NaiveDate,
}

impl DatePredicate {
    /// `end_date < pivot`
    pub fn ends_before(pivot: NaiveDate) -> Self {
        Self {
            field: DateField::End,
            comparison: DateComparison::Before,
            pivot,
        }
    }

    /// `start_date > pivot`
    pub fn starts_after(pivot: NaiveDate) -> Self {
        Self {
            field: DateField::Start,
            comparison: DateComparison::After,
            pivot,
        }
    }

    /// `start_date >= date`
    pub fn starts_on_or_after(date: NaiveDate) -> Self {
        Self {
            field: DateField::Start,
            comparison: DateComparison::OnOrAfter,
            pivot: date,
        }
    }

    pub fn matches(&self, span: &DateSpan) -> bool {
        let date = match self.field {
            DateField::Start => span.start,
            DateField::End => span.end,
        };
        match self.comparison {
            DateComparison::Before => date < self.pivot,
            DateComparison::OnOrBefore => date <= self.pivot,
            DateComparison::After => date > self.pivot,
            DateComparison::OnOrAfter => date >= self.pivot,
        }
    }
}

/// Signed difference of two mean fields, reported as `margin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginSpec {
    pub minuend: String,
    pub subtrahend: String,
}

impl MarginSpec {
    pub fn new(minuend: &str, subtrahend: &str) -> Self {
        Self {
            minuend: minuend.to_string(),
            subtrahend: subtrahend.to_string(),
        }
    }

    /// Margin of two already-rounded means, rounded again.
    pub fn apply(&self, means: &BTreeMap<String, f64>, precision: Precision) -> Option<f64> {
        let a = means.get(&self.minuend)?;
        let b = means.get(&self.subtrahend)?;
        Some(precision.round(a - b))
    }
}

/// What each group is reduced to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reducers {
    /// Value fields averaged per group.
    pub means: Vec<String>,
    #[serde(default)]
    pub margin: Option<MarginSpec>,
}

impl Reducers {
    pub fn means_of(fields: &[&str]) -> Self {
        Self {
            means: fields.iter().map(|f| f.to_string()).collect(),
            margin: None,
        }
    }

    pub fn with_margin(mut self, minuend: &str, subtrahend: &str) -> Self {
        self.margin = Some(MarginSpec::new(minuend, subtrahend));
        self
    }

    /// Fails when a reduced field is not part of the batch schema.
    pub fn validate(&self, schema: &Schema) -> PipelineResult<()> {
        schema.require_values(&self.means)?;
        if let Some(ref margin) = self.margin {
            for field in [&margin.minuend, &margin.subtrahend] {
                if !self.means.contains(field) {
                    return Err(PipelineError::UnknownValueField(field.clone()));
                }
            }
        }
        Ok(())
    }
}

struct Accumulator {
    sums: Vec<f64>,
    count: usize,
}

impl Accumulator {
    fn new(width: usize) -> Self {
        Self {
            sums: vec![0.0; width],
            count: 0,
        }
    }

    fn finish(self, reducers: &Reducers, precision: Precision) -> CohortStats {
        let n = self.count as f64;
        let means: BTreeMap<String, f64> = reducers
            .means
            .iter()
            .zip(self.sums)
            .map(|(field, sum)| (field.clone(), precision.round(sum / n)))
            .collect();
        let margin = reducers
            .margin
            .as_ref()
            .and_then(|m| m.apply(&means, precision));
        CohortStats {
            means,
            count: self.count,
            margin,
        }
    }
}

/// Aggregate the records matching `predicate`, grouped by `group_key`.
///
/// Groups without matching records do not appear in the output. Output is
/// ordered by group key.
pub fn aggregate(
    batch: &RecordBatch,
    group_key: &[String],
    predicate: &DatePredicate,
    reducers: &Reducers,
    precision: Precision,
) -> PipelineResult<Vec<CohortSummary>> {
    if !batch.schema.has_dates {
        return Err(PipelineError::MissingDates);
    }
    let resolver = batch.schema.key_resolver(group_key)?;
    reducers.validate(&batch.schema)?;

    let mut groups: BTreeMap<Vec<String>, Accumulator> = BTreeMap::new();
    let mut matched = 0usize;

    for record in &batch.records {
        let Some(span) = record.span else {
            continue;
        };
        if !predicate.matches(&span) {
            continue;
        }
        matched += 1;

        let acc = groups
            .entry(resolver.key_of(record))
            .or_insert_with(|| Accumulator::new(reducers.means.len()));
        for (sum, field) in acc.sums.iter_mut().zip(&reducers.means) {
            *sum += record
                .value(field)
                .ok_or_else(|| PipelineError::UnknownValueField(field.clone()))?;
        }
        acc.count += 1;
    }

    debug!(
        "Cohort {:?} {:?} {}: {} records in {} groups",
        predicate.field,
        predicate.comparison,
        predicate.pivot,
        matched,
        groups.len()
    );

    Ok(groups
        .into_iter()
        .map(|(key, acc)| CohortSummary {
            key,
            stats: acc.finish(reducers, precision),
        })
        .collect())
}
