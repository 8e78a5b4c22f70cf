//! Side-by-side comparison of model expressions (variants).
//!
//! Records tagged with a variant are split per requested variant and
//! inner-joined on an entity key, so that every output row carries one set
//! of values per variant for the same entity. Entities missing from any
//! variant are dropped.

use super::aggregator::MarginSpec;
use super::Precision;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CanonicalRecord, ComparisonRow, DateSpan, RecordBatch, VariantDelta};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Keep only the first `length` characters of one entity key component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyTruncation {
    pub field: String,
    pub length: usize,
}

impl KeyTruncation {
    pub fn apply(&self, value: &str) -> String {
        value.chars().take(self.length).collect()
    }
}

/// `minuend − subtrahend` of one value field across two variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantDiff {
    pub field: String,
    pub minuend: String,
    pub subtrahend: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejoinConfig {
    /// Variants to compare, in output order. The first one drives row order.
    pub variants: Vec<String>,
    pub entity_key: Vec<String>,
    /// Also require matching date spans when joining.
    #[serde(default)]
    pub match_dates: bool,
    /// Applied to the joined entity key, not before the join.
    #[serde(default)]
    pub truncation: Option<KeyTruncation>,
    /// Per-variant derived margin, stored as value field `margin`.
    #[serde(default)]
    pub margin: Option<MarginSpec>,
    /// When set, rows are sorted by the magnitude of this difference.
    #[serde(default)]
    pub diff: Option<VariantDiff>,
    pub precision: Precision,
}

impl RejoinConfig {
    fn validate(&self, batch: &RecordBatch) -> PipelineResult<()> {
        if !batch.schema.has_variant {
            return Err(PipelineError::JoinKeyMismatch {
                field: "variant".to_string(),
                available: batch.schema.identity.join(", "),
            });
        }
        if let Some(ref truncation) = self.truncation {
            if !self.entity_key.contains(&truncation.field) {
                return Err(PipelineError::JoinKeyMismatch {
                    field: truncation.field.clone(),
                    available: self.entity_key.join(", "),
                });
            }
        }
        if let Some(ref margin) = self.margin {
            batch
                .schema
                .require_values(&[margin.minuend.clone(), margin.subtrahend.clone()])?;
        }
        if let Some(ref diff) = self.diff {
            let derived = diff.field == "margin" && self.margin.is_some();
            if !derived {
                batch.schema.require_values(std::slice::from_ref(&diff.field))?;
            }
        }
        Ok(())
    }
}

type JoinKey = (Vec<String>, Option<DateSpan>);

/// Pivot variant rows into one comparison row per entity.
///
/// Returns an empty sequence, not an error, when a requested variant has no
/// rows: no comparison is possible.
pub fn rejoin_variants(batch: &RecordBatch, config: &RejoinConfig) -> PipelineResult<Vec<ComparisonRow>> {
    let resolver = batch.schema.key_resolver(&config.entity_key)?;
    config.validate(batch)?;

    let join_key = |record: &CanonicalRecord| -> JoinKey {
        let span = if config.match_dates { record.span } else { None };
        (resolver.key_of(record), span)
    };

    // Per-variant lookup tables; first record per key wins.
    let mut frames: Vec<HashMap<JoinKey, &CanonicalRecord>> = Vec::with_capacity(config.variants.len());
    let mut driver_order: Vec<JoinKey> = Vec::new();

    for (idx, variant) in config.variants.iter().enumerate() {
        let mut frame = HashMap::new();
        for record in batch
            .records
            .iter()
            .filter(|r| r.variant.as_deref() == Some(variant.as_str()))
        {
            let key = join_key(record);
            if !frame.contains_key(&key) {
                if idx == 0 {
                    driver_order.push(key.clone());
                }
                frame.insert(key, record);
            }
        }
        if frame.is_empty() {
            info!("Variant '{}' has no rows; no comparison possible", variant);
            return Ok(Vec::new());
        }
        frames.push(frame);
    }

    let mut rows = Vec::new();
    for key in driver_order {
        let matched: Option<Vec<&CanonicalRecord>> =
            frames.iter().map(|frame| frame.get(&key).copied()).collect();
        let Some(matched) = matched else {
            continue;
        };
        rows.push(build_row(&key, &matched, config));
    }

    if let Some(ref diff) = config.diff {
        for row in rows.iter_mut() {
            let delta = variant_delta(row, diff, config.precision);
            row.delta = delta;
        }
        rows.sort_by(|a, b| {
            let ma = a.delta.map_or(0.0, |d| d.magnitude);
            let mb = b.delta.map_or(0.0, |d| d.magnitude);
            mb.total_cmp(&ma)
        });
    }

    debug!(
        "Rejoined {} variants on {:?}: {} rows",
        config.variants.len(),
        config.entity_key,
        rows.len()
    );

    Ok(rows)
}

fn build_row(key: &JoinKey, matched: &[&CanonicalRecord], config: &RejoinConfig) -> ComparisonRow {
    let (entity, span) = key;

    let mut entity = entity.clone();
    if let Some(ref truncation) = config.truncation {
        if let Some(pos) = config.entity_key.iter().position(|f| *f == truncation.field) {
            entity[pos] = truncation.apply(&entity[pos]);
        }
    }

    let values = config
        .variants
        .iter()
        .zip(matched)
        .map(|(variant, record)| {
            let mut fields: BTreeMap<String, f64> = record
                .values
                .iter()
                .map(|(name, value)| (name.clone(), config.precision.round(*value)))
                .collect();
            if let Some(margin) = config.margin.as_ref().and_then(|m| m.apply(&fields, config.precision)) {
                fields.insert("margin".to_string(), margin);
            }
            (variant.clone(), fields)
        })
        .collect();

    ComparisonRow {
        entity,
        span: *span,
        values,
        labels: matched[0].labels.clone(),
        delta: None,
    }
}

fn variant_delta(row: &ComparisonRow, diff: &VariantDiff, precision: Precision) -> Option<VariantDelta> {
    let a = row.value(&diff.minuend, &diff.field)?;
    let b = row.value(&diff.subtrahend, &diff.field)?;
    Some(VariantDelta {
        value: precision.round(a - b),
        magnitude: precision.round((a - b).abs()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Schema;

    fn seat(district: &str, expression: &str, prob: f64) -> CanonicalRecord {
        CanonicalRecord {
            identity: vec![district.to_string()],
            span: None,
            values: [("probD".to_string(), prob)].into_iter().collect(),
            labels: BTreeMap::new(),
            variant: Some(expression.to_string()),
        }
    }

    fn batch(records: Vec<CanonicalRecord>) -> RecordBatch {
        RecordBatch::new(
            Schema {
                identity: vec!["district".into()],
                labels: vec![],
                values: vec!["probD".into()],
                has_dates: false,
                has_variant: true,
            },
            records,
        )
    }

    fn config(variants: &[&str]) -> RejoinConfig {
        RejoinConfig {
            variants: variants.iter().map(|v| v.to_string()).collect(),
            entity_key: vec!["district".into()],
            match_dates: false,
            truncation: None,
            margin: None,
            diff: None,
            precision: Precision::TWO,
        }
    }

    #[test]
    fn test_inner_join_drops_unmatched_entities() {
        let batch = batch(vec![
            seat("CA-01", "classic", 0.10),
            seat("CA-02", "classic", 0.55),
            seat("CA-02", "deluxe", 0.60),
        ]);
        let rows = rejoin_variants(&batch, &config(&["classic", "deluxe"])).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity, vec!["CA-02"]);
        assert_eq!(rows[0].value("classic", "probD"), Some(0.55));
        assert_eq!(rows[0].value("deluxe", "probD"), Some(0.6));
    }

    #[test]
    fn test_missing_variant_returns_empty() {
        let batch = batch(vec![seat("CA-01", "classic", 0.10)]);
        let rows = rejoin_variants(&batch, &config(&["classic", "lite"])).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_truncation_and_diff_sorting() {
        let batch = batch(vec![
            seat("AZ-S3", "_deluxe", 0.4712),
            seat("GA-S2", "_deluxe", 0.52),
            seat("AZ-S3", "_lite", 0.60),
            seat("GA-S2", "_lite", 0.50),
        ]);
        let mut cfg = config(&["_deluxe", "_lite"]);
        cfg.truncation = Some(KeyTruncation {
            field: "district".into(),
            length: 2,
        });
        cfg.diff = Some(VariantDiff {
            field: "probD".into(),
            minuend: "_deluxe".into(),
            subtrahend: "_lite".into(),
        });

        let rows = rejoin_variants(&batch, &cfg).unwrap();
        assert_eq!(rows[0].entity, vec!["AZ"]);
        assert_eq!(rows[0].delta.unwrap().value, -0.13);
        assert_eq!(rows[0].delta.unwrap().magnitude, 0.13);
        assert_eq!(rows[1].entity, vec!["GA"]);
        assert_eq!(rows[1].delta.unwrap().value, 0.02);
    }

    #[test]
    fn test_rows_follow_first_variant_order_without_diff() {
        let batch = batch(vec![
            seat("B", "x", 0.1),
            seat("A", "x", 0.2),
            seat("A", "y", 0.3),
            seat("B", "y", 0.4),
        ]);
        let rows = rejoin_variants(&batch, &config(&["x", "y"])).unwrap();
        let order: Vec<_> = rows.iter().map(|r| r.entity[0].as_str()).collect();
        assert_eq!(order, vec!["B", "A"]);
    }

    #[test]
    fn test_per_variant_margin_and_diff() {
        let record = |poll: &str, population: &str, dem: f64, rep: f64| CanonicalRecord {
            identity: vec!["Acme".to_string()],
            span: None,
            values: [("dem".to_string(), dem), ("rep".to_string(), rep)]
                .into_iter()
                .collect(),
            labels: [("poll_id".to_string(), poll.to_string())].into_iter().collect(),
            variant: Some(population.to_string()),
        };
        let batch = RecordBatch::new(
            Schema {
                identity: vec!["pollster".into()],
                labels: vec!["poll_id".into()],
                values: vec!["dem".into(), "rep".into()],
                has_dates: false,
                has_variant: true,
            },
            vec![
                record("1", "RV", 45.0, 42.0),
                record("1", "LV", 44.0, 45.0),
                record("2", "RV", 46.0, 40.0),
            ],
        );
        let cfg = RejoinConfig {
            variants: vec!["RV".into(), "LV".into()],
            entity_key: vec!["poll_id".into()],
            match_dates: false,
            truncation: None,
            margin: Some(MarginSpec::new("dem", "rep")),
            diff: Some(VariantDiff {
                field: "margin".into(),
                minuend: "LV".into(),
                subtrahend: "RV".into(),
            }),
            precision: Precision::ONE,
        };
        let rows = rejoin_variants(&batch, &cfg).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("RV", "margin"), Some(3.0));
        assert_eq!(rows[0].value("LV", "margin"), Some(-1.0));
        assert_eq!(rows[0].delta.unwrap().value, -4.0);
        assert_eq!(rows[0].labels.get("poll_id").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_batch_without_variants_is_rejected() {
        let mut batch = batch(vec![]);
        batch.schema.has_variant = false;
        assert!(rejoin_variants(&batch, &config(&["x"])).is_err());
    }

    #[test]
    fn test_unknown_entity_key_is_rejected() {
        let mut cfg = config(&["x"]);
        cfg.entity_key = vec!["seat".into()];
        let err = rejoin_variants(&batch(vec![]), &cfg).unwrap_err();
        assert!(matches!(err, PipelineError::JoinKeyMismatch { .. }));
    }
}
