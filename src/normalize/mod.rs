//! Record normalization.
//!
//! Maps raw, per-source columns onto the canonical record shape declared by
//! a [`FieldMap`]: defaults fill missing optional fields, join-key strings
//! are case folded where the source is known to vary, dates are expanded to
//! four-digit years, and duplicate records are dropped (first seen wins).

pub mod dates;

pub use dates::{DateRules, YearSuffixRule};

use crate::error::NormalizationError;
use crate::models::{CanonicalRecord, DateSpan, RawRecord, RecordBatch, Schema};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// A canonical string field and where it comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Canonical field name.
    pub name: String,
    /// Raw column name.
    pub column: String,
    /// Substituted when the raw value is missing. `None` makes the field mandatory.
    #[serde(default)]
    pub default: Option<String>,
    /// Uppercase the value (after defaulting).
    #[serde(default)]
    pub uppercase: bool,
}

impl FieldSpec {
    pub fn new(name: &str, column: &str) -> Self {
        Self {
            name: name.to_string(),
            column: column.to_string(),
            default: None,
            uppercase: false,
        }
    }

    pub fn or_default(mut self, default: &str) -> Self {
        self.default = Some(default.to_string());
        self
    }

    pub fn uppercased(mut self) -> Self {
        self.uppercase = true;
        self
    }
}

/// A canonical numeric field and where it comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueSpec {
    pub name: String,
    pub column: String,
    #[serde(default)]
    pub default: Option<f64>,
}

impl ValueSpec {
    pub fn new(name: &str, column: &str) -> Self {
        Self {
            name: name.to_string(),
            column: column.to_string(),
            default: None,
        }
    }

    pub fn or_default(mut self, default: f64) -> Self {
        self.default = Some(default);
        self
    }
}

/// Keep only raw rows whose `column` text is one of `one_of`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilter {
    pub column: String,
    pub one_of: Vec<String>,
}

impl RowFilter {
    pub fn equals(column: &str, value: &str) -> Self {
        Self {
            column: column.to_string(),
            one_of: vec![value.to_string()],
        }
    }

    fn keeps(&self, raw: &RawRecord) -> bool {
        raw.get(&self.column)
            .as_text()
            .map(|text| self.one_of.iter().any(|v| *v == text))
            .unwrap_or(false)
    }
}

/// Declares how one source's raw columns map onto canonical records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldMap {
    pub identity: Vec<FieldSpec>,
    #[serde(default)]
    pub labels: Vec<FieldSpec>,
    pub values: Vec<ValueSpec>,
    /// Start (or single as-of) date column.
    #[serde(default)]
    pub start_date: Option<String>,
    /// End date column; defaults to the start date when absent.
    #[serde(default)]
    pub end_date: Option<String>,
    /// Variant / model-expression tag.
    #[serde(default)]
    pub variant: Option<FieldSpec>,
    /// Raw-row filters applied before anything else.
    #[serde(default)]
    pub filters: Vec<RowFilter>,
}

impl FieldMap {
    /// The schema every record normalized with this map will share.
    pub fn schema(&self) -> Schema {
        Schema {
            identity: self.identity.iter().map(|f| f.name.clone()).collect(),
            labels: self.labels.iter().map(|f| f.name.clone()).collect(),
            values: self.values.iter().map(|f| f.name.clone()).collect(),
            has_dates: self.start_date.is_some(),
            has_variant: self.variant.is_some(),
        }
    }
}

/// Normalize a raw batch.
///
/// Rows rejected by the map's filters are skipped. Any surviving row that
/// cannot be normalized fails the whole batch.
pub fn normalize(
    raw: &[RawRecord],
    field_map: &FieldMap,
    date_rules: &DateRules,
) -> Result<RecordBatch, NormalizationError> {
    let mut records = Vec::with_capacity(raw.len());
    let mut seen = HashSet::new();
    let mut filtered = 0usize;
    let mut duplicates = 0usize;

    for (row, raw_record) in raw.iter().enumerate() {
        if !field_map.filters.iter().all(|f| f.keeps(raw_record)) {
            filtered += 1;
            continue;
        }

        let record = normalize_row(row, raw_record, field_map, date_rules)?;

        let dedup_key = (
            record.identity.clone(),
            record.variant.clone(),
            record.span,
        );
        if seen.insert(dedup_key) {
            records.push(record);
        } else {
            duplicates += 1;
        }
    }

    debug!(
        "Normalized {} records ({} filtered, {} duplicates dropped)",
        records.len(),
        filtered,
        duplicates
    );

    Ok(RecordBatch::new(field_map.schema(), records))
}

fn normalize_row(
    row: usize,
    raw: &RawRecord,
    field_map: &FieldMap,
    date_rules: &DateRules,
) -> Result<CanonicalRecord, NormalizationError> {
    let identity = field_map
        .identity
        .iter()
        .map(|spec| text_field(row, raw, spec))
        .collect::<Result<Vec<_>, _>>()?;

    let labels = field_map
        .labels
        .iter()
        .map(|spec| text_field(row, raw, spec).map(|v| (spec.name.clone(), v)))
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    let values = field_map
        .values
        .iter()
        .map(|spec| value_field(row, raw, spec).map(|v| (spec.name.clone(), v)))
        .collect::<Result<BTreeMap<_, _>, _>>()?;

    let span = match field_map.start_date {
        Some(ref start_column) => {
            let start = date_field(row, raw, start_column, date_rules)?;
            let end = match field_map.end_date {
                Some(ref end_column) => date_field(row, raw, end_column, date_rules)?,
                None => start,
            };
            if end < start {
                return Err(NormalizationError::new(
                    row,
                    field_map.end_date.as_deref().unwrap_or(start_column),
                    format!("ends ({}) before it starts ({})", end, start),
                ));
            }
            Some(DateSpan::new(start, end))
        }
        None => None,
    };

    let variant = field_map
        .variant
        .as_ref()
        .map(|spec| text_field(row, raw, spec))
        .transpose()?;

    Ok(CanonicalRecord {
        identity,
        span,
        values,
        labels,
        variant,
    })
}

fn text_field(row: usize, raw: &RawRecord, spec: &FieldSpec) -> Result<String, NormalizationError> {
    let value = match raw.get(&spec.column).as_text() {
        Some(text) => text,
        None => spec.default.clone().ok_or_else(|| {
            NormalizationError::new(row, &spec.name, "is missing and has no default")
        })?,
    };
    Ok(if spec.uppercase {
        value.to_uppercase()
    } else {
        value
    })
}

fn value_field(row: usize, raw: &RawRecord, spec: &ValueSpec) -> Result<f64, NormalizationError> {
    let cell = raw.get(&spec.column);
    if cell.is_missing() {
        return spec.default.ok_or_else(|| {
            NormalizationError::new(row, &spec.name, "is missing and has no default")
        });
    }
    cell.as_number()
        .ok_or_else(|| NormalizationError::new(row, &spec.name, format!("is not numeric: {}", cell)))
}

fn date_field(
    row: usize,
    raw: &RawRecord,
    column: &str,
    date_rules: &DateRules,
) -> Result<chrono::NaiveDate, NormalizationError> {
    let text = raw
        .get(column)
        .as_text()
        .ok_or_else(|| NormalizationError::new(row, column, "is missing"))?;
    date_rules
        .parse(&text)
        .map_err(|reason| NormalizationError::new(row, column, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawValue;
    use chrono::NaiveDate;

    fn poll_map() -> FieldMap {
        FieldMap {
            identity: vec![
                FieldSpec::new("pollster", "display_name"),
                FieldSpec::new("population", "population")
                    .or_default("Not Specified")
                    .uppercased(),
                FieldSpec::new("partisan", "partisan").or_default(""),
            ],
            labels: vec![FieldSpec::new("methodology", "methodology").or_default("Not Specified")],
            values: vec![ValueSpec::new("dem", "dem"), ValueSpec::new("rep", "rep")],
            start_date: Some("start_date".into()),
            end_date: Some("end_date".into()),
            variant: None,
            filters: vec![RowFilter::equals("election_date", "11/8/22")],
        }
    }

    fn raw_poll(pollster: &str, population: Option<&str>, start: &str, end: &str) -> RawRecord {
        RawRecord::new()
            .with("display_name", RawValue::Text(pollster.into()))
            .with(
                "population",
                population.map_or(RawValue::Missing, |p| RawValue::Text(p.into())),
            )
            .with("election_date", RawValue::Text("11/8/22".into()))
            .with("start_date", RawValue::Text(start.into()))
            .with("end_date", RawValue::Text(end.into()))
            .with("dem", RawValue::Text("45".into()))
            .with("rep", RawValue::Number(41.5))
    }

    fn rules() -> DateRules {
        DateRules::for_years(&[2021, 2022])
    }

    #[test]
    fn test_defaults_and_case_folding() {
        let raw = vec![
            raw_poll("Acme", Some("lv"), "11/1/22", "11/2/22"),
            raw_poll("Beta", None, "11/1/22", "11/2/22"),
        ];
        let batch = normalize(&raw, &poll_map(), &rules()).unwrap();

        assert_eq!(batch.records[0].identity, vec!["Acme", "LV", ""]);
        assert_eq!(batch.records[1].identity, vec!["Beta", "NOT SPECIFIED", ""]);
        assert_eq!(batch.records[0].label("methodology"), Some("Not Specified"));
        assert_eq!(batch.records[0].value("dem"), Some(45.0));
        assert_eq!(batch.records[0].value("rep"), Some(41.5));
        assert_eq!(
            batch.records[0].span.unwrap().end,
            NaiveDate::from_ymd_opt(2022, 11, 2).unwrap()
        );
    }

    #[test]
    fn test_missing_mandatory_identity_fails() {
        let raw = vec![raw_poll("Acme", None, "11/1/22", "11/2/22")
            .with("display_name", RawValue::Missing)];
        let err = normalize(&raw, &poll_map(), &rules()).unwrap_err();
        assert_eq!(err.row, 0);
        assert_eq!(err.field, "pollster");
    }

    #[test]
    fn test_unlisted_year_suffix_fails() {
        let raw = vec![raw_poll("Acme", None, "12/30/22", "1/2/23")];
        let err = normalize(&raw, &poll_map(), &rules()).unwrap_err();
        assert_eq!(err.field, "end_date");
    }

    #[test]
    fn test_inverted_interval_fails() {
        let raw = vec![raw_poll("Acme", None, "11/5/22", "11/2/22")];
        assert!(normalize(&raw, &poll_map(), &rules()).is_err());
    }

    #[test]
    fn test_non_numeric_value_fails() {
        let raw = vec![raw_poll("Acme", None, "11/1/22", "11/2/22")
            .with("dem", RawValue::Text("n/a".into()))];
        let err = normalize(&raw, &poll_map(), &rules()).unwrap_err();
        assert!(err.reason.contains("not numeric"));
    }

    #[test]
    fn test_filters_skip_rows_before_validation() {
        let raw = vec![
            raw_poll("Acme", None, "11/1/22", "11/2/22"),
            raw_poll("Old", None, "11/1/18", "11/2/18")
                .with("election_date", RawValue::Text("11/6/18".into())),
        ];
        let batch = normalize(&raw, &poll_map(), &rules()).unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_duplicates_first_seen_wins() {
        let raw = vec![
            raw_poll("Acme", Some("LV"), "11/1/22", "11/2/22"),
            raw_poll("Acme", Some("lv"), "11/1/22", "11/2/22").with("dem", RawValue::Number(50.0)),
            raw_poll("Acme", Some("LV"), "11/3/22", "11/4/22"),
        ];
        let batch = normalize(&raw, &poll_map(), &rules()).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].value("dem"), Some(45.0));
    }

    #[test]
    fn test_variant_dedup_and_schema() {
        let map = FieldMap {
            identity: vec![FieldSpec::new("district", "district")],
            values: vec![ValueSpec::new("probD", "winner_Dparty")],
            variant: Some(FieldSpec::new("expression", "expression")),
            ..FieldMap::default()
        };
        let row = |district: &str, expression: &str, p: f64| {
            RawRecord::new()
                .with("district", RawValue::Text(district.into()))
                .with("expression", RawValue::Text(expression.into()))
                .with("winner_Dparty", RawValue::Number(p))
        };
        let raw = vec![
            row("CA-01", "_deluxe", 0.1),
            row("CA-01", "_deluxe", 0.2),
            row("CA-01", "_lite", 0.3),
        ];
        let batch = normalize(&raw, &map, &DateRules::default()).unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.schema.has_variant);
        assert!(!batch.schema.has_dates);
        assert_eq!(batch.records[0].value("probD"), Some(0.1));
        assert_eq!(batch.records[1].variant.as_deref(), Some("_lite"));
    }
}
