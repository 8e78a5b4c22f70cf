//! Calendar date normalization.
//!
//! Sources publish dates as `YYYY-MM-DD`, `M/D/YYYY` or `M/D/YY`. Two-digit
//! years are only expanded through an explicit suffix table; anything else
//! is rejected rather than guessed.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Replace a literal trailing suffix (e.g. `/22`) with a full-year suffix (`/2022`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearSuffixRule {
    pub suffix: String,
    pub replacement: String,
}

impl YearSuffixRule {
    pub fn new(suffix: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            suffix: suffix.into(),
            replacement: replacement.into(),
        }
    }
}

/// The allowed two-digit-year expansions for a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRules {
    pub year_suffixes: Vec<YearSuffixRule>,
}

impl DateRules {
    pub fn new(year_suffixes: Vec<YearSuffixRule>) -> Self {
        Self { year_suffixes }
    }

    /// Rules expanding `/YY` to `/20YY` for each listed full year.
    pub fn for_years(years: &[i32]) -> Self {
        let year_suffixes = years
            .iter()
            .map(|year| YearSuffixRule::new(format!("/{:02}", year % 100), format!("/{}", year)))
            .collect();
        Self { year_suffixes }
    }

    /// Parse one date string.
    ///
    /// Returns a human-readable reason on failure; the caller attaches the
    /// row and field.
    pub fn parse(&self, raw: &str) -> Result<NaiveDate, String> {
        let value = raw.trim();

        if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
            return Ok(date);
        }

        if has_four_digit_year(value) {
            return NaiveDate::parse_from_str(value, "%m/%d/%Y")
                .map_err(|e| format!("is not a valid date '{}': {}", value, e));
        }

        let rule = self
            .year_suffixes
            .iter()
            .find(|rule| value.ends_with(rule.suffix.as_str()))
            .ok_or_else(|| format!("has a year suffix with no expansion rule: '{}'", value))?;

        let expanded = format!(
            "{}{}",
            &value[..value.len() - rule.suffix.len()],
            rule.replacement
        );
        NaiveDate::parse_from_str(&expanded, "%m/%d/%Y")
            .map_err(|e| format!("is not a valid date '{}': {}", value, e))
    }
}

fn has_four_digit_year(value: &str) -> bool {
    value
        .rsplit('/')
        .next()
        .map(|year| year.len() == 4 && year.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
        && value.contains('/')
}
