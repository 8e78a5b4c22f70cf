//! Generic-ballot average: latest lead notification and rolling margins.

use super::{load_batch, Ledger, TrackerOutput};
use crate::analysis::{rejoin_variants, rolling_means, Precision, RejoinConfig, VariantDiff};
use crate::config::GcbAverageConfig;
use crate::models::RecordBatch;
use crate::normalize::DateRules;
use crate::report::{gcb_message, rolling_table, Table};
use crate::sources;
use crate::state::StateStore;
use anyhow::{bail, Context, Result};
use chrono::{Duration, NaiveDate};
use serde_json::Value;
use tracing::debug;

pub const STATE_KEY: &str = "gcb_average";
pub const DEMOCRATS: &str = "Democrats";
pub const REPUBLICANS: &str = "Republicans";
pub const ROLLING_TABLE: &str = "GCB Average Movement";

/// Latest party estimates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GcbAverage {
    pub dem: f64,
    pub rep: f64,
}

impl GcbAverage {
    /// Democratic minus Republican, unrounded.
    pub fn lead(&self) -> f64 {
        self.dem - self.rep
    }
}

pub fn run<S: StateStore + ?Sized>(
    payload: &[u8],
    config: &GcbAverageConfig,
    ledger: &mut Ledger<'_, S>,
    today: NaiveDate,
) -> Result<TrackerOutput> {
    let batch = load_batch(payload, &sources::gcb_averages(&config.election), &DateRules::default())?;
    let mut output = TrackerOutput::default();

    if config.notify {
        if let Some(message) = notify(&batch, config, ledger)? {
            output.messages.push(message);
        }
    }
    if config.rolling {
        output.tables.push(rolling_margin_table(&batch, config, today)?);
    }
    Ok(output)
}

/// Sum of the last two rows per party, in file order.
pub fn latest_average(batch: &RecordBatch) -> Result<GcbAverage> {
    if batch.len() < 2 {
        bail!("Need two average rows, found {}", batch.len());
    }
    let mut average = GcbAverage { dem: 0.0, rep: 0.0 };
    for record in &batch.records[batch.len() - 2..] {
        let pct = record.value("pct").context("Average row has no estimate")?;
        match record.variant.as_deref().and_then(|v| v.chars().next()) {
            Some('D') => average.dem += pct,
            Some('R') => average.rep += pct,
            _ => bail!("Unexpected candidate {:?} in averages", record.variant),
        }
    }
    Ok(average)
}

fn notify<S: StateStore + ?Sized>(
    batch: &RecordBatch,
    config: &GcbAverageConfig,
    ledger: &mut Ledger<'_, S>,
) -> Result<Option<String>> {
    let average = latest_average(batch)?;
    let lead = average.lead();
    let evaluation = ledger.evaluate(STATE_KEY, &lead, &config.rule())?;
    if !evaluation.should_report() {
        debug!("Average lead {} is within threshold", lead);
        return Ok(None);
    }

    let previous = evaluation.previous.as_ref().and_then(Value::as_f64).unwrap_or(0.0);
    let message = gcb_message(average.dem, average.rep, lead, lead - previous);
    ledger.accept(&evaluation)?;
    Ok(Some(message))
}

/// Daily Democratic margin with trailing means, limited to `history_days`.
pub fn rolling_margin_table(batch: &RecordBatch, config: &GcbAverageConfig, today: NaiveDate) -> Result<Table> {
    let rejoin = RejoinConfig {
        variants: vec![DEMOCRATS.to_string(), REPUBLICANS.to_string()],
        entity_key: Vec::new(),
        match_dates: true,
        truncation: None,
        margin: None,
        diff: Some(VariantDiff {
            field: "pct".to_string(),
            minuend: DEMOCRATS.to_string(),
            subtrahend: REPUBLICANS.to_string(),
        }),
        precision: Precision::FINE,
    };
    let rows = rejoin_variants(batch, &rejoin)?;

    let series: Vec<(NaiveDate, f64)> = rows
        .iter()
        .filter_map(|row| Some((row.span?.start, row.delta?.value)))
        .collect();
    let cutoff = today - Duration::days(config.history_days);
    let points: Vec<_> = rolling_means(&series, &config.rolling_windows, Precision::TWO)
        .into_iter()
        .filter(|point| point.date >= cutoff)
        .collect();

    Ok(rolling_table(ROLLING_TABLE, &config.rolling_windows, &points))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Cell;
    use crate::state::MemoryStore;
    use crate::trackers::tests::{day, ledger, AVERAGES};
    use serde_json::json;

    fn config() -> GcbAverageConfig {
        GcbAverageConfig {
            rolling_windows: vec![2, 3],
            ..Default::default()
        }
    }

    fn batch() -> RecordBatch {
        load_batch(AVERAGES.as_bytes(), &sources::gcb_averages("2022-11-08"), &DateRules::default()).unwrap()
    }

    #[test]
    fn test_latest_average_skips_other_elections() {
        let average = latest_average(&batch()).unwrap();
        assert_eq!(average, GcbAverage { dem: 45.5, rep: 42.75 });
        assert_eq!(average.lead(), 2.75);
    }

    #[test]
    fn test_change_is_reported_against_stored_lead() {
        let mut store = MemoryStore::with_entries([(STATE_KEY.to_string(), json!(2.0))].into_iter().collect());
        let message = {
            let mut ledger = ledger(&mut store, false);
            notify(&batch(), &config(), &mut ledger).unwrap()
        };
        assert_eq!(message.as_deref(), Some("GCB\nD:45.5 R:42.75\nD+2.75 (chg: D+0.75)"));
        assert_eq!(store.get(STATE_KEY), Some(&json!(2.75)));
    }

    #[test]
    fn test_small_move_is_suppressed() {
        let mut store = MemoryStore::with_entries([(STATE_KEY.to_string(), json!(2.7))].into_iter().collect());
        let message = {
            let mut ledger = ledger(&mut store, false);
            notify(&batch(), &config(), &mut ledger).unwrap()
        };
        assert!(message.is_none());
        assert_eq!(store.write_count, 0);
    }

    #[test]
    fn test_rolling_margin_table() {
        let table = rolling_margin_table(&batch(), &config(), day(2022, 9, 10)).unwrap();
        assert_eq!(table.columns, vec!["date", "margin", "2-day", "3-day"]);
        assert_eq!(table.len(), 4);
        assert_eq!(table.cell(0, "date"), Some(&Cell::text("2022-09-04")));
        assert_eq!(table.cell(0, "margin"), Some(&Cell::Number(2.75)));
        assert_eq!(table.cell(0, "2-day"), Some(&Cell::Number(2.5)));
        assert_eq!(table.cell(0, "3-day"), Some(&Cell::Number(2.17)));
        assert_eq!(table.cell(1, "2-day"), Some(&Cell::Number(1.88)));
        assert_eq!(table.cell(3, "2-day"), Some(&Cell::Empty));
    }

    #[test]
    fn test_history_cutoff() {
        let mut config = config();
        config.history_days = 7;
        let table = rolling_margin_table(&batch(), &config, day(2022, 9, 10)).unwrap();
        // Only 09-03 and 09-04 fall inside the last week.
        assert_eq!(table.len(), 2);
        assert_eq!(table.cell(1, "3-day"), Some(&Cell::Number(1.42)));
    }
}
