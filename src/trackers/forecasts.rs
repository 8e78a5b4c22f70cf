//! Chamber and seat forecast notifications.

use super::{load_batch, Ledger, TrackerOutput};
use crate::analysis::Precision;
use crate::config::{NationalForecastConfig, SeatForecastConfig};
use crate::models::{CanonicalRecord, ChamberForecast, RecordBatch, SeatForecast};
use crate::normalize::DateRules;
use crate::report::{chamber_message, leader, seat_line, seats_message};
use crate::sources::{self, Chamber};
use crate::state::StateStore;
use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

/// Integer percent of a probability rounded to two decimals.
pub fn percent(fraction: f64) -> i64 {
    (Precision::TWO.round(fraction) * 100.0).round() as i64
}

/// Last whitespace-separated word of a candidate name.
fn last_name(full: &str) -> String {
    full.split_whitespace().last().unwrap_or_default().to_string()
}

fn value(record: &CanonicalRecord, field: &str) -> Result<f64> {
    record
        .value(field)
        .with_context(|| format!("Forecast row has no '{}'", field))
}

/// The first topline row for `expression`.
pub fn chamber_forecast(batch: &RecordBatch, expression: &str) -> Result<ChamberForecast> {
    let record = batch
        .records
        .iter()
        .find(|r| r.identity.first().map(String::as_str) == Some(expression))
        .ok_or_else(|| anyhow!("No national forecast for expression '{}'", expression))?;

    Ok(ChamberForecast {
        prob_d: percent(value(record, "probD")?),
        prob_r: percent(value(record, "probR")?),
        seats_d: value(record, "seatsD")?.trunc() as i64,
        seats_r: value(record, "seatsR")?.trunc() as i64,
        expression: expression.trim_start_matches('_').to_string(),
    })
}

/// The first district starting with `seat` among `candidates`.
pub fn seat_forecast(candidates: &RecordBatch, seat: &str) -> Option<Result<SeatForecast>> {
    let record = candidates
        .records
        .iter()
        .find(|r| r.identity.first().map_or(false, |d| d.starts_with(seat)))?;

    let build = || -> Result<SeatForecast> {
        let margin = Precision::ONE.round(value(record, "margin")?);
        Ok(SeatForecast {
            name_d: last_name(record.label("nameD").unwrap_or_default()),
            name_r: last_name(record.label("nameR").unwrap_or_default()),
            prob_d: percent(value(record, "probD")?),
            prob_r: percent(value(record, "probR")?),
            margin: margin.abs(),
            margin_leader: leader(margin).to_string(),
        })
    };
    Some(build())
}

pub fn run_national<S: StateStore + ?Sized>(
    payload: &[u8],
    chamber: Chamber,
    config: &NationalForecastConfig,
    ledger: &mut Ledger<'_, S>,
) -> Result<TrackerOutput> {
    let batch = load_batch(payload, &sources::national_toplines(), &DateRules::default())?;
    let forecast = chamber_forecast(&batch, &config.expression)?;

    let evaluation = ledger.evaluate(chamber.name(), &forecast, &config.rule())?;
    if !evaluation.should_report() {
        debug!("No reportable change in the {} forecast", chamber);
        return Ok(TrackerOutput::default());
    }
    let message = chamber_message(chamber, &forecast);
    ledger.accept(&evaluation)?;
    Ok(TrackerOutput::with_message(message))
}

pub fn run_seats<S: StateStore + ?Sized>(
    payload: &[u8],
    chamber: Chamber,
    config: &SeatForecastConfig,
    ledger: &mut Ledger<'_, S>,
) -> Result<TrackerOutput> {
    let batch = load_batch(payload, &sources::district_toplines(), &DateRules::default())?;
    let candidates = batch.filtered(|r| r.variant.as_deref() == Some(config.expression.as_str()));
    if candidates.is_empty() {
        return Err(anyhow!(
            "No {} seat forecasts for expression '{}'",
            chamber,
            config.expression
        ));
    }

    let mut output = TrackerOutput::default();
    let mut lines = Vec::new();
    for seat in config.seats(chamber) {
        let seat = seat.to_uppercase();
        match seat_line_if_changed(&candidates, chamber, &seat, config, ledger) {
            Ok(Some(line)) => lines.push(line),
            Ok(None) => {}
            Err(e) => {
                warn!("Seat {} skipped: {:#}", seat, e);
                output.failures.push(format!("{}: {:#}", seat, e));
            }
        }
    }

    if let Some(message) = seats_message(chamber, &config.expression, &lines) {
        output.messages.push(message);
    }
    Ok(output)
}

fn seat_line_if_changed<S: StateStore + ?Sized>(
    candidates: &RecordBatch,
    chamber: Chamber,
    seat: &str,
    config: &SeatForecastConfig,
    ledger: &mut Ledger<'_, S>,
) -> Result<Option<String>> {
    let forecast = seat_forecast(candidates, seat)
        .ok_or_else(|| anyhow!("Seat '{}' is not in the {} forecast", seat, chamber))??;

    let key = format!("{}_{}", chamber.name(), seat);
    let evaluation = ledger.evaluate(&key, &forecast, &config.rule())?;
    if !evaluation.should_report() {
        return Ok(None);
    }
    let line = seat_line(seat, &forecast);
    ledger.accept(&evaluation)?;
    Ok(Some(line))
}
