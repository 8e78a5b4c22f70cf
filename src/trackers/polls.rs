//! Generic-ballot poll trackers: movement around events and the RV/LV gap.

use super::{load_batch, Ledger, TrackerOutput};
use crate::analysis::{
    compute_movement, rejoin_variants, MarginSpec, MovementConfig, Reducers, RejoinConfig, VariantDiff,
};
use crate::config::{MovementEvent, PollMovementConfig, PopulationDiffConfig};
use crate::models::{MovementDigest, MovementRow, RecordBatch};
use crate::normalize::DateRules;
use crate::report::{comparison_table, movement_message, movement_table, Table};
use crate::sources;
use crate::state::{ChangeRule, StateStore};
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

pub const POPULATION_TABLE: &str = "Z-Population Difference";

/// Pollster fields shared by both population rows of one poll.
const POLL_KEY: [&str; 5] = ["poll_id", "pollsterName", "fteGrade", "sponsor", "partisan"];

fn reducers() -> Reducers {
    Reducers::means_of(&["dem", "rep"]).with_margin("dem", "rep")
}

/// Summary of an event's movement used as its notification state.
pub fn digest(rows: &[MovementRow]) -> MovementDigest {
    let top = rows.first();
    MovementDigest {
        rows: rows.len(),
        top: top.map(|row| {
            row.key
                .iter()
                .filter(|part| !part.is_empty())
                .cloned()
                .collect::<Vec<_>>()
                .join(" / ")
        }),
        change: top.and_then(|row| row.change("margin")),
    }
}

pub fn run_movement<S: StateStore + ?Sized>(
    payload: &[u8],
    config: &PollMovementConfig,
    ledger: &mut Ledger<'_, S>,
) -> Result<TrackerOutput> {
    let batch = load_batch(
        payload,
        &sources::gcb_polls(&config.election_date),
        &DateRules::for_years(&config.years),
    )?;

    let mut output = TrackerOutput::default();
    for event in &config.events {
        match event_movement(&batch, config, event) {
            Ok(rows) => {
                if config.notify {
                    match notify(event, &rows, ledger) {
                        Ok(Some(message)) => output.messages.push(message),
                        Ok(None) => {}
                        Err(e) => output.failures.push(format!("{}: {:#}", event.label, e)),
                    }
                }
                output.tables.push(movement_table(
                    &event.label,
                    &config.group_key,
                    &reducers().means,
                    true,
                    &rows,
                ));
            }
            Err(e) => {
                warn!("Event '{}' skipped: {:#}", event.label, e);
                output.failures.push(format!("{}: {:#}", event.label, e));
            }
        }
    }
    Ok(output)
}

pub fn event_movement(
    batch: &RecordBatch,
    config: &PollMovementConfig,
    event: &MovementEvent,
) -> Result<Vec<MovementRow>> {
    let movement = MovementConfig {
        group_key: config.group_key.clone(),
        reducers: reducers(),
        pivot: event.pivot,
        warmup: event.warmup,
        keep_only_common_groups: config.keep_only_common_groups,
        precision: config.precision,
        sort: config.sort.clone(),
    };
    let rows = compute_movement(batch, &movement)
        .with_context(|| format!("Failed to compute movement for '{}'", event.label))?;
    if rows.is_empty() {
        info!("No movement around '{}'", event.label);
    }
    Ok(rows)
}

fn notify<S: StateStore + ?Sized>(
    event: &MovementEvent,
    rows: &[MovementRow],
    ledger: &mut Ledger<'_, S>,
) -> Result<Option<String>> {
    let digest = digest(rows);
    let key = format!("movement:{}", event.label);
    let evaluation = ledger.evaluate(&key, &digest, &ChangeRule::Equality)?;
    if !evaluation.should_report() {
        return Ok(None);
    }
    let message = movement_message(&event.label, &digest);
    ledger.accept(&evaluation)?;
    Ok(Some(message))
}

pub fn run_population_diff(payload: &[u8], config: &PopulationDiffConfig) -> Result<TrackerOutput> {
    let batch = load_batch(
        payload,
        &sources::gcb_polls_by_population(&config.election_date),
        &DateRules::for_years(&config.years),
    )?;
    Ok(TrackerOutput {
        tables: vec![population_table(&batch, config)?],
        ..Default::default()
    })
}

/// Pair each poll's two population rows and diff their margins.
pub fn population_table(batch: &RecordBatch, config: &PopulationDiffConfig) -> Result<Table> {
    let batch = match config.since {
        Some(since) => batch.filtered(|r| r.span.map_or(false, |s| s.start >= since)),
        None => batch.clone(),
    };
    let (first, second) = match config.variants.as_slice() {
        [first, second] => (first.clone(), second.clone()),
        _ => anyhow::bail!("Population difference needs exactly two populations"),
    };

    let diff = VariantDiff {
        field: "margin".to_string(),
        minuend: second,
        subtrahend: first,
    };
    let entity_key: Vec<String> = POLL_KEY.iter().map(|f| f.to_string()).collect();
    let rejoin = RejoinConfig {
        variants: config.variants.clone(),
        entity_key: entity_key.clone(),
        match_dates: true,
        truncation: None,
        margin: Some(MarginSpec::new("dem", "rep")),
        diff: Some(diff.clone()),
        precision: config.precision,
    };
    let rows = rejoin_variants(&batch, &rejoin)?;
    debug!("{} polls report both populations", rows.len());

    Ok(comparison_table(
        POPULATION_TABLE,
        &entity_key,
        &["methodology".to_string()],
        &["dem".to_string(), "rep".to_string(), "margin".to_string()],
        &config.variants,
        Some(&diff),
        &rows,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::MovementSort;
    use crate::report::Cell;
    use crate::state::MemoryStore;
    use crate::trackers::tests::{day, ledger, POLLS};

    fn movement_config() -> PollMovementConfig {
        PollMovementConfig {
            events: vec![MovementEvent {
                label: "1-Dobbs".into(),
                pivot: day(2022, 6, 24),
                warmup: Some(day(2022, 1, 1)),
            }],
            ..Default::default()
        }
    }

    fn polls(config: &PollMovementConfig) -> RecordBatch {
        load_batch(
            POLLS.as_bytes(),
            &sources::gcb_polls(&config.election_date),
            &DateRules::for_years(&config.years),
        )
        .unwrap()
    }

    fn key(row: &MovementRow) -> String {
        row.key.join("|")
    }

    #[test]
    fn test_movement_outer_join_zero_fills() {
        let config = movement_config();
        let rows = event_movement(&polls(&config), &config, &config.events[0]).unwrap();

        assert_eq!(rows.len(), 4);
        // Ties on the after count keep key order.
        assert_eq!(key(&rows[0]), "Acme Research|B||LV|");
        assert_eq!(key(&rows[1]), "Beta Polling|Unrated|Daily News|RV|");
        assert_eq!(rows[0].change("margin"), Some(3.0));
        assert_eq!(rows[1].before.count, 0);
        assert_eq!(rows[1].change("margin"), Some(3.0));

        let gamma = rows.iter().find(|r| r.key[0] == "Gamma Insights").unwrap();
        assert_eq!(gamma.key[3], "NOT SPECIFIED");
        assert_eq!(gamma.change("margin"), Some(4.0));
    }

    #[test]
    fn test_movement_inner_join() {
        let mut config = movement_config();
        config.keep_only_common_groups = true;
        let rows = event_movement(&polls(&config), &config, &config.events[0]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].before.margin, Some(5.0));
        assert_eq!(rows[0].after.margin, Some(8.0));
    }

    #[test]
    fn test_movement_sorted_by_change() {
        let mut config = movement_config();
        config.sort = MovementSort::default();
        let rows = event_movement(&polls(&config), &config, &config.events[0]).unwrap();
        assert_eq!(rows[0].key[0], "Gamma Insights");
    }

    #[test]
    fn test_movement_tables_and_digest_notification() {
        let mut config = movement_config();
        config.notify = true;
        let mut store = MemoryStore::new();
        let output = {
            let mut ledger = ledger(&mut store, false);
            run_movement(POLLS.as_bytes(), &config, &mut ledger).unwrap()
        };

        assert_eq!(output.tables.len(), 1);
        let table = &output.tables[0];
        assert_eq!(table.name, "1-Dobbs");
        assert_eq!(table.cell(0, "pollsterName"), Some(&Cell::text("Acme Research")));
        assert_eq!(table.cell(0, "margin_change"), Some(&Cell::Number(3.0)));
        assert_eq!(table.cell(0, "count_after"), Some(&Cell::Integer(1)));
        assert_eq!(
            output.messages,
            vec!["MOVEMENT: 1-Dobbs\nGroups: 4\nTop mover: Acme Research / B / LV (D+3.0)"]
        );
        assert!(store.get("movement:1-Dobbs").is_some());

        let mut ledger = ledger(&mut store, false);
        let again = run_movement(POLLS.as_bytes(), &config, &mut ledger).unwrap();
        assert!(again.messages.is_empty());
    }

    #[test]
    fn test_population_difference() {
        let config = PopulationDiffConfig::default();
        let batch = load_batch(
            POLLS.as_bytes(),
            &sources::gcb_polls_by_population(&config.election_date),
            &DateRules::for_years(&config.years),
        )
        .unwrap();
        let table = population_table(&batch, &config).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.cell(0, "poll_id"), Some(&Cell::text("101")));
        assert_eq!(table.cell(0, "start_date"), Some(&Cell::text("06/01/2022")));
        assert_eq!(table.cell(0, "marginRV"), Some(&Cell::Number(3.0)));
        assert_eq!(table.cell(0, "marginLV"), Some(&Cell::Number(5.0)));
        assert_eq!(table.cell(0, "marginLV_minusRV"), Some(&Cell::Number(2.0)));
        assert_eq!(table.cell(0, "marginLV_minusRV_abs"), Some(&Cell::Number(2.0)));
    }

    #[test]
    fn test_population_difference_since_filter() {
        let config = PopulationDiffConfig {
            since: Some(day(2022, 6, 2)),
            ..Default::default()
        };
        let batch = load_batch(
            POLLS.as_bytes(),
            &sources::gcb_polls_by_population(&config.election_date),
            &DateRules::for_years(&config.years),
        )
        .unwrap();
        assert!(population_table(&batch, &config).unwrap().is_empty());
    }
}
