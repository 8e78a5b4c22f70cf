//! Newly published generic-ballot polls.
//!
//! Poll ids already seen are kept under one state key. A poll whose id is
//! not in that list is reported with the pollster's recent polls that match
//! it on the configured fields. The first run only records the ids.

use super::{load_batch, Ledger, TrackerOutput};
use crate::analysis::Precision;
use crate::config::NewPollsConfig;
use crate::error::PipelineResult;
use crate::models::{CanonicalRecord, KeyResolver, PollHistory, PollLine, RecordBatch, Schema};
use crate::normalize::DateRules;
use crate::report::{new_poll_message, Cell, Table};
use crate::sources;
use crate::state::{ChangeRule, StateStore};
use anyhow::{Context, Result};
use chrono::{Datelike, Duration, NaiveDate};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info};

pub const SEEN_KEY: &str = "gcb_polls_seen";
pub const TRIMMED_TABLE: &str = "generic_ballot_polls.trimmed";

pub fn run<S: StateStore + ?Sized>(
    payload: &[u8],
    config: &NewPollsConfig,
    ledger: &mut Ledger<'_, S>,
    today: NaiveDate,
) -> Result<TrackerOutput> {
    let rules = DateRules::for_years(&config.years);
    let mut output = TrackerOutput::default();

    if config.notify {
        let batch = load_batch(payload, &sources::poll_details(&config.election_date), &rules)?;
        output.messages = notify(&batch, config, ledger, today)?;
    }
    if config.trimmed {
        let batch = load_batch(payload, &sources::gcb_polls(&config.election_date), &rules)?;
        output.tables.push(trimmed_table(&batch, config.trimmed_year)?);
    }
    Ok(output)
}

/// Resolvers for the fields a new poll is looked up by.
struct PollFields {
    poll_id: KeyResolver,
    population: KeyResolver,
    matched: KeyResolver,
}

impl PollFields {
    fn new(schema: &Schema, match_fields: &[String]) -> PipelineResult<Self> {
        Ok(Self {
            poll_id: schema.key_resolver(&["poll_id".to_string()])?,
            population: schema.key_resolver(&["population".to_string()])?,
            matched: schema.key_resolver(match_fields)?,
        })
    }

    fn poll_id(&self, record: &CanonicalRecord) -> String {
        self.poll_id.key_of(record).concat()
    }
}

fn notify<S: StateStore + ?Sized>(
    batch: &RecordBatch,
    config: &NewPollsConfig,
    ledger: &mut Ledger<'_, S>,
    today: NaiveDate,
) -> Result<Vec<String>> {
    let fields = PollFields::new(&batch.schema, &config.match_fields)?;
    let current: BTreeSet<String> = batch.records.iter().map(|r| fields.poll_id(r)).collect();

    let evaluation = ledger.evaluate_baseline(SEEN_KEY, &current, &ChangeRule::Equality)?;
    if !evaluation.should_report() {
        debug!("No unseen polls among {}", current.len());
        return Ok(Vec::new());
    }
    let Some(previous) = evaluation.previous.clone() else {
        info!("Recording {} polls as seen", current.len());
        ledger.accept(&evaluation)?;
        return Ok(Vec::new());
    };
    let seen: BTreeSet<String> =
        serde_json::from_value(previous).context("Stored poll ids are not a list of strings")?;

    let cutoff = today - Duration::days(config.lookback_days);
    let mut reported = HashSet::new();
    let mut messages = Vec::new();
    for record in batch.records.iter().filter(|r| !seen.contains(&fields.poll_id(r))) {
        // One message per matching group, even when it has several new polls.
        if !reported.insert(fields.matched.key_of(record)) {
            continue;
        }
        match poll_history(batch, &fields, record, cutoff, config.max_polls) {
            Some(history) => messages.push(new_poll_message(&history)),
            None => debug!("Poll {} ended before the lookback window", fields.poll_id(record)),
        }
    }
    info!("{} new poll message(s)", messages.len());

    ledger.accept(&evaluation)?;
    Ok(messages)
}

/// Polls matching `poll` that ended on or after `cutoff`, newest first.
fn poll_history(
    batch: &RecordBatch,
    fields: &PollFields,
    poll: &CanonicalRecord,
    cutoff: NaiveDate,
    max_polls: usize,
) -> Option<PollHistory> {
    let key = fields.matched.key_of(poll);
    let mut matching: Vec<(&CanonicalRecord, PollLine)> = batch
        .records
        .iter()
        .filter(|r| fields.matched.key_of(r) == key)
        .filter_map(|r| Some((r, poll_line(fields, r)?)))
        .filter(|(_, line)| line.span.end >= cutoff)
        .collect();
    // Stable, so polls ending the same day keep file order.
    matching.sort_by(|(_, a), (_, b)| b.span.end.cmp(&a.span.end));
    matching.truncate(max_polls);

    let (newest, _) = matching.first()?;
    let label = |name: &str| newest.label(name).unwrap_or_default().to_string();
    let mut history = PollHistory {
        pollster: label("pollsterName"),
        grade: label("fteGrade"),
        methodology: label("methodology"),
        sponsors: label("sponsors"),
        partisan: label("partisan"),
        internal: label("internal"),
        polls: matching.iter().map(|(_, line)| line.clone()).collect(),
    };

    let margins: Vec<f64> = history.polls.iter().map(|p| p.margin).collect();
    for (line, older) in history.polls.iter_mut().zip(margins.iter().skip(1)) {
        line.change = Some(Precision::ONE.round(line.margin - older));
    }
    Some(history)
}

fn poll_line(fields: &PollFields, record: &CanonicalRecord) -> Option<PollLine> {
    let dem = record.value("dem")?;
    let rep = record.value("rep")?;
    Some(PollLine {
        span: record.span?,
        sample_size: sample_size(record.label("sample_size").unwrap_or_default()),
        population: fields.population.key_of(record).concat(),
        dem,
        rep,
        margin: Precision::ONE.round(dem - rep),
        change: None,
    })
}

/// Sample sizes are shown as whole numbers even when published as `1200.0`.
fn sample_size(raw: &str) -> String {
    match raw.parse::<f64>() {
        Ok(n) if n.is_finite() => (n.trunc() as i64).to_string(),
        _ => raw.to_string(),
    }
}

const TRIMMED_LEADING: [&str; 4] = ["pollsterName", "sponsor", "fteGrade", "methodology"];
const TRIMMED_TRAILING: [&str; 2] = ["population", "partisan"];

fn names(fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| f.to_string()).collect()
}

/// Polls starting in `year`, one row per normalized poll record.
pub fn trimmed_table(batch: &RecordBatch, year: i32) -> Result<Table> {
    let leading = batch.schema.key_resolver(&names(&TRIMMED_LEADING))?;
    let trailing = batch.schema.key_resolver(&names(&TRIMMED_TRAILING))?;

    let mut columns = names(&TRIMMED_LEADING);
    columns.extend(["startDate".to_string(), "endDate".to_string()]);
    columns.extend(names(&TRIMMED_TRAILING));
    columns.extend(["dem".to_string(), "rep".to_string()]);

    let mut table = Table::new(TRIMMED_TABLE, columns);
    for record in &batch.records {
        let Some(span) = record.span.filter(|s| s.start.year() == year) else {
            continue;
        };
        let mut cells: Vec<Cell> = leading.key_of(record).into_iter().map(Cell::Text).collect();
        cells.push(Cell::text(span.start.format("%m/%d/%Y").to_string()));
        cells.push(Cell::text(span.end.format("%m/%d/%Y").to_string()));
        cells.extend(trailing.key_of(record).into_iter().map(Cell::Text));
        cells.push(record.value("dem").into());
        cells.push(record.value("rep").into());
        table.push(cells);
    }
    debug!("{} polls in the trimmed table", table.len());
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryStore, StateMap};
    use crate::trackers::tests::{day, ledger, POLLS};
    use serde_json::json;

    const NEW_ACME_POLL: &str = "Pollster: Acme Research | Grade: B | Method: Online\n\
         Sponsor(s): No Sponsor\n\
         7/1-7/3 (1100 LV): D:47.0 R:39.0 => D+8.0 (Change: D+3.0)\n\
         6/1-6/3 (1200 LV): D:45.0 R:40.0 => D+5.0";

    fn config() -> NewPollsConfig {
        NewPollsConfig {
            trimmed: false,
            ..Default::default()
        }
    }

    fn store_with_seen(ids: &[&str]) -> MemoryStore {
        let mut entries = StateMap::new();
        entries.insert(SEEN_KEY.to_string(), json!(ids));
        MemoryStore::with_entries(entries)
    }

    fn run_on(store: &mut MemoryStore, today: NaiveDate, dry_run: bool) -> TrackerOutput {
        let mut ledger = ledger(store, dry_run);
        run(POLLS.as_bytes(), &config(), &mut ledger, today).unwrap()
    }

    #[test]
    fn test_first_run_records_ids_silently() {
        let mut store = MemoryStore::new();
        let output = run_on(&mut store, day(2022, 7, 20), false);

        assert!(output.messages.is_empty());
        assert!(output.tables.is_empty());
        assert_eq!(
            store.get(SEEN_KEY),
            Some(&json!(["101", "102", "103", "104", "105"]))
        );
    }

    #[test]
    fn test_unseen_poll_listed_with_matching_history() {
        let mut store = store_with_seen(&["101", "103", "104", "105"]);
        let output = run_on(&mut store, day(2022, 7, 20), false);

        assert_eq!(output.messages, vec![NEW_ACME_POLL]);
        assert_eq!(
            store.get(SEEN_KEY),
            Some(&json!(["101", "102", "103", "104", "105"]))
        );

        let again = run_on(&mut store, day(2022, 7, 20), false);
        assert!(again.messages.is_empty());
    }

    #[test]
    fn test_dry_run_reports_without_recording() {
        let mut store = store_with_seen(&["101", "103", "104", "105"]);
        let output = run_on(&mut store, day(2022, 7, 20), true);

        assert_eq!(output.messages, vec![NEW_ACME_POLL]);
        assert_eq!(store.write_count, 0);
        assert_eq!(store.get(SEEN_KEY), Some(&json!(["101", "103", "104", "105"])));
    }

    #[test]
    fn test_no_unseen_polls_is_silent() {
        let mut store = store_with_seen(&["101", "102", "103", "104", "105"]);
        let output = run_on(&mut store, day(2022, 7, 20), false);

        assert!(output.messages.is_empty());
        assert_eq!(store.write_count, 0);
    }

    #[test]
    fn test_polls_outside_lookback_are_not_listed() {
        let mut store = store_with_seen(&["101", "103", "104", "105"]);
        let output = run_on(&mut store, day(2022, 9, 10), false);

        assert!(output.messages.is_empty());
        assert_eq!(store.write_count, 1);
    }

    #[test]
    fn test_history_is_capped_and_grouped() {
        let mut store = store_with_seen(&["105"]);
        let config = NewPollsConfig {
            trimmed: false,
            max_polls: 1,
            ..Default::default()
        };
        let output = {
            let mut ledger = ledger(&mut store, false);
            run(POLLS.as_bytes(), &config, &mut ledger, day(2022, 7, 20)).unwrap()
        };

        // Acme LV, Acme RV and Beta RV; 101 and 102 share one message.
        assert_eq!(output.messages.len(), 3);
        assert!(output.messages[0].ends_with("\n7/1-7/3 (1100 LV): D:47.0 R:39.0 => D+8.0"));
        assert!(output.messages[1].contains("(1500 RV): D:44.0 R:41.0 => D+3.0"));
        assert!(output.messages[2].starts_with(
            "Pollster: Beta Polling | Grade: Unrated | Method: Live Phone\nSponsor(s): Daily News\n"
        ));
    }

    #[test]
    fn test_trimmed_table() {
        let config = NewPollsConfig::default();
        let batch = load_batch(
            POLLS.as_bytes(),
            &sources::gcb_polls(&config.election_date),
            &DateRules::for_years(&config.years),
        )
        .unwrap();
        let table = trimmed_table(&batch, 2022).unwrap();

        assert_eq!(
            table.columns,
            vec![
                "pollsterName",
                "sponsor",
                "fteGrade",
                "methodology",
                "startDate",
                "endDate",
                "population",
                "partisan",
                "dem",
                "rep"
            ]
        );
        assert_eq!(table.len(), 6);
        assert_eq!(table.cell(0, "pollsterName"), Some(&Cell::text("Acme Research")));
        assert_eq!(table.cell(0, "startDate"), Some(&Cell::text("06/01/2022")));
        assert_eq!(table.cell(0, "population"), Some(&Cell::text("LV")));
        assert_eq!(table.cell(0, "dem"), Some(&Cell::Number(45.0)));
        assert_eq!(table.cell(5, "population"), Some(&Cell::text("NOT SPECIFIED")));
        assert_eq!(table.cell(5, "partisan"), Some(&Cell::text("REP")));

        assert!(trimmed_table(&batch, 2021).unwrap().is_empty());
    }
}
