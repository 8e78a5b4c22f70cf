//! Tracker orchestration.
//!
//! Each tracker fetches one source, runs it through the pipeline and hands
//! back messages and tables. Trackers run one after another; a failing
//! tracker is recorded and the run moves on to the next one.

pub mod average;
pub mod expressions;
pub mod forecasts;
pub mod new_polls;
pub mod polls;

use crate::config::Config;
use crate::fetch::Fetcher;
use crate::ingest::parse_csv;
use crate::models::RecordBatch;
use crate::normalize::{normalize, DateRules, FieldMap};
use crate::report::{write_table, Table};
use crate::sources::Chamber;
use crate::state::{
    ChangeRule, Evaluation, FirstObservation, KeyState, NotificationState, StateError, StateStore,
};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// One scheduled unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracker {
    GcbAverage,
    NationalForecast(Chamber),
    SeatForecasts(Chamber),
    PollMovement,
    PopulationDiff,
    NewPolls,
    ExpressionComparison(Chamber),
}

impl Tracker {
    /// Config section and `--only` name.
    pub fn section(&self) -> &'static str {
        match self {
            Tracker::GcbAverage => "gcb_average",
            Tracker::NationalForecast(_) => "forecasts_national",
            Tracker::SeatForecasts(_) => "forecasts_seats",
            Tracker::PollMovement => "poll_movement",
            Tracker::PopulationDiff => "population_diff",
            Tracker::NewPolls => "new_polls",
            Tracker::ExpressionComparison(_) => "expression_comparison",
        }
    }
}

impl fmt::Display for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tracker::NationalForecast(c)
            | Tracker::SeatForecasts(c)
            | Tracker::ExpressionComparison(c) => write!(f, "{}:{}", self.section(), c),
            _ => write!(f, "{}", self.section()),
        }
    }
}

/// Trackers enabled by `config` and accepted by `selected`, in run order.
pub fn plan(config: &Config, selected: impl Fn(&str) -> bool) -> Vec<Tracker> {
    let mut trackers = Vec::new();

    let gcb = &config.gcb_average;
    if gcb.notify || gcb.rolling {
        trackers.push(Tracker::GcbAverage);
    }
    trackers.extend(
        config
            .forecasts_national
            .chambers()
            .into_iter()
            .map(Tracker::NationalForecast),
    );
    trackers.extend(
        Chamber::ALL
            .into_iter()
            .filter(|c| !config.forecasts_seats.seats(*c).is_empty())
            .map(Tracker::SeatForecasts),
    );
    if config.poll_movement.enabled && !config.poll_movement.events.is_empty() {
        trackers.push(Tracker::PollMovement);
    }
    if config.population_diff.enabled {
        trackers.push(Tracker::PopulationDiff);
    }
    if config.new_polls.notify || config.new_polls.trimmed {
        trackers.push(Tracker::NewPolls);
    }
    if config.expression_comparison.enabled {
        trackers.extend(
            config
                .expression_comparison
                .chambers
                .iter()
                .copied()
                .map(Tracker::ExpressionComparison),
        );
    }

    trackers.retain(|t| selected(t.section()));
    trackers
}

/// Change detection for one run, with the run's policy applied.
pub struct Ledger<'s, S: StateStore + ?Sized> {
    state: NotificationState<'s, S>,
    first_observation: FirstObservation,
    dry_run: bool,
}

impl<'s, S: StateStore + ?Sized> Ledger<'s, S> {
    pub fn new(state: NotificationState<'s, S>, first_observation: FirstObservation, dry_run: bool) -> Self {
        Self {
            state,
            first_observation,
            dry_run,
        }
    }

    pub fn evaluate<T: Serialize>(&self, key: &str, value: &T, rule: &ChangeRule) -> Result<Evaluation> {
        self.evaluate_with(key, value, rule, self.first_observation)
    }

    /// Evaluate a key whose first value is a baseline to compare later runs
    /// against. It is always recorded, whatever the first-observation policy.
    pub fn evaluate_baseline<T: Serialize>(&self, key: &str, value: &T, rule: &ChangeRule) -> Result<Evaluation> {
        self.evaluate_with(key, value, rule, FirstObservation::Report)
    }

    fn evaluate_with<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        rule: &ChangeRule,
        first_observation: FirstObservation,
    ) -> Result<Evaluation> {
        let value = serde_json::to_value(value)
            .with_context(|| format!("Failed to encode value for state key '{}'", key))?;
        Ok(self.state.evaluate(key, value, rule, first_observation))
    }

    /// Persist a reported value. Nothing is written in a dry run.
    pub fn accept(&mut self, evaluation: &Evaluation) -> Result<KeyState, StateError> {
        if self.dry_run {
            debug!("Dry run: not recording '{}'", evaluation.key);
            return Ok(evaluation.state);
        }
        self.state.commit(evaluation)
    }
}

/// What one tracker produced.
#[derive(Debug, Default)]
pub struct TrackerOutput {
    pub messages: Vec<String>,
    pub tables: Vec<Table>,
    /// Per-key failures that did not stop the rest of the tracker.
    pub failures: Vec<String>,
}

impl TrackerOutput {
    fn with_message(message: String) -> Self {
        Self {
            messages: vec![message],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackerFailure {
    pub tracker: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub trackers_run: usize,
    pub messages: Vec<String>,
    pub tables: Vec<PathBuf>,
    pub failures: Vec<TrackerFailure>,
}

impl RunSummary {
    fn fail(&mut self, tracker: Tracker, error: String) {
        self.failures.push(TrackerFailure {
            tracker: tracker.to_string(),
            error,
        });
    }
}

pub struct RunOptions {
    pub dry_run: bool,
    pub today: NaiveDate,
    pub selected: Option<Vec<String>>,
}

impl RunOptions {
    fn selects(&self, name: &str) -> bool {
        self.selected
            .as_ref()
            .map_or(true, |names| names.iter().any(|n| n == name))
    }
}

/// Run every planned tracker against `store`.
///
/// Only an unreadable store is fatal. Tracker and table failures are
/// collected in the summary.
pub async fn run_all<S: StateStore + ?Sized>(
    config: &Config,
    fetcher: &mut Fetcher,
    store: &mut S,
    options: &RunOptions,
) -> Result<RunSummary> {
    let state = NotificationState::load(store).context("Failed to load notification state")?;
    let mut ledger = Ledger::new(state, config.state.first_observation, options.dry_run);
    let mut summary = RunSummary::default();

    for tracker in plan(config, |name| options.selects(name)) {
        info!("Running tracker {}", tracker);
        summary.trackers_run += 1;

        let output = match run_tracker(tracker, config, fetcher, &mut ledger, options.today).await {
            Ok(output) => output,
            Err(e) => {
                error!("Tracker {} failed: {:#}", tracker, e);
                summary.fail(tracker, format!("{:#}", e));
                continue;
            }
        };

        for failure in output.failures {
            warn!("Tracker {}: {}", tracker, failure);
            summary.fail(tracker, failure);
        }
        for table in &output.tables {
            match write_table(table, &config.general.output_dir, config.general.format) {
                Ok(path) => {
                    debug!("Wrote {} rows to {}", table.len(), path.display());
                    summary.tables.push(path);
                }
                Err(e) => {
                    error!("Tracker {}: {:#}", tracker, e);
                    summary.fail(tracker, format!("{:#}", e));
                }
            }
        }
        summary.messages.extend(output.messages);
    }

    Ok(summary)
}

async fn run_tracker<S: StateStore + ?Sized>(
    tracker: Tracker,
    config: &Config,
    fetcher: &mut Fetcher,
    ledger: &mut Ledger<'_, S>,
    today: NaiveDate,
) -> Result<TrackerOutput> {
    let polls_url = &config.fetch.polls_base_url;
    let forecast_url = &config.fetch.forecast_base_url;

    match tracker {
        Tracker::GcbAverage => {
            let payload = fetcher.fetch(polls_url, crate::sources::GCB_AVERAGES_FILE).await?;
            average::run(&payload, &config.gcb_average, ledger, today)
        }
        Tracker::NationalForecast(chamber) => {
            let file = chamber
                .national_file()
                .with_context(|| format!("No national forecast is published for {}", chamber))?;
            let payload = fetcher.fetch(forecast_url, file).await?;
            forecasts::run_national(&payload, chamber, &config.forecasts_national, ledger)
        }
        Tracker::SeatForecasts(chamber) => {
            let payload = fetcher.fetch(forecast_url, chamber.district_file()).await?;
            forecasts::run_seats(&payload, chamber, &config.forecasts_seats, ledger)
        }
        Tracker::PollMovement => {
            let payload = fetcher.fetch(polls_url, crate::sources::GCB_POLLS_FILE).await?;
            polls::run_movement(&payload, &config.poll_movement, ledger)
        }
        Tracker::PopulationDiff => {
            let payload = fetcher.fetch(polls_url, crate::sources::GCB_POLLS_FILE).await?;
            polls::run_population_diff(&payload, &config.population_diff)
        }
        Tracker::NewPolls => {
            let payload = fetcher.fetch(polls_url, crate::sources::GCB_POLLS_FILE).await?;
            new_polls::run(&payload, &config.new_polls, ledger, today)
        }
        Tracker::ExpressionComparison(chamber) => {
            let payload = fetcher.fetch(forecast_url, chamber.district_file()).await?;
            expressions::run(&payload, chamber, &config.expression_comparison)
        }
    }
}

/// Parse and normalize one fetched CSV payload.
pub fn load_batch(payload: &[u8], field_map: &FieldMap, date_rules: &DateRules) -> Result<RecordBatch> {
    let raw = parse_csv(payload).context("Failed to parse CSV payload")?;
    let batch = normalize(&raw, field_map, date_rules).context("Failed to normalize records")?;
    debug!("Loaded {} records", batch.len());
    Ok(batch)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fetch::FetchOptions;
    use crate::state::{JsonFileStore, MemoryStore};
    use serde_json::json;
    use std::time::Duration;

    pub(crate) const AVERAGES: &str = include_str!("../../fixtures/generic_ballot_averages.csv");
    pub(crate) const POLLS: &str = include_str!("../../fixtures/generic_ballot_polls.csv");
    pub(crate) const SENATE_NATIONAL: &str =
        include_str!("../../fixtures/senate_national_toplines_2022.csv");
    pub(crate) const SENATE_STATES: &str = include_str!("../../fixtures/senate_state_toplines_2022.csv");

    pub(crate) fn ledger(store: &mut MemoryStore, dry_run: bool) -> Ledger<'_, MemoryStore> {
        let state = NotificationState::load(store).unwrap();
        Ledger::new(state, FirstObservation::Report, dry_run)
    }

    pub(crate) fn day(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn fixture_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (file, content) in [
            ("generic_ballot_averages.csv", AVERAGES),
            ("generic_ballot_polls.csv", POLLS),
            ("senate_national_toplines_2022.csv", SENATE_NATIONAL),
            ("senate_state_toplines_2022.csv", SENATE_STATES),
        ] {
            std::fs::write(dir.path().join(file), content).unwrap();
        }
        dir
    }

    fn fixture_config(data: &tempfile::TempDir, out: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        let base = data.path().display().to_string();
        config.fetch.polls_base_url = base.clone();
        config.fetch.forecast_base_url = base;
        config.general.output_dir = out.path().to_path_buf();
        config.forecasts_seats.senate = vec!["AZ".into(), "PA".into()];
        config
    }

    fn fetcher() -> Fetcher {
        Fetcher::new(FetchOptions {
            pause: Duration::ZERO,
            show_progress: false,
            ..Default::default()
        })
        .unwrap()
    }

    fn options(dry_run: bool, selected: Option<Vec<String>>) -> RunOptions {
        RunOptions {
            dry_run,
            today: day(2022, 9, 10),
            selected,
        }
    }

    #[test]
    fn test_plan_follows_config_and_selection() {
        let mut config = Config::default();
        config.expression_comparison.enabled = true;
        config.expression_comparison.chambers = vec![Chamber::Senate];

        let all = plan(&config, |_| true);
        assert_eq!(all[0], Tracker::GcbAverage);
        assert!(all.contains(&Tracker::NationalForecast(Chamber::House)));
        assert!(all.contains(&Tracker::SeatForecasts(Chamber::Senate)));
        assert!(!all.contains(&Tracker::SeatForecasts(Chamber::Governor)));
        assert!(all.contains(&Tracker::ExpressionComparison(Chamber::Senate)));
        assert!(all.contains(&Tracker::NewPolls));

        let only = plan(&config, |name| name == "forecasts_national");
        assert_eq!(
            only,
            vec![
                Tracker::NationalForecast(Chamber::Senate),
                Tracker::NationalForecast(Chamber::House)
            ]
        );
    }

    #[test]
    fn test_tracker_display() {
        assert_eq!(Tracker::GcbAverage.to_string(), "gcb_average");
        assert_eq!(Tracker::NewPolls.to_string(), "new_polls");
        assert_eq!(
            Tracker::SeatForecasts(Chamber::Senate).to_string(),
            "forecasts_seats:senate"
        );
    }

    #[test]
    fn test_dry_run_ledger_does_not_write() {
        let mut store = MemoryStore::new();
        {
            let mut ledger = ledger(&mut store, true);
            let eval = ledger.evaluate("senate", &json!({"probD": 55}), &ChangeRule::Equality).unwrap();
            assert!(eval.should_report());
            assert_eq!(ledger.accept(&eval).unwrap(), KeyState::Unknown);
        }
        assert_eq!(store.write_count, 0);
    }

    #[test]
    fn test_run_all_against_local_fixtures() {
        let data = fixture_dir();
        let out = tempfile::tempdir().unwrap();
        let config = fixture_config(&data, &out);
        let mut fetcher = fetcher();
        let mut store = MemoryStore::new();

        let summary =
            tokio_test::block_on(run_all(&config, &mut fetcher, &mut store, &options(false, None))).unwrap();

        // No house file is staged, so only that tracker fails.
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].tracker, "forecasts_national:house");
        assert!(summary.messages.iter().any(|m| m.starts_with("GCB\n")));
        assert!(summary.messages.iter().any(|m| m.starts_with("SENATE (deluxe)")));
        assert!(summary.messages.iter().any(|m| m.starts_with("SENATE DETAILS")));
        assert!(out.path().join("GCB Average Movement.csv").exists());
        assert!(out.path().join("1-Dobbs.csv").exists());
        assert!(out.path().join("generic_ballot_polls.trimmed.csv").exists());
        assert!(store.get(new_polls::SEEN_KEY).is_some());
        assert!(store.get("gcb_average").is_some());
        assert!(store.get("senate_AZ").is_some());
    }

    #[test]
    fn test_second_run_reports_nothing_new() {
        let data = fixture_dir();
        let out = tempfile::tempdir().unwrap();
        let config = fixture_config(&data, &out);
        let selected = Some(vec!["gcb_average".to_string(), "forecasts_seats".to_string()]);
        let state_path = out.path().join("state").join("latest.json");
        let mut store = JsonFileStore::initialize(&state_path).unwrap();

        let first = tokio_test::block_on(run_all(
            &config,
            &mut fetcher(),
            &mut store,
            &options(false, selected.clone()),
        ))
        .unwrap();
        assert_eq!(first.messages.len(), 2);

        let second = tokio_test::block_on(run_all(
            &config,
            &mut fetcher(),
            &mut store,
            &options(false, selected),
        ))
        .unwrap();
        assert!(second.messages.is_empty());
        assert!(second.failures.is_empty());
    }

    #[test]
    fn test_unreadable_store_is_fatal() {
        let data = fixture_dir();
        let out = tempfile::tempdir().unwrap();
        let config = fixture_config(&data, &out);
        let mut store = MemoryStore::new();
        store.fail_on_read = true;

        let result = tokio_test::block_on(run_all(&config, &mut fetcher(), &mut store, &options(false, None)));
        assert!(result.is_err());
    }
}
