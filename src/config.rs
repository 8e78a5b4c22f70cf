//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.pollwatch.toml` files. Every tracker parameter (thresholds, pivot
//! dates, join modes, variant lists) lives here and is passed explicitly
//! into the pipeline.

use crate::analysis::{MovementSort, Precision};
use crate::cli::OutputFormat;
use crate::sources::{self, Chamber};
use crate::state::{ChangeRule, FirstObservation};
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = ".pollwatch.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub state: StateConfig,

    #[serde(default)]
    pub gcb_average: GcbAverageConfig,

    #[serde(default)]
    pub forecasts_national: NationalForecastConfig,

    #[serde(default)]
    pub forecasts_seats: SeatForecastConfig,

    #[serde(default)]
    pub poll_movement: PollMovementConfig,

    #[serde(default)]
    pub population_diff: PopulationDiffConfig,

    #[serde(default)]
    pub new_polls: NewPollsConfig,

    #[serde(default)]
    pub expression_comparison: ExpressionComparisonConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory tables are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Table format.
    #[serde(default)]
    pub format: OutputFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            format: OutputFormat::default(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("tracker_output")
}

/// Where and how payloads are fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Base location of the polls and averages CSVs.
    #[serde(default = "default_polls_base_url")]
    pub polls_base_url: String,

    /// Base location of the forecast toplines.
    #[serde(default = "default_forecast_base_url")]
    pub forecast_base_url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Pause between consecutive fetches, in milliseconds.
    #[serde(default = "default_pause_ms")]
    pub pause_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            polls_base_url: default_polls_base_url(),
            forecast_base_url: default_forecast_base_url(),
            timeout_seconds: default_timeout(),
            pause_ms: default_pause_ms(),
        }
    }
}

fn default_polls_base_url() -> String {
    "https://projects.fivethirtyeight.com/polls/data".to_string()
}

fn default_forecast_base_url() -> String {
    "https://projects.fivethirtyeight.com/2022-general-election-forecast-data".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_pause_ms() -> u64 {
    1000
}

/// Persisted notification state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,

    /// Policy for keys never reported before.
    #[serde(default)]
    pub first_observation: FirstObservation,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
            first_observation: FirstObservation::default(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("data/latest.json")
}

/// Generic-ballot average and its rolling margin table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcbAverageConfig {
    /// Evaluate the average and report changes.
    #[serde(default = "default_true")]
    pub notify: bool,

    /// Minimum change in the lead worth reporting.
    #[serde(default = "default_gcb_threshold")]
    pub threshold: f64,

    /// Value of the `election` column to keep.
    #[serde(default = "default_gcb_election")]
    pub election: String,

    /// Write the rolling margin table.
    #[serde(default = "default_true")]
    pub rolling: bool,

    /// Rolling windows, in rows.
    #[serde(default = "default_rolling_windows")]
    pub rolling_windows: Vec<usize>,

    /// Days of history kept in the rolling table.
    #[serde(default = "default_history_days")]
    pub history_days: i64,
}

impl Default for GcbAverageConfig {
    fn default() -> Self {
        Self {
            notify: true,
            threshold: default_gcb_threshold(),
            election: default_gcb_election(),
            rolling: true,
            rolling_windows: default_rolling_windows(),
            history_days: default_history_days(),
        }
    }
}

impl GcbAverageConfig {
    pub fn rule(&self) -> ChangeRule {
        ChangeRule::threshold(self.threshold)
    }
}

fn default_gcb_threshold() -> f64 {
    0.1
}

fn default_gcb_election() -> String {
    "2022-11-08".to_string()
}

fn default_rolling_windows() -> Vec<usize> {
    vec![7, 14, 21, 28]
}

fn default_history_days() -> i64 {
    365
}

/// National control forecasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NationalForecastConfig {
    #[serde(default = "default_true")]
    pub senate: bool,

    #[serde(default = "default_true")]
    pub house: bool,

    /// Model expression to follow.
    #[serde(default = "default_expression")]
    pub expression: String,

    /// Minimum change in the Democratic control percentage.
    #[serde(default = "default_forecast_threshold")]
    pub threshold: f64,
}

impl Default for NationalForecastConfig {
    fn default() -> Self {
        Self {
            senate: true,
            house: true,
            expression: default_expression(),
            threshold: default_forecast_threshold(),
        }
    }
}

impl NationalForecastConfig {
    pub fn chambers(&self) -> Vec<Chamber> {
        let mut chambers = Vec::new();
        if self.senate {
            chambers.push(Chamber::Senate);
        }
        if self.house {
            chambers.push(Chamber::House);
        }
        chambers
    }

    pub fn rule(&self) -> ChangeRule {
        ChangeRule::threshold_on("probD", self.threshold)
    }
}

/// Individual seat forecasts, listed per chamber by seat code prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeatForecastConfig {
    #[serde(default)]
    pub senate: Vec<String>,

    #[serde(default)]
    pub house: Vec<String>,

    #[serde(default)]
    pub governor: Vec<String>,

    #[serde(default = "default_expression")]
    pub expression: String,

    #[serde(default = "default_forecast_threshold")]
    pub threshold: f64,
}

impl Default for SeatForecastConfig {
    fn default() -> Self {
        Self {
            senate: vec!["AZ".into(), "GA".into(), "NV".into(), "PA".into()],
            house: vec![],
            governor: vec![],
            expression: default_expression(),
            threshold: default_forecast_threshold(),
        }
    }
}

impl SeatForecastConfig {
    pub fn seats(&self, chamber: Chamber) -> &[String] {
        match chamber {
            Chamber::Senate => &self.senate,
            Chamber::House => &self.house,
            Chamber::Governor => &self.governor,
        }
    }

    /// Threshold on `probD`. Seat records also carry names and the margin,
    /// but only a `probD` move is news: `probD` is a whole percent, so any
    /// threshold under one point acts as one and an unchanged `probD` is
    /// never reported.
    pub fn rule(&self) -> ChangeRule {
        ChangeRule::threshold_on("probD", self.threshold.max(MIN_SEAT_THRESHOLD))
    }
}

const MIN_SEAT_THRESHOLD: f64 = 1.0;

fn default_expression() -> String {
    "_deluxe".to_string()
}

fn default_forecast_threshold() -> f64 {
    1.0
}

/// A named pivot for the poll movement tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementEvent {
    pub label: String,
    pub pivot: NaiveDate,
    /// Polls starting before this date are ignored for this event.
    #[serde(default)]
    pub warmup: Option<NaiveDate>,
}

impl MovementEvent {
    fn new(label: &str, pivot: (i32, u32, u32), warmup: Option<(i32, u32, u32)>) -> Self {
        let date = |(y, m, d): (i32, u32, u32)| NaiveDate::from_ymd_opt(y, m, d).unwrap_or(NaiveDate::MIN);
        Self {
            label: label.to_string(),
            pivot: date(pivot),
            warmup: warmup.map(date),
        }
    }
}

/// Generic-ballot poll movement around dated events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollMovementConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Value of the `election_date` column to keep.
    #[serde(default = "default_election_date")]
    pub election_date: String,

    /// Years whose two-digit form may appear in date columns.
    #[serde(default = "default_years")]
    pub years: Vec<i32>,

    /// Fields polls are grouped on.
    #[serde(default = "default_group_key")]
    pub group_key: Vec<String>,

    /// Inner join when true; otherwise groups from either side are kept.
    #[serde(default)]
    pub keep_only_common_groups: bool,

    #[serde(default)]
    pub precision: Precision,

    /// Report a digest of each event table when it changes.
    #[serde(default)]
    pub notify: bool,

    #[serde(default = "default_movement_sort")]
    pub sort: MovementSort,

    #[serde(default = "default_events")]
    pub events: Vec<MovementEvent>,
}

impl Default for PollMovementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            election_date: default_election_date(),
            years: default_years(),
            group_key: default_group_key(),
            keep_only_common_groups: false,
            precision: Precision::default(),
            sort: default_movement_sort(),
            notify: false,
            events: default_events(),
        }
    }
}

fn default_election_date() -> String {
    "11/8/22".to_string()
}

fn default_years() -> Vec<i32> {
    vec![2021, 2022]
}

fn default_group_key() -> Vec<String> {
    ["pollsterName", "fteGrade", "sponsor", "population", "partisan"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_movement_sort() -> MovementSort {
    MovementSort::CountAfter
}

fn default_events() -> Vec<MovementEvent> {
    let warmup = Some((2022, 6, 24));
    vec![
        MovementEvent::new("1-Dobbs", (2022, 6, 24), Some((2022, 1, 1))),
        MovementEvent::new("2-MAL Raid", (2022, 8, 9), warmup),
        MovementEvent::new("3-Student Loan Forgiveness", (2022, 8, 24), warmup),
        MovementEvent::new("4-Soul of the Nation Speech", (2022, 9, 1), warmup),
        MovementEvent::new("5-Commitment to America", (2022, 9, 23), warmup),
        MovementEvent::new("6-Marijuana Reform Announcement", (2022, 10, 6), warmup),
    ]
}

/// Registered-voter vs likely-voter margins of the same polls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationDiffConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_election_date")]
    pub election_date: String,

    #[serde(default = "default_years")]
    pub years: Vec<i32>,

    /// Polls starting before this date are ignored.
    #[serde(default = "default_population_since")]
    pub since: Option<NaiveDate>,

    #[serde(default = "default_population_variants")]
    pub variants: Vec<String>,

    #[serde(default = "default_two")]
    pub precision: Precision,
}

impl Default for PopulationDiffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            election_date: default_election_date(),
            years: default_years(),
            since: default_population_since(),
            variants: default_population_variants(),
            precision: Precision::TWO,
        }
    }
}

fn default_population_since() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(2022, 1, 1)
}

fn default_population_variants() -> Vec<String> {
    vec!["RV".to_string(), "LV".to_string()]
}

/// Newly published generic-ballot polls and the trimmed poll table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPollsConfig {
    /// Report polls whose id has not been seen before.
    #[serde(default = "default_true")]
    pub notify: bool,

    /// Write the trimmed poll table.
    #[serde(default = "default_true")]
    pub trimmed: bool,

    #[serde(default = "default_election_date")]
    pub election_date: String,

    #[serde(default = "default_years")]
    pub years: Vec<i32>,

    /// Fields a poll must share with a new one to be listed with it.
    #[serde(default = "default_match_fields")]
    pub match_fields: Vec<String>,

    /// Only polls that ended within this many days are listed.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,

    /// Most polls listed per new poll, newest first.
    #[serde(default = "default_max_polls")]
    pub max_polls: usize,

    /// Polls starting in this year make up the trimmed table.
    #[serde(default = "default_trimmed_year")]
    pub trimmed_year: i32,
}

impl Default for NewPollsConfig {
    fn default() -> Self {
        Self {
            notify: true,
            trimmed: true,
            election_date: default_election_date(),
            years: default_years(),
            match_fields: default_match_fields(),
            lookback_days: default_lookback_days(),
            max_polls: default_max_polls(),
            trimmed_year: default_trimmed_year(),
        }
    }
}

fn default_match_fields() -> Vec<String> {
    ["pollster_id", "sponsor_ids", "methodology", "population", "internal", "partisan"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_lookback_days() -> i64 {
    60
}

fn default_max_polls() -> usize {
    5
}

fn default_trimmed_year() -> i32 {
    2022
}

/// Side-by-side comparison of the forecast model expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpressionComparisonConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_all_chambers")]
    pub chambers: Vec<Chamber>,

    /// Expressions to join; the first and last are differenced.
    #[serde(default = "default_expressions")]
    pub variants: Vec<String>,

    #[serde(default = "default_compared_field")]
    pub field: String,

    /// Prefix length of statewide seat codes.
    #[serde(default = "default_state_prefix")]
    pub statewide_prefix: usize,

    #[serde(default = "default_two")]
    pub precision: Precision,
}

impl Default for ExpressionComparisonConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            chambers: default_all_chambers(),
            variants: default_expressions(),
            field: default_compared_field(),
            statewide_prefix: default_state_prefix(),
            precision: Precision::TWO,
        }
    }
}

fn default_all_chambers() -> Vec<Chamber> {
    Chamber::ALL.to_vec()
}

fn default_expressions() -> Vec<String> {
    vec!["_deluxe".into(), "_classic".into(), "_lite".into()]
}

fn default_compared_field() -> String {
    "probD".to_string()
}

fn default_state_prefix() -> usize {
    2
}

fn default_two() -> Precision {
    Precision::TWO
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings and only
    /// override when given.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref dir) = args.output_dir {
            self.general.output_dir = dir.clone();
        }
        if let Some(format) = args.format {
            self.general.format = format;
        }
        if let Some(ref path) = args.state {
            self.state.path = path.clone();
        }
        if let Some(policy) = args.first_observation {
            self.state.first_observation = policy.into();
        }
        if let Some(ref url) = args.polls_url {
            self.fetch.polls_base_url = url.clone();
        }
        if let Some(ref url) = args.forecast_url {
            self.fetch.forecast_base_url = url.clone();
        }
        if let Some(timeout) = args.timeout {
            self.fetch.timeout_seconds = timeout;
        }
    }

    /// Reject settings no run could succeed with.
    pub fn validate(&self) -> Result<()> {
        for (name, threshold) in [
            ("gcb_average.threshold", self.gcb_average.threshold),
            ("forecasts_national.threshold", self.forecasts_national.threshold),
            ("forecasts_seats.threshold", self.forecasts_seats.threshold),
        ] {
            if !threshold.is_finite() || threshold < 0.0 {
                bail!("{} must be a non-negative number, got {}", name, threshold);
            }
        }

        if self.gcb_average.rolling_windows.contains(&0) {
            bail!("gcb_average.rolling_windows must all be at least 1");
        }
        if self.gcb_average.history_days <= 0 {
            bail!("gcb_average.history_days must be at least 1");
        }

        for precision in [
            self.poll_movement.precision,
            self.population_diff.precision,
            self.expression_comparison.precision,
        ] {
            if Precision::new(precision.decimals()).is_none() {
                bail!(
                    "precision must be at most {} decimals, got {}",
                    Precision::MAX_DECIMALS,
                    precision.decimals()
                );
            }
        }

        let movement = &self.poll_movement;
        if movement.group_key.is_empty() {
            bail!("poll_movement.group_key must name at least one field");
        }
        let mut labels = HashSet::new();
        for event in &movement.events {
            if !labels.insert(event.label.as_str()) {
                bail!("poll_movement.events: duplicate label '{}'", event.label);
            }
            if let Some(warmup) = event.warmup {
                if warmup > event.pivot {
                    bail!(
                        "poll_movement.events '{}': warmup {} is after the pivot {}",
                        event.label,
                        warmup,
                        event.pivot
                    );
                }
            }
        }

        if self.population_diff.variants.len() != 2 {
            bail!("population_diff.variants must name exactly two populations");
        }
        let new_polls = &self.new_polls;
        if new_polls.match_fields.is_empty() {
            bail!("new_polls.match_fields must name at least one field");
        }
        if let Err(e) = sources::poll_details(&new_polls.election_date)
            .schema()
            .key_resolver(&new_polls.match_fields)
        {
            bail!("new_polls.match_fields: {}", e);
        }
        if new_polls.lookback_days <= 0 {
            bail!("new_polls.lookback_days must be at least 1");
        }
        if new_polls.max_polls == 0 {
            bail!("new_polls.max_polls must be at least 1");
        }

        if self.expression_comparison.variants.len() < 2 {
            bail!("expression_comparison.variants must name at least two expressions");
        }
        if self.expression_comparison.statewide_prefix == 0 {
            bail!("expression_comparison.statewide_prefix must be at least 1");
        }

        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
