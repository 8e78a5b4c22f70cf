//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::state::FirstObservation;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Names accepted by `--only`.
pub const TRACKER_NAMES: [&str; 7] = [
    "gcb_average",
    "forecasts_national",
    "forecasts_seats",
    "poll_movement",
    "population_diff",
    "new_polls",
    "expression_comparison",
];

/// Pollwatch - poll and forecast movement tracker
///
/// Fetches published polling averages, polls and election forecasts,
/// computes movement tables and reports values that changed since the
/// last run.
///
/// Examples:
///   pollwatch --init-config
///   pollwatch --init-state
///   pollwatch --only forecasts_national,forecasts_seats
///   pollwatch --dry-run --format json --output-dir tables
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to configuration file
    ///
    /// If not specified, looks for .pollwatch.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory tables are written to
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Table format (csv, json)
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<OutputFormat>,

    /// Path of the persisted state file
    #[arg(long, value_name = "FILE", env = "POLLWATCH_STATE")]
    pub state: Option<PathBuf>,

    /// Create an empty state file if none exists, then continue
    #[arg(long)]
    pub init_state: bool,

    /// What to do with keys that have never been reported
    #[arg(long, value_name = "POLICY")]
    pub first_observation: Option<FirstObservationArg>,

    /// Base location of the polls data (URL or local directory)
    #[arg(long, value_name = "URL", env = "POLLWATCH_POLLS_URL")]
    pub polls_url: Option<String>,

    /// Base location of the forecast data (URL or local directory)
    #[arg(long, value_name = "URL", env = "POLLWATCH_FORECAST_URL")]
    pub forecast_url: Option<String>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Run only these trackers (comma-separated)
    ///
    /// Values: gcb_average, forecasts_national, forecasts_seats,
    /// poll_movement, population_diff, new_polls, expression_comparison
    #[arg(long, value_name = "TRACKERS", value_delimiter = ',')]
    pub only: Option<Vec<String>>,

    /// Evaluate and print changes without persisting state
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Generate a default .pollwatch.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for tables.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// CSV with a header row (default)
    #[default]
    Csv,
    /// JSON array of row objects
    Json,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }
}

/// Policy for keys without a persisted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum FirstObservationArg {
    /// Report the first value seen and persist it
    Report,
    /// Stay silent until a persisted value exists
    Suppress,
}

impl From<FirstObservationArg> for FirstObservation {
    fn from(arg: FirstObservationArg) -> Self {
        match arg {
            FirstObservationArg::Report => FirstObservation::Report,
            FirstObservationArg::Suppress => FirstObservation::Suppress,
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }

        if let Some(ref only) = self.only {
            if only.is_empty() {
                return Err("--only needs at least one tracker name".to_string());
            }
            if let Some(unknown) = only.iter().find(|n| !TRACKER_NAMES.contains(&n.as_str())) {
                return Err(format!(
                    "Unknown tracker '{}'. Expected one of: {}",
                    unknown,
                    TRACKER_NAMES.join(", ")
                ));
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
