//! Pollwatch - poll and forecast movement tracker
//!
//! A CLI tool that fetches published polling averages, polls and election
//! forecasts, writes movement and comparison tables, and prints a message
//! for every tracked value that changed since it was last reported.
//!
//! Exit codes:
//!   0 - Success (every tracker ran)
//!   1 - Fatal error (configuration or notification state unusable)
//!   3 - Partial failure (at least one tracker failed, the rest still ran)

mod analysis;
mod cli;
mod config;
mod error;
mod fetch;
mod ingest;
mod models;
mod normalize;
mod report;
mod sources;
mod state;
mod trackers;

use anyhow::{Context, Result};
use chrono::Local;
use cli::Args;
use config::{Config, DEFAULT_CONFIG_FILE};
use fetch::{FetchOptions, Fetcher};
use state::JsonFileStore;
use std::time::{Duration, Instant};
use trackers::{RunOptions, RunSummary};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Exit code when some trackers failed.
const EXIT_PARTIAL: i32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("Pollwatch v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .pollwatch.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to choose trackers, seats, thresholds and events.");
    Ok(())
}

/// Initialize logging based on verbosity settings.
fn init_logging(args: &Args) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run every selected tracker. Returns the exit code (0 or 3).
async fn run(args: Args) -> Result<i32> {
    let start_time = Instant::now();

    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config.validate().context("Invalid configuration")?;

    let mut store = if args.init_state {
        let store = JsonFileStore::initialize(&config.state.path)?;
        println!("🗂️  State file ready: {}", store.path().display());
        store
    } else {
        JsonFileStore::open(&config.state.path)
    };

    let mut fetcher = Fetcher::new(FetchOptions {
        timeout_seconds: config.fetch.timeout_seconds,
        pause: Duration::from_millis(config.fetch.pause_ms),
        show_progress: !args.quiet,
    })?;

    if args.dry_run {
        println!("🔍 Dry run: changes are reported but not recorded.");
    }

    let options = RunOptions {
        dry_run: args.dry_run,
        today: Local::now().date_naive(),
        selected: args.only.clone(),
    };
    let summary = trackers::run_all(&config, &mut fetcher, &mut store, &options).await?;

    print_summary(&summary, fetcher.fetched(), start_time.elapsed().as_secs_f64());

    if summary.failures.is_empty() {
        Ok(0)
    } else {
        Ok(EXIT_PARTIAL)
    }
}

fn print_summary(summary: &RunSummary, fetched: usize, duration: f64) {
    if summary.messages.is_empty() {
        println!("\n📭 Nothing new to report.");
    } else {
        println!("\n📬 {} update(s):\n", summary.messages.len());
        println!("{}", report::join_messages(&summary.messages));
    }

    println!("\n📊 Run Summary:");
    println!("   Trackers run: {}", summary.trackers_run);
    println!("   Files fetched: {}", fetched);
    println!("   Tables written: {}", summary.tables.len());
    for path in &summary.tables {
        println!("     📄 {}", path.display());
    }
    println!("   Duration: {:.1}s", duration);

    if summary.failures.is_empty() {
        println!("\n✅ Run complete.");
    } else {
        eprintln!("\n⛔ {} tracker failure(s):", summary.failures.len());
        for failure in &summary.failures {
            eprintln!("   - {}: {}", failure.tracker, failure.error);
        }
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {:#}", e);
            Err(e)
        }
    }
}
