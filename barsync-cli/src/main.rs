//! BarSync CLI: scheduled sync, historical backfill, and run inspection.
//!
//! Commands:
//! - `sync`: incremental sync of the last N days for the active universe
//! - `backfill`: historical backfill over a year count or explicit range
//! - `status`: report the latest run checkpoint and its counters
//! - `reset`: clear a permanently-failed symbol so it is retried again

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use barsync_core::breaker::CircuitBreaker;
use barsync_core::orchestrator::{FallbackOrchestrator, GuardedProvider};
use barsync_core::provider::{chart_api::ChartApiProvider, csv_api::CsvApiProvider, Provider};
use barsync_runner::checkpoint::{CheckpointStore, JsonCheckpointStore};
use barsync_runner::config::SyncConfig;
use barsync_runner::driver::SyncDriver;
use barsync_runner::storage::SqliteBarStore;
use barsync_runner::universe::{Universe, UniverseFilter};

#[derive(Parser)]
#[command(name = "barsync", about = "BarSync: resilient multi-source price bar sync")]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Incremental sync over the last N calendar days.
    Sync {
        /// Incremental window in days.
        #[arg(long)]
        days_back: Option<i64>,

        /// Cap on universe size.
        #[arg(long)]
        limit: Option<usize>,

        /// Restrict the universe to these symbols.
        #[arg(long, num_args = 1..)]
        stocks: Vec<String>,

        /// Universe TOML file (sector -> tickers). Defaults to the
        /// database's symbols table.
        #[arg(long)]
        universe: Option<PathBuf>,
    },
    /// Historical backfill over a year count or an explicit date range.
    Backfill {
        /// Years of history to fetch.
        #[arg(long)]
        years: Option<u32>,

        /// Start date (YYYY-MM-DD); overrides --years.
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        end: Option<String>,

        /// Cap on universe size.
        #[arg(long)]
        limit: Option<usize>,

        /// Restrict the universe to these symbols.
        #[arg(long, num_args = 1..)]
        stocks: Vec<String>,

        /// Universe TOML file (sector -> tickers).
        #[arg(long)]
        universe: Option<PathBuf>,
    },
    /// Report the latest run checkpoint.
    Status,
    /// Clear a symbol's checkpoint so it is retried on the next run.
    Reset {
        /// Symbol to reset.
        symbol: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Sync {
            days_back,
            limit,
            stocks,
            universe,
        } => {
            if let Some(days_back) = days_back {
                config.days_back = days_back;
            }
            config.years = None;
            apply_universe_flags(&mut config, limit, stocks);
            config.validate()?;
            let today = Utc::now().date_naive();
            let (start, end) = config.date_range(today);
            run_sync(&config, universe, start, end)
        }
        Commands::Backfill {
            years,
            start,
            end,
            limit,
            stocks,
            universe,
        } => {
            config.years = Some(years.unwrap_or(10));
            apply_universe_flags(&mut config, limit, stocks);
            let today = Utc::now().date_naive();
            let (mut range_start, mut range_end) = config.date_range(today);
            if let Some(start) = start {
                range_start = parse_date(&start)?;
            }
            if let Some(end) = end {
                range_end = parse_date(&end)?;
            }
            if range_start > range_end {
                bail!("start date {range_start} is after end date {range_end}");
            }
            run_sync(&config, universe, range_start, range_end)
        }
        Commands::Status => run_status(&config),
        Commands::Reset { symbol } => run_reset(&config, &symbol),
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(SyncConfig::default()),
    }
}

fn apply_universe_flags(config: &mut SyncConfig, limit: Option<usize>, stocks: Vec<String>) {
    if limit.is_some() {
        config.limit = limit;
    }
    if !stocks.is_empty() {
        config.stocks = stocks;
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date: {s}"))
}

/// Build the provider priority list from config names.
fn build_orchestrator(config: &SyncConfig) -> Result<FallbackOrchestrator> {
    let mut guarded = Vec::new();
    for name in &config.providers {
        let provider: Arc<dyn Provider> = match name.as_str() {
            "chart_api" => Arc::new(ChartApiProvider::new()),
            "csv_api" => Arc::new(CsvApiProvider::new()),
            other => bail!("unknown provider '{other}' in config"),
        };
        let breaker_name = provider.name();
        guarded.push(GuardedProvider::new(
            provider,
            CircuitBreaker::new(
                breaker_name,
                config.breaker.failure_threshold,
                std::time::Duration::from_secs(config.breaker.recovery_timeout_secs),
                config.breaker.half_open_max_calls,
            ),
        ));
    }
    if guarded.is_empty() {
        bail!("no providers configured");
    }
    Ok(FallbackOrchestrator::new(guarded, config.sufficiency_ratio))
}

/// Resolve the ordered universe: explicit TOML file, else the database's
/// symbols table, then the limit/stocks restriction.
fn load_universe(
    config: &SyncConfig,
    universe_file: Option<PathBuf>,
    store: &SqliteBarStore,
) -> Result<Vec<String>> {
    let symbols = match universe_file {
        Some(path) => Universe::from_file(&path)
            .with_context(|| format!("loading universe from {}", path.display()))?
            .ordered_symbols(),
        None => store.active_symbols()?,
    };
    if symbols.is_empty() {
        bail!(
            "universe is empty: seed the symbols table in {} or pass --universe",
            config.db_path.display()
        );
    }
    let filter = UniverseFilter {
        stocks: config.stocks.clone(),
        limit: config.limit,
    };
    let filtered = filter.apply(symbols);
    if filtered.is_empty() {
        bail!("universe is empty after applying --stocks/--limit");
    }
    Ok(filtered)
}

fn run_sync(
    config: &SyncConfig,
    universe_file: Option<PathBuf>,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<()> {
    let store = Arc::new(SqliteBarStore::open(&config.db_path)?);
    let checkpoints = Arc::new(JsonCheckpointStore::open(&config.state_dir)?);
    let universe = load_universe(config, universe_file, &store)?;
    let orchestrator = build_orchestrator(config)?;

    println!(
        "Syncing {} symbols from {start} to {end}",
        universe.len()
    );

    let driver = SyncDriver::new(orchestrator, store, checkpoints, config);
    let run_id = format!(
        "{}-{}",
        &config.fingerprint()[..12],
        Utc::now().format("%Y%m%d%H%M%S")
    );
    log::info!("starting run {run_id}");
    let report = driver.sync(&universe, start, end, &run_id)?;

    println!("\nRun {} finished: {:?}", report.run_id, report.status);
    println!("  succeeded:           {}", report.succeeded);
    println!("  failed:              {}", report.failed);
    println!("  permanently skipped: {}", report.skipped_permanent);
    println!("  records written:     {}", report.records_written);
    Ok(())
}

fn run_status(config: &SyncConfig) -> Result<()> {
    let checkpoints = JsonCheckpointStore::open(&config.state_dir)?;
    match checkpoints.latest_run()? {
        Some((run, symbols)) => {
            println!("Run {} ({:?})", run.run_id, run.status);
            println!("  started:     {}", run.started_at);
            if let Some(completed_at) = run.completed_at {
                println!("  completed:   {completed_at}");
            }
            println!("  progress:    {}/{}", run.resume_from, run.total_symbols);
            for (name, value) in &run.metrics {
                println!("  {name}: {value}");
            }
            if let Some(error) = &run.error_message {
                println!("  error:       {error}");
            }
            let broken: Vec<&str> = symbols
                .values()
                .filter(|sc| sc.failure_count >= config.max_retries)
                .map(|sc| sc.symbol.as_str())
                .collect();
            if !broken.is_empty() {
                println!("  permanently failed symbols: {}", broken.join(", "));
            }
        }
        None => println!("No runs recorded in {}", config.state_dir.display()),
    }
    Ok(())
}

fn run_reset(config: &SyncConfig, symbol: &str) -> Result<()> {
    let checkpoints = JsonCheckpointStore::open(&config.state_dir)?;
    checkpoints.reset_symbol(symbol)?;
    println!("Cleared checkpoint for {symbol}");
    Ok(())
}
