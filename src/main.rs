use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use comfy_table::{Table, presets::UTF8_FULL};
use configuration::Config;
use core_types::{Candle, Clock, SeriesKey, SimClock, Timeframe, TradePair, WallClock};
use engine::{MarketState, Simulation};
use indicatif::{ProgressBar, ProgressStyle};
use ledger::InvariantPolicy;
use market_data::{CandleStore, DataChangeKind};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

/// The main entry point for the Meridian market-data tool.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine; it only carries optional overrides.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = configuration::load_config_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let _log_guard = configuration::init_tracing(&config.logging)?;

    match cli.command {
        Commands::Import(args) => handle_import(args, &config).await,
        Commands::Inspect(args) => handle_inspect(args, &config).await,
        Commands::Replay(args) => handle_replay(args, &config).await,
    }
}

// ==============================================================================
// CLI Structure
// ==============================================================================

/// Local candle stores and balance ledgers for crypto exchanges.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load candles from a JSON file into a local store.
    Import(ImportArgs),
    /// Show what a local store holds.
    Inspect(InspectArgs),
    /// Replay a stored series under a simulated clock.
    Replay(ReplayArgs),
}

/// Identifies one local series.
#[derive(Args)]
struct SeriesArgs {
    /// Exchange name, used as the data sub-directory (e.g., "binance").
    #[arg(long)]
    exchange: String,

    /// The pair (e.g., "BTC/USDT").
    #[arg(long)]
    pair: TradePair,

    /// The candle timeframe (e.g., "1m", "1h").
    #[arg(long)]
    timeframe: Timeframe,
}

#[derive(Parser)]
struct ImportArgs {
    #[command(flatten)]
    series: SeriesArgs,

    /// A JSON array of {timestamp, open, high, low, close, volume} objects.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Parser)]
struct InspectArgs {
    #[command(flatten)]
    series: SeriesArgs,

    /// How many of the newest candles to print.
    #[arg(long, default_value_t = 10)]
    last: usize,
}

#[derive(Parser)]
struct ReplayArgs {
    #[command(flatten)]
    series: SeriesArgs,

    /// The start date of the replay (format: YYYY-MM-DD).
    #[arg(long)]
    from: NaiveDate,

    /// The end date of the replay (format: YYYY-MM-DD).
    #[arg(long)]
    to: NaiveDate,

    /// Candles of history to page in before the first step.
    #[arg(long, default_value_t = 100)]
    warmup: usize,
}

#[derive(Deserialize)]
struct CandleRow {
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

// ==============================================================================
// Command Logic
// ==============================================================================

async fn open_store(series: &SeriesArgs, config: &Config, clock: Arc<dyn Clock>) -> anyhow::Result<Arc<CandleStore>> {
    let path = database::pair_database_path(&config.database.data_dir, &series.exchange, &series.pair);
    let pool = database::connect(&path).await?;
    let key = SeriesKey::new(series.pair.clone(), series.timeframe);
    let store = CandleStore::open(key, pool, clock, config.sync.max_future_ms).await?;
    Ok(store)
}

async fn handle_import(args: ImportArgs, config: &Config) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&args.file).with_context(|| format!("reading {}", args.file.display()))?;
    let rows: Vec<CandleRow> = serde_json::from_str(&raw)?;
    let candles = rows
        .into_iter()
        .map(|row| Candle::new(row.timestamp, row.open, row.high, row.low, row.close, row.volume))
        .collect::<Result<Vec<_>, _>>()?;

    let store = open_store(&args.series, config, Arc::new(WallClock)).await?;
    let before = store.count().await?;
    let changes = store.add_batch(candles).await?;
    let after = store.count().await?;

    tracing::info!(series = %store.key(), before, after, events = changes.len(), "Import finished.");
    let rebuilt = changes.iter().any(|change| change.kind == DataChangeKind::Other);
    println!(
        "Imported into {}: {before} -> {after} candles{}",
        store.key(),
        if rebuilt { " (history rewritten)" } else { "" }
    );
    Ok(())
}

async fn handle_inspect(args: InspectArgs, config: &Config) -> anyhow::Result<()> {
    let store = open_store(&args.series, config, Arc::new(WallClock)).await?;
    let count = store.count().await?;
    let (Some(oldest), Some(newest)) = (store.oldest().await?, store.newest().await?) else {
        println!("{} is empty.", store.key());
        return Ok(());
    };

    println!("{}: {count} candles from {} to {}", store.key(), format_ts(oldest.timestamp), format_ts(newest.timestamp));
    println!("Syncing: {}", store.data_syncing());

    let last = args.last.min(count);
    let candles = store.candles_by_index(count - last, last).await?;
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Time", "Open", "High", "Low", "Close", "Volume"]);
    for candle in candles {
        table.add_row(vec![
            format_ts(candle.timestamp),
            candle.open.to_string(),
            candle.high.to_string(),
            candle.low.to_string(),
            candle.close.to_string(),
            candle.volume.to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn handle_replay(args: ReplayArgs, config: &Config) -> anyhow::Result<()> {
    let start = day_start_ms(args.from)?;
    let end = day_start_ms(args.to)?;
    anyhow::ensure!(start < end, "--from must be before --to");

    let clock = Arc::new(SimClock::new(start));
    let store = open_store(&args.series, config, clock.clone()).await?;
    let state = MarketState::new(InvariantPolicy::from(&config.ledger), config.funds.clone());
    let step_ms = args.series.timeframe.duration_ms();
    let mut sim = Simulation::new(clock, step_ms, state, config.sync.chunk_size);
    let index = sim.add_store(store);
    sim.reset(start, args.warmup).await?;

    let progress_bar = ProgressBar::new(((end - start) / step_ms) as u64);
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("#>-"),
    );
    let steps = sim.run_until(end, |_| progress_bar.inc(1)).await?;
    progress_bar.finish_with_message("Replay complete!");

    let instrument = sim
        .instrument(index)
        .context("replay instrument disappeared")?;
    let visible = instrument.count().await?;
    let bullish = instrument
        .range(0, visible.saturating_sub(1))
        .await?
        .iter()
        .filter(|candle| candle.is_bullish())
        .count();
    println!("Replayed {steps} steps; {visible} candles visible, {bullish} bullish.");
    if let Some(latest) = instrument.latest().await? {
        println!("Last candle at {}: close {}", format_ts(latest.timestamp), latest.close);
    }
    Ok(())
}

fn day_start_ms(date: NaiveDate) -> anyhow::Result<i64> {
    let start = date.and_hms_opt(0, 0, 0).context("invalid date")?;
    Ok(start.and_utc().timestamp_millis())
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
