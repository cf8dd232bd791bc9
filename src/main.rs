mod config;
mod fetcher;
mod fx;
mod loader;
mod metrics;
mod models;
mod pipeline;
mod provider;
mod retry;
mod storage;
mod utils;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

use crate::config::AppConfig;
use crate::fetcher::TickerFetcher;
use crate::fx::FxFetcher;
use crate::loader::{load_fx_pairs, load_symbols};
use crate::models::{BatchResult, TickerSummary};
use crate::pipeline::{BatchRunner, BatchStats};
use crate::provider::{QuoteProvider, YahooProvider};
use crate::retry::RetryPolicy;
use crate::storage::OutputWriter;

#[derive(Parser)]
#[command(name = "ticker-export", about = "Bulk market data export with retries", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Write one detailed <SYMBOL>.json per ticker
    Export(RunArgs),

    /// Write one flat summary row per ticker into a single file
    Summary(RunArgs),

    /// Write one <FROM><TO>=X.json conversion rate per currency pair
    Fx(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Symbol list (JSON array of strings or CSV), or FX pairs for `fx`
    #[arg(short, long)]
    input: PathBuf,

    #[arg(long)]
    max_workers: Option<usize>,

    #[arg(long)]
    max_rounds: Option<u32>,

    /// Output directory (default from config: output/)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl RunArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(n) = self.max_workers {
            config.batch.max_workers = n;
        }
        if let Some(n) = self.max_rounds {
            config.batch.max_rounds = n;
        }
        if let Some(dir) = &self.output {
            config.output.dir = dir.clone();
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "ticker_export=info,warn",
        1 => "ticker_export=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(tracing_fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli.command).await {
        Ok(stats) if stats.failed == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<BatchStats> {
    let mut config = AppConfig::load()?;
    let args = match &command {
        Command::Export(args) | Command::Summary(args) | Command::Fx(args) => args,
    };
    args.apply(&mut config);

    let writer = OutputWriter::open(&config.output)?;
    let provider: Arc<dyn QuoteProvider> = Arc::new(YahooProvider::new(&config.provider)?);
    let policy = RetryPolicy::from(&config.retry);
    info!("Retry policy: {}", policy);

    if matches!(command, Command::Fx(_)) {
        let pairs = load_fx_pairs(&args.input)
            .with_context(|| format!("Cannot load FX pairs from {:?}", args.input))?;
        let fetcher = Arc::new(FxFetcher::new(provider, policy, &config.provider));
        let runner = BatchRunner::new(fetcher, config.batch.clone());

        let _t = utils::Timer::start("FX export");
        let (result, stats) = runner.run(&pairs, |rate| writer.write_fx_rate(&rate)).await;
        finish(&writer, "FX export", result, &stats)?;
        return Ok(stats);
    }

    let symbols = load_symbols(&args.input)
        .with_context(|| format!("Cannot load symbols from {:?}", args.input))?;
    info!("{} symbols", utils::fmt_number(symbols.len()));
    let fetcher = Arc::new(TickerFetcher::new(
        provider,
        policy,
        &config.provider,
        config.metrics.clone(),
    ));
    let runner = BatchRunner::new(fetcher, config.batch.clone());

    let stats = if matches!(command, Command::Summary(_)) {
        let _t = utils::Timer::start("Summary export");
        let (result, stats) = runner
            .run(&symbols, |record| Ok(TickerSummary::from(&record)))
            .await;
        writer.write_summary(result.succeeded().values())?;
        finish(&writer, "Ticker summary", result, &stats)?;
        stats
    } else {
        let _t = utils::Timer::start("Detailed export");
        let (result, stats) = runner.run(&symbols, |record| writer.write_record(&record)).await;
        finish(&writer, "Ticker export", result, &stats)?;
        stats
    };

    Ok(stats)
}

fn finish<T, K>(writer: &OutputWriter, title: &str, result: BatchResult<T, K>, stats: &BatchStats) -> Result<()>
where
    K: Ord + Clone + fmt::Display,
{
    if result.is_empty() {
        info!("Nothing to export");
    } else if result.all_succeeded() {
        info!("All {} items succeeded", stats.succeeded);
    }
    let (_, failed) = result.into_parts();
    writer.write_error_log(&failed)?;

    println!("─────────────────────────────────");
    println!("  {}", title);
    println!("─────────────────────────────────");
    println!("  Items     : {}", utils::fmt_number(stats.symbols));
    println!("  Succeeded : {}", utils::fmt_number(stats.succeeded));
    println!("  Failed    : {}", utils::fmt_number(stats.failed));
    println!("  Rounds    : {}", stats.rounds);
    println!("  Output    : {}", writer.dir().display());
    println!("─────────────────────────────────");
    Ok(())
}
