//! Command-line host for the vacation tracker.
//!
//! - `add` validates and stores a vacation
//! - `list` prints the past vacations, newest first
//! - `serve` deploys the offline worker against an origin and keeps a page
//!   connected for a while

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, Level};
use url::Url;
use vacation_app::host::{exit_code, run_session};
use vacation_app::{FileStorage, VacationStore};
use vacation_common::{init_logging, LogConfig, LogFormat, TrackerError};
use vacation_sw::{HttpNetwork, MemoryCacheStore, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "vacation-tracker")]
#[command(about = "Track vacations, online or off")]
struct Args {
    /// Origin serving the tracker's static files
    #[arg(long, default_value = "http://localhost:8080/")]
    origin: Url,

    /// Worker configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// File holding the tracker's local storage
    #[arg(long, default_value = "vacations.json")]
    storage: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: Level,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a vacation (dates as YYYY-MM-DD)
    Add { start: String, end: String },

    /// Show past vacations
    List,

    /// Deploy the worker and keep a page connected
    Serve {
        /// Seconds to keep the page open
        #[arg(long, default_value = "30")]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut log_config = LogConfig::default().with_level(args.log_level);
    if args.json_logs {
        log_config.format = LogFormat::Json;
    }
    init_logging(log_config).context("failed to initialize logging")?;

    if let Err(err) = run(args).await {
        error!(
            category = err.category(),
            retryable = err.is_retryable(),
            error = %err,
            "Command failed"
        );
        std::process::exit(exit_code(&err));
    }
    Ok(())
}

async fn run(args: Args) -> Result<(), TrackerError> {
    let store = VacationStore::new(FileStorage::new(&args.storage));

    match args.command {
        Command::Add { start, end } => {
            let record = store.store_new(&start, &end)?;
            println!("Added: {}", record.describe());
        }
        Command::List => match store.render()? {
            Some(listing) => println!("{listing}"),
            None => println!("No vacations yet"),
        },
        Command::Serve { seconds } => {
            let config = match &args.config {
                Some(path) => WorkerConfig::from_json_file(path)?,
                None => WorkerConfig::default(),
            }
            .with_scope(args.origin.clone());

            let network = HttpNetwork::new().map_err(|e| {
                TrackerError::network_with_source("cannot build HTTP client", e)
            })?;
            let network = match config.fetch_timeout() {
                Some(limit) => network.timeout(limit),
                None => network,
            };

            let report = run_session(
                config,
                Arc::new(MemoryCacheStore::new()),
                Arc::new(network),
                Duration::from_secs(seconds),
            )
            .await?;

            println!("Active version: {}", report.version);
            println!("Cache {}: {} entries", report.cache_name, report.cached.len());
            for url in &report.cached {
                println!("  {url}");
            }
            for name in &report.deleted {
                println!("Removed stale cache {name}");
            }
            println!(
                "Received {} update(s) and {} acknowledgment(s)",
                report.updates, report.acks
            );
        }
    }
    Ok(())
}
