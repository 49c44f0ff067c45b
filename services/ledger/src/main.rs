//! Packing event ledger CLI.
//!
//! ```text
//! packtrace-ledger reconstruct [--discover]
//! packtrace-ledger discover [--dir <path>]
//! packtrace-ledger events --camera <name>
//! packtrace-ledger retry-queue [--camera <name>] [--record <event id>]
//! ```
//!
//! Configuration is loaded from `config/default`, `config/{RUN_MODE}` and
//! `LEDGER__*` environment variables. See `config.rs`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use packtrace_ledger::config::{LedgerConfig, LoggingConfig};
use packtrace_ledger::{Datastore, EventRepository, ReconstructContext, Reconstructor};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "packtrace-ledger", version, about = "Replay segment logs into packing events")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ingest every sealed, unprocessed segment log
    Reconstruct {
        /// Register unknown log files under the log directory first
        #[arg(long)]
        discover: bool,
    },
    /// Register segment logs the datastore does not know yet
    Discover {
        /// Directory to scan, defaults to `reconstruct.log_dir`
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Print the events of a camera as JSON lines
    Events {
        #[arg(long)]
        camera: String,
    },
    /// List events flagged for a re-scan
    RetryQueue {
        #[arg(long)]
        camera: Option<String>,
        /// Count one re-scan attempt for this event id
        #[arg(long)]
        record: Option<i64>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = LedgerConfig::load().context("Failed to load configuration")?;
    init_logging(&config.logging)?;
    config.validate()?;

    info!(
        service = "packtrace-ledger",
        version = env!("CARGO_PKG_VERSION"),
        database = %config.database.path,
        "Starting ledger"
    );

    let store = Arc::new(Datastore::open(&config.database).context("Failed to open datastore")?);
    let ctx = ReconstructContext::from_config(&config.reconstruct)?;
    let reconstructor = Reconstructor::new(store.clone(), ctx);

    match cli.command {
        Command::Reconstruct { discover } => {
            if discover {
                reconstructor
                    .discover(&config.reconstruct.log_dir)
                    .context("Log discovery failed")?;
            }
            let report = reconstructor.run_batch().context("Reconstruction batch failed")?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Discover { dir } => {
            let dir = dir.unwrap_or_else(|| config.reconstruct.log_dir.clone());
            let registered = reconstructor.discover(&dir).context("Log discovery failed")?;
            println!("{}", registered);
        }
        Command::Events { camera } => {
            let events = store.with_read(|conn| EventRepository::new(conn).list_for_camera(&camera))?;
            for event in events {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Command::RetryQueue { camera, record } => {
            if let Some(id) = record {
                store.with_write(|conn| EventRepository::new(conn).record_retry_attempt(id))?;
                info!(event_id = id, "Recorded re-scan attempt");
            }
            let events = store.with_read(|conn| {
                EventRepository::new(conn).needing_retry(camera.as_deref())
            })?;
            for event in events {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }

    Ok(())
}

/// Initialize the tracing subsystem. Logs go to stderr so command output on
/// stdout stays machine-readable.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("packtrace_ledger={}", level).parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}
