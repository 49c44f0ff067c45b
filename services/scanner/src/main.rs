//! Frame scanner CLI.
//!
//! ```text
//! packtrace-scanner scan --camera <name> [--priority <n>] [--reconstruct] <videos..>
//! ```
//!
//! Configuration is loaded from `config/default`, `config/{RUN_MODE}` and
//! `SCANNER__*` environment variables. See `config.rs`.

use anyhow::Context;
use clap::{Parser, Subcommand};
use packtrace_ledger::config::LoggingConfig;
use packtrace_ledger::{Datastore, ReconstructContext, Reconstructor};
use packtrace_scanner::{
    FrameScanner, GstPipelineFactory, JobOutcome, ScannerConfig, SegmentWriter, VideoJob, WorkerPool,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "packtrace-scanner", version, about = "Scan packing-station videos into segment logs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan one or more videos of a camera
    Scan {
        #[arg(long)]
        camera: String,
        /// Lower values are scanned first
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// Run a reconstruction batch once every video is scanned
        #[arg(long)]
        reconstruct: bool,
        #[arg(required = true)]
        videos: Vec<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ScannerConfig::load().context("Failed to load configuration")?;
    init_logging(&config.logging)?;
    config.validate()?;

    info!(
        service = "packtrace-scanner",
        version = env!("CARGO_PKG_VERSION"),
        cameras = config.cameras.len(),
        "Starting scanner"
    );

    match cli.command {
        Command::Scan {
            camera,
            priority,
            reconstruct,
            videos,
        } => run_scan(&config, &camera, priority, reconstruct, videos),
    }
}

fn run_scan(
    config: &ScannerConfig,
    camera: &str,
    priority: i32,
    reconstruct: bool,
    videos: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let camera = config
        .camera(camera)
        .with_context(|| format!("Camera '{}' is not configured", camera))?;
    let settings = config.scan.settings()?;

    let store = Arc::new(Datastore::open(&config.database).context("Failed to open datastore")?);
    let writer = Arc::new(SegmentWriter::spawn(config.scan.writer_queue_size)?);
    let scanner = Arc::new(FrameScanner::new(settings.clone(), store.clone(), writer.clone()));

    let running = Arc::new(AtomicBool::new(true));
    ctrlc::set_handler({
        let running = running.clone();
        move || {
            info!("Received shutdown signal");
            running.store(false, Ordering::SeqCst);
        }
    })
    .context("Failed to install signal handler")?;

    let pool = WorkerPool::spawn(
        scanner,
        std::slice::from_ref(camera),
        Arc::new(GstPipelineFactory::new(settings.sampling_fps)),
        running.clone(),
    )?;
    for video in videos {
        pool.submit(VideoJob::new(video, camera.name.clone(), priority))?;
    }
    pool.close();

    // Wait for the queue to drain; after a shutdown signal, only for the grace period.
    let mut deadline: Option<Instant> = None;
    while !pool.is_finished() {
        if deadline.is_none() && !running.load(Ordering::SeqCst) {
            info!(grace_secs = config.shutdown.grace_secs, "Waiting for in-flight scan");
            deadline = Some(Instant::now() + config.shutdown.grace());
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    let (reports, stragglers) = pool.join(deadline);
    if stragglers > 0 {
        error!(workers = stragglers, "Scan did not finish within the grace period, terminating");
        std::process::exit(1);
    }

    let mut failed = 0usize;
    for report in &reports {
        match &report.outcome {
            JobOutcome::Completed(stats) => info!(
                video = %report.job.path.display(),
                segments = stats.segments_written,
                markers = stats.markers_emitted,
                detections = stats.detections_logged,
                "Video done"
            ),
            JobOutcome::Errored(message) => {
                failed += 1;
                warn!(video = %report.job.path.display(), error = %message, "Video failed");
            }
        }
    }
    writer.shutdown()?;

    if reconstruct && running.load(Ordering::SeqCst) {
        let ctx = ReconstructContext::new(settings.min_packing_time, settings.timezone);
        let batch = Reconstructor::new(store, ctx)
            .run_batch()
            .context("Reconstruction batch failed")?;
        println!("{}", serde_json::to_string_pretty(&batch)?);
    }

    info!(videos = reports.len(), failed = failed, "Scan complete");
    Ok(())
}

/// Initialize the tracing subsystem.
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
        .add_directive(format!("packtrace_scanner={}", level).parse()?)
        .add_directive(format!("packtrace_ledger={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?);

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
