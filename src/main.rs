//! detector_sync command line.
//!
//! `simulate` runs a scan against simulated hardware and prints the scan
//! report as JSON; `config` prints the resolved settings.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use detector_sync::config::{FluxMode, Settings, SyncMode, DEFAULT_CONFIG_PATH};
use detector_sync::hardware::mock::{
    CollectingReportSink, MockFluxSource, MockMotionAxis, MockScanSequencer, SimulatedDetector,
};
use detector_sync::messages::TriggerRequest;
use detector_sync::publish::{spawn_status_mirror, TracingPublisher};
use detector_sync::{SyncDevices, SyncEngine};

/// Detector / X-ray source synchronization engine
#[derive(Parser)]
#[command(name = "detector_sync")]
#[command(author, version, about)]
struct Cli {
    /// Settings file; missing keys use built-in defaults
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan against simulated hardware
    Simulate {
        /// Number of scan points
        #[arg(short, long, default_value_t = 5)]
        points: u64,

        /// Flux source: none, source_a, source_b
        #[arg(short, long)]
        mode: Option<FluxMode>,

        /// Use the soft protocol
        #[arg(long)]
        soft: bool,
    },

    /// Print the resolved settings
    Config,
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    match cli.command {
        Commands::Config => {
            let rendered = toml::to_string_pretty(&settings).context("rendering settings")?;
            println!("{rendered}");
            Ok(())
        }
        Commands::Simulate { points, mode, soft } => {
            init_tracing(&settings);
            simulate(settings, points, mode, soft).await
        }
    }
}

async fn simulate(mut settings: Settings, points: u64, mode: Option<FluxMode>, soft: bool) -> Result<()> {
    if points == 0 {
        bail!("a scan needs at least one point");
    }
    if let Some(mode) = mode {
        settings.flux.mode = mode;
    }
    if soft {
        settings.engine.sync_mode = Some(SyncMode::Soft);
    }
    settings.report.enabled = true;

    let detector = Arc::new(SimulatedDetector::new());
    let source_a = Arc::new(MockFluxSource::new(Duration::from_millis(50)));
    let source_b = Arc::new(MockFluxSource::new(Duration::from_millis(200)));
    let scan = Arc::new(MockScanSequencer::running(points));
    let reports = Arc::new(CollectingReportSink::new());

    let devices = SyncDevices::new(detector.clone(), detector, source_a, source_b, scan.clone())
        .with_axis(Arc::new(MockMotionAxis::new("sample_x", false)))
        .with_report_sink(reports.clone());

    let engine = SyncEngine::start(settings, devices).await?;
    let mirror = spawn_status_mirror(&engine, Arc::new(TracingPublisher));

    info!(points, protocol = %engine.sync_mode(), "Starting simulated scan");
    for point in 1..=points {
        let summary = engine.trigger(TriggerRequest::default()).await?;
        info!(
            point,
            shutter_s = summary.sample.shutter_duration,
            duty = ?summary.duty_cycle,
            "Point complete"
        );
        if summary.scan_completed {
            break;
        }
    }

    engine.shutdown().await?;
    mirror.abort();

    let reports = reports.reports().await;
    match reports.last() {
        Some(report) => println!("{}", serde_json::to_string_pretty(report)?),
        None => warn!("Scan ended without a report"),
    }
    Ok(())
}
