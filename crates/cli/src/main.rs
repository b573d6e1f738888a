//! ultrascan command-line runner.
//!
//! Loads an acquisition profile (TOML file plus `ULTRASCAN_*` environment
//! overrides), builds the device stack it describes, and runs one of the
//! rig's jobs: a full raster scan, a repeated scan, a single bench pulse,
//! or a plain reposition of the gantry.
//!
//! The oscilloscope backend here is the simulated scope; a vendor-SDK
//! scope plugs in behind the same `ScopeLink` seam without touching any
//! of this.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::capabilities::{Motion, PulseSource};
use common::config::{PulserConfig, ScanConfig};
use common::plan::Axis;
use engine::{Orchestrator, ScanDevices, ScanEvent, ScanManifest, ScanStore};
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use hardware::sim::SimScope;
use hardware::{BridgedPulser, CaptureUnit, Gantry, Mux};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ultrascan", about = "Ultrasonic scanning acquisition runner")]
struct Cli {
    /// Acquisition profile to load.
    #[arg(long, default_value = "ultrascan.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the configured raster scan.
    Scan,
    /// Re-run the configured scan on the configured interval.
    Repeat,
    /// Acquire one averaged waveform at the current position.
    Pulse,
    /// Move one gantry axis by a relative distance and exit.
    Move {
        #[arg(long, value_enum)]
        axis: CliAxis,
        /// Distance in millimeters; negative moves toward the origin.
        #[arg(long, allow_hyphen_values = true)]
        distance: f64,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliAxis {
    X,
    Y,
    Z,
}

impl From<CliAxis> for Axis {
    fn from(axis: CliAxis) -> Self {
        match axis {
            CliAxis::X => Axis::X,
            CliAxis::Y => Axis::Y,
            CliAxis::Z => Axis::Z,
        }
    }
}

fn load_config(path: &PathBuf) -> Result<ScanConfig> {
    let config: ScanConfig = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("ULTRASCAN_").split("__"))
        .extract()
        .with_context(|| format!("failed to load profile {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

async fn build_pulser(config: &ScanConfig) -> Result<Arc<dyn PulseSource>> {
    match &config.pulser {
        PulserConfig::Compact {
            port,
            baud_rate,
            rate_hz,
            transducer_khz,
        } => {
            let pulser =
                hardware::CompactPulser::open(port, *baud_rate, *rate_hz, *transducer_khz).await?;
            Ok(Arc::new(pulser))
        }
        PulserConfig::ToneBurst {
            worker,
            rate_hz,
            burst_khz,
            negative_polarity,
            half_cycles,
        } => {
            let session = bridge::BridgeSession::start(bridge::BridgeConfig::new(worker.clone()))
                .await
                .context("bridge worker failed to start")?;
            let pulser = BridgedPulser::new(
                session,
                *rate_hz,
                *burst_khz,
                *negative_polarity,
                *half_cycles,
            )
            .await?;
            Ok(Arc::new(pulser))
        }
    }
}

async fn build_devices(config: &ScanConfig) -> Result<ScanDevices> {
    let gantry = Gantry::open(&config.gantry)
        .await
        .context("failed to open gantry")?;

    let pulser = build_pulser(config).await?;

    let scope = Arc::new(SimScope::new());
    let capture = Arc::new(CaptureUnit::new(scope, pulser.clone()));
    let settings = capture.configure(&config.capture).await?;
    info!(
        sample_interval_ns = settings.timebase.sample_interval_ns,
        samples = settings.samples,
        range_v = settings.vertical.full_scale_v,
        "effective capture settings"
    );

    let mux: Option<Arc<dyn common::capabilities::ChannelSelect>> = match &config.mux {
        Some(mux_config) => Some(Arc::new(Mux::open(mux_config).await?)),
        None => None,
    };

    Ok(ScanDevices {
        motion: Arc::new(gantry),
        capture,
        pulser,
        mux,
    })
}

/// Print progress events until the run finishes.
async fn report_progress(mut events: tokio::sync::broadcast::Receiver<ScanEvent>) {
    while let Ok(event) = events.recv().await {
        match event {
            ScanEvent::StateChanged(state) => tracing::debug!(%state, "state"),
            ScanEvent::PointStarted {
                sequence, row, col, ..
            } => {
                tracing::debug!(sequence, row, col, "point started");
            }
            ScanEvent::CaptureProgress {
                sequence,
                accumulated,
                target,
            } => {
                if accumulated == target {
                    tracing::debug!(sequence, target, "averaging complete");
                }
            }
            ScanEvent::PointPersisted { sequence } => info!(sequence, "point persisted"),
            ScanEvent::PointFailed { sequence, error } => {
                warn!(sequence, error, "point failed");
            }
            ScanEvent::Finished {
                outcome,
                persisted,
                failed,
            } => {
                info!(?outcome, persisted, failed, "run finished");
                break;
            }
        }
    }
}

/// Manifest carrying the effective (quantized) capture shape.
fn build_manifest(config: &ScanConfig, plan: &common::ScanPlan) -> Result<ScanManifest> {
    let timebase = common::timebase::Timebase::from_duration_samples(
        config.capture.samples,
        config.capture.duration_us,
    )?;
    let vertical = common::timebase::VerticalRange::covering(config.capture.vertical_range_v)?;
    Ok(ScanManifest::new(
        plan,
        config.capture.samples,
        timebase.sample_interval_ns,
        vertical.full_scale_mv(),
    ))
}

async fn run_scan(config: ScanConfig, repeat: bool) -> Result<()> {
    let plan = config.plan();
    let devices = build_devices(&config).await?;
    let orchestrator = Arc::new(Orchestrator::new(devices, plan.clone())?);

    // Ctrl-C requests a cooperative abort; the orchestrator homes and
    // quiesces the devices before exiting.
    let cancel = orchestrator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, aborting scan");
            cancel.cancel();
        }
    });

    tokio::spawn(report_progress(orchestrator.subscribe()));

    let manifest = build_manifest(&config, &plan)?;

    if repeat {
        let repeat_config = config
            .repeat
            .clone()
            .context("repeat requested but [repeat] is not configured")?;
        let summaries = orchestrator
            .run_repeated(
                &config.output,
                &manifest,
                repeat_config.count,
                Duration::from_secs_f64(repeat_config.interval_s),
            )
            .await?;
        info!(scans = summaries.len(), "repeated run finished");
    } else {
        let mut store = ScanStore::create(&config.output, &manifest)?;
        let summary = orchestrator.run(&mut store).await?;
        info!(
            persisted = summary.persisted,
            failed = summary.failed,
            path = %config.output.display(),
            "scan stored"
        );
    }
    Ok(())
}

async fn run_pulse(config: ScanConfig) -> Result<()> {
    let plan = config.plan();
    let devices = build_devices(&config).await?;
    let orchestrator = Arc::new(Orchestrator::new(devices, plan.clone())?);
    tokio::spawn(report_progress(orchestrator.subscribe()));

    let manifest = build_manifest(&config, &plan)?;
    let mut store = ScanStore::create(&config.output, &manifest)?;
    let summary = orchestrator.run_single(&mut store).await?;
    info!(
        persisted = summary.persisted,
        path = %config.output.display(),
        "pulse stored"
    );
    Ok(())
}

async fn run_move(config: ScanConfig, axis: Axis, distance: f64) -> Result<()> {
    let gantry = Gantry::open(&config.gantry)
        .await
        .context("failed to open gantry")?;
    gantry.move_rel(axis, distance).await?;
    info!(%axis, distance, "moved");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Scan => run_scan(config, false).await,
        Command::Repeat => run_scan(config, true).await,
        Command::Pulse => run_pulse(config).await,
        Command::Move { axis, distance } => run_move(config, axis.into(), distance).await,
    }
}
