//! Command-line front end for spim_daq.
//!
//! ```bash
//! spim_daq --config config/spim.toml waveforms --json
//! spim_daq preview --cycles 100
//! RUST_LOG=spim_daq=debug spim_daq snap
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spim_daq::hardware::mock::{MockChannel, MockTrigger, TriggerBus};
use spim_daq::hardware::{ChannelSession, OutputChannel};
use spim_daq::parameter::ParameterChanges;
use spim_daq::waveform::{ChannelRole, LaserEncoding, WaveformBuffer};
use spim_daq::{AcquisitionController, ParameterStore, Settings, TriggerSequencer};

#[derive(Parser)]
#[command(name = "spim_daq", about = "Light-sheet waveform synthesis and triggering")]
struct Cli {
    /// Settings file (TOML); `SPIM_` environment variables override it.
    #[arg(short, long, default_value = "config/spim.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single triggered cycle.
    Snap,
    /// Run cycles until Ctrl-C or the cycle limit. Reads `name=value`
    /// parameter changes from stdin.
    Preview {
        #[arg(long)]
        cycles: Option<u64>,
    },
    /// Print the waveforms computed from the startup parameters.
    Waveforms {
        #[arg(long)]
        json: bool,
    },
    /// Write the current ETL values into the calibration file.
    SaveEtl,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .init();

    let store = build_store(&settings)?;
    match cli.command {
        Command::Waveforms { json } => print_waveforms(&store, json),
        Command::SaveEtl => store_calibration(store),
        Command::Snap => {
            let mut controller = build_controller(&settings, store)?;
            controller.open().await;
            let report = controller.snap().await.context("Snap failed")?;
            println!(
                "version {} fired={} completed={} timeouts={} elapsed={:?}",
                report.version,
                report.fired,
                report.completed.len(),
                report.timeouts.len(),
                report.elapsed
            );
            controller.shutdown().await.context("Shutdown failed")
        }
        Command::Preview { cycles } => {
            let mut controller = build_controller(&settings, store)?;
            controller.open().await;

            let stop = controller.stop_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Ctrl-C received, stopping preview");
                    stop.stop();
                }
            });

            let (tx, mut rx) = mpsc::channel(16);
            tokio::spawn(read_changes(tx));

            let result = controller.live(&mut rx, cycles).await;
            controller.shutdown().await.context("Shutdown failed")?;
            let summary = result.context("Live preview failed")?;
            println!(
                "{} cycles, {} aborted, {} timeouts, last version {}",
                summary.cycles, summary.aborted, summary.timeouts, summary.last_version
            );
            Ok(())
        }
    }
}

fn build_store(settings: &Settings) -> Result<ParameterStore> {
    let calibration = settings
        .load_calibration()
        .context("Failed to load ETL calibration")?;
    let store = ParameterStore::new(
        settings.initial_snapshot()?,
        settings.assembler(),
        calibration,
        settings.startup.etl_calibration_file.clone(),
    )
    .context("Failed to compute startup waveforms")?;
    Ok(store)
}

fn build_controller(settings: &Settings, store: ParameterStore) -> Result<AcquisitionController> {
    let bus = TriggerBus::new();
    let mut sessions = Vec::with_capacity(ChannelRole::ALL.len());
    for role in ChannelRole::ALL {
        let line = settings.output_line(role);
        let device: Box<dyn OutputChannel> = match role {
            ChannelRole::Laser => laser_device(settings, &line, bus.clone())?,
            _ => Box::new(MockChannel::new(&line, bus.clone()).0),
        };
        info!(channel = %role, line = %line, "Channel session created");
        sessions.push(ChannelSession::new(role, device));
    }
    let (trigger, _) = MockTrigger::new(bus);
    let trigger = trigger.with_line(settings.hardware.master_trigger_out_line.clone());
    let sequencer = TriggerSequencer::new(sessions, Box::new(trigger), settings.policy());

    Ok(AcquisitionController::new(
        store,
        sequencer,
        settings.hardware.trigger_source.clone(),
    ))
}

#[cfg(feature = "serial")]
fn laser_device(settings: &Settings, line: &str, bus: TriggerBus) -> Result<Box<dyn OutputChannel>> {
    use std::time::Duration;

    use spim_daq::hardware::octodac::OctoDac;
    use spim_daq::hardware::serial::SerialTransport;

    let hw = &settings.hardware;
    match (hw.laser_encoding, hw.laser_port.as_deref()) {
        (LaserEncoding::Waypoint, Some(port)) => {
            let transport = SerialTransport::open(
                port,
                hw.laser_baud_rate,
                Duration::from_millis(hw.laser_reply_timeout_ms),
            )
            .with_context(|| format!("Failed to open laser controller on {port}"))?;
            warn!("octoDAC listens on the hardware master line; simulated triggers do not reach it");
            Ok(Box::new(OctoDac::new(transport)))
        }
        _ => Ok(Box::new(MockChannel::new(line, bus).0)),
    }
}

#[cfg(not(feature = "serial"))]
fn laser_device(settings: &Settings, line: &str, bus: TriggerBus) -> Result<Box<dyn OutputChannel>> {
    if settings.hardware.laser_encoding == LaserEncoding::Waypoint
        && settings.hardware.laser_port.is_some()
    {
        warn!("Built without the `serial` feature, simulating the laser controller");
    }
    Ok(Box::new(MockChannel::new(line, bus).0))
}

/// Forward `name=value` lines from stdin as change events.
async fn read_changes(tx: mpsc::Sender<ParameterChanges>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let changes = parse_changes(&line);
        if changes.is_empty() {
            continue;
        }
        if tx.send(changes).await.is_err() {
            break;
        }
    }
}

fn parse_changes(line: &str) -> ParameterChanges {
    line.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .filter_map(|token| {
            let Some((name, value)) = token.split_once('=') else {
                warn!(token, "Expected name=value");
                return None;
            };
            match value.parse::<f64>() {
                Ok(value) => Some((name.to_owned(), value)),
                Err(_) => {
                    warn!(token, "Value is not a number");
                    None
                }
            }
        })
        .collect()
}

fn print_waveforms(store: &ParameterStore, json: bool) -> Result<()> {
    let bundle = store.waveforms();
    if json {
        let waypoints = match &bundle.laser {
            WaveformBuffer::Waypoints(list) => serde_json::to_value(list.as_slice())?,
            _ => serde_json::Value::Null,
        };
        let summary = serde_json::json!({
            "version": bundle.version,
            "samples": bundle.samples,
            "samplerate": bundle.samplerate,
            "laser": store.snapshot().laser(),
            "zoom": store.snapshot().zoom(),
            "camera": bundle.camera.to_string(),
            "galvo_etl": bundle.galvo_etl.to_string(),
            "laser_buffer": bundle.laser.to_string(),
            "waypoints": waypoints,
            "truncated": bundle.truncation.map(|t| serde_json::json!({
                "requested": t.requested,
                "kept": t.kept,
            })),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "version {} | {} samples @ {} Hz | {} {}",
        bundle.version,
        bundle.samples,
        bundle.samplerate,
        store.snapshot().laser(),
        store.snapshot().zoom()
    );
    for role in ChannelRole::ALL {
        println!("  {:<10} {}", role, bundle.buffer(role));
    }
    if let Some(t) = bundle.truncation {
        println!("  waypoints truncated: {} of {} kept", t.kept, t.requested);
    }
    Ok(())
}

fn store_calibration(mut store: ParameterStore) -> Result<()> {
    store
        .save_calibration()
        .context("Failed to save ETL calibration")?;
    println!(
        "Saved ETL calibration for {} at {}",
        store.snapshot().laser(),
        store.snapshot().zoom()
    );
    Ok(())
}
