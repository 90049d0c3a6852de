//! Pharma Twin - process digital twin runner
//!
//! Runs the seeded demonstration plant, prints every deviation proposal as one
//! JSON line on stdout, and logs model metrics on shutdown.
//!
//! # Usage
//!
//! ```bash
//! # Default plant, 1 tick per second, 60 simulated seconds per tick
//! cargo run --release
//!
//! # Fast, replayable run of 500 ticks with a persisted prediction ledger
//! cargo run --release -- --tick-ms 10 --speed 300 --seed 42 --ticks 500 --store ./data/twin.db
//! ```
//!
//! # Environment Variables
//!
//! - `PHARMA_TWIN_CONFIG`: Path to a TOML config (default: ./twin_config.toml if present)
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pharma_twin::config::TwinConfig;
use pharma_twin::detector::{AnomalyDetector, DetectorListener, ProposalBus, SharedDetector};
use pharma_twin::digest;
use pharma_twin::monitor::{MetricsOptions, ModelMonitor, SharedMonitor};
use pharma_twin::storage::{KeyValueStore, SledStore};
use pharma_twin::twin::{LoopOptions, TwinLoop, TwinSimulation};
use pharma_twin::types::{ProposalEvent, TwinSnapshot};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "pharma-twin")]
#[command(about = "Process digital twin: batch telemetry, CPP deviation proposals, model calibration")]
#[command(version)]
struct CliArgs {
    /// Config file (overrides PHARMA_TWIN_CONFIG and ./twin_config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Real-time milliseconds between ticks
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Simulated seconds per tick
    #[arg(long)]
    speed: Option<f64>,

    /// Simulated seconds between prediction samples
    #[arg(long)]
    monitor_every: Option<f64>,

    /// Seed for replayable runs
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many ticks (default: run until Ctrl+C)
    #[arg(long)]
    ticks: Option<u64>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Sled database for persisting the prediction ledger across runs
    #[arg(long, value_name = "PATH")]
    store: Option<PathBuf>,

    /// Log a text digest every N ticks (0 = never)
    #[arg(long, default_value = "0")]
    digest_every: u64,
}

impl CliArgs {
    fn apply(&self, config: &mut TwinConfig) {
        if let Some(tick_ms) = self.tick_ms {
            config.simulation.tick_ms = tick_ms;
        }
        if let Some(speed) = self.speed {
            config.simulation.sim_seconds_per_tick = speed;
        }
        if let Some(every) = self.monitor_every {
            config.simulation.monitor_every_sim_seconds = every;
        }
        if let Some(seed) = self.seed {
            config.simulation.seed = Some(seed);
            config.detector.id_seed = Some(seed);
        }
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries proposals, so logs go to stderr
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

// ============================================================================
// Proposal consumer
// ============================================================================

fn print_proposal(event: &ProposalEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "Failed to serialize proposal"),
    }
}

/// Print each proposal as a JSON line until cancelled or the bus closes.
/// Events already queued at cancellation are still printed.
async fn print_proposals(mut rx: broadcast::Receiver<ProposalEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(event) = rx.try_recv() {
                    print_proposal(&event);
                }
                break;
            }
            received = rx.recv() => match received {
                Ok(event) => print_proposal(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Proposal printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Listener that logs a digest every `every` ticks.
fn digest_listener(
    every: u64,
    monitor: SharedMonitor,
    detector: SharedDetector,
    opts: MetricsOptions,
) -> impl FnMut(&TwinSnapshot) -> Result<()> + Send + 'static {
    move |snapshot: &TwinSnapshot| {
        if snapshot.tick % every != 0 {
            return Ok(());
        }
        let metrics = monitor
            .read()
            .map_err(|_| anyhow::anyhow!("monitor lock poisoned"))?
            .all_metrics(&opts);
        let open = detector
            .lock()
            .map_err(|_| anyhow::anyhow!("detector lock poisoned"))?
            .open_trigger_count();
        info!("\n{}", digest::render(snapshot, &metrics, open));
        Ok(())
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_json);

    let mut config = match &args.config {
        Some(path) => TwinConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TwinConfig::load(),
    };
    args.apply(&mut config);
    config.validate().context("Invalid twin configuration")?;

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  Pharma Twin - process digital twin");
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // Monitor, restored from the store when one is given
    let store = match &args.store {
        Some(path) => Some(
            SledStore::open(path).with_context(|| format!("Failed to open store {}", path.display()))?,
        ),
        None => None,
    };
    let monitor = ModelMonitor::shared();
    if let Some(store) = &store {
        let mut ledger = monitor
            .write()
            .map_err(|_| anyhow::anyhow!("monitor lock poisoned"))?;
        if let Err(e) = ledger.load_from(store) {
            warn!(error = %e, "Could not restore prediction ledger, starting empty");
        }
    }

    let simulation = TwinSimulation::new(&config)?.with_monitor(Arc::clone(&monitor));
    let mut twin_loop = TwinLoop::new(simulation);

    // Proposal bus and its stdout consumer
    let bus = ProposalBus::default();
    let printer_cancel = CancellationToken::new();
    let printer = tokio::spawn(print_proposals(bus.subscribe(), printer_cancel.clone()));

    let detector = AnomalyDetector::new(&config.detector, Some(bus)).shared();
    twin_loop.subscribe(DetectorListener::new(Arc::clone(&detector)))?;

    let metrics_opts = MetricsOptions::from(&config.monitor);
    if args.digest_every > 0 {
        twin_loop.subscribe(digest_listener(
            args.digest_every,
            Arc::clone(&monitor),
            Arc::clone(&detector),
            metrics_opts.clone(),
        ))?;
    }

    let options = LoopOptions {
        max_ticks: args.ticks,
        ..LoopOptions::from(&config.simulation)
    };
    twin_loop.start(options)?;

    // Graceful shutdown via Ctrl+C or tick limit
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        ticks = twin_loop.finished() => {
            info!(ticks, "Run complete");
        }
    }
    twin_loop.stop().await;

    printer_cancel.cancel();
    if let Err(e) = printer.await {
        warn!(error = %e, "Proposal printer ended abnormally");
    }

    let metrics = monitor
        .read()
        .map_err(|_| anyhow::anyhow!("monitor lock poisoned"))?
        .all_metrics(&metrics_opts);
    for m in &metrics {
        info!(
            model = %m.model_id,
            n = m.n,
            accuracy = ?m.accuracy,
            brier = m.brier,
            ece = m.ece,
            auroc = m.auroc,
            "Model metrics"
        );
    }

    if let Some(store) = &store {
        let ledger = monitor
            .read()
            .map_err(|_| anyhow::anyhow!("monitor lock poisoned"))?;
        match ledger.save_to(store) {
            Ok(()) => {
                if let Err(e) = store.flush() {
                    warn!(error = %e, backend = store.backend_name(), "Ledger flush failed");
                }
            }
            Err(e) => warn!(error = %e, "Failed to save prediction ledger"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}
