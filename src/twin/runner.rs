//! Timer-driven loop around a [`TwinSimulation`].
//!
//! One tokio task owns the tick cadence. Cancellation is checked between
//! ticks only, so a stopped loop never leaves a partial tick behind and can be
//! started again on the same state.

use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::simulation::{SnapshotListener, SubscriptionId, TickReport, TwinSimulation};
use super::ticker::{IntervalTicker, TickSource};
use super::TwinError;
use crate::config::SimulationConfig;

/// Simulation shared between the loop task and external callers.
pub type SharedTwin = Arc<Mutex<TwinSimulation>>;

/// Options accepted by [`TwinLoop::start`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOptions {
    /// Real-time interval between ticks.
    pub tick_ms: u64,
    /// Overrides the simulation's current speed when set.
    pub sim_seconds_per_tick: Option<f64>,
    /// Overrides the prediction sampling interval when set.
    pub monitor_every_sim_seconds: Option<f64>,
    /// Stop on its own after this many ticks.
    pub max_ticks: Option<u64>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self::from(&SimulationConfig::default())
    }
}

impl From<&SimulationConfig> for LoopOptions {
    fn from(config: &SimulationConfig) -> Self {
        Self {
            tick_ms: config.tick_ms,
            sim_seconds_per_tick: Some(config.sim_seconds_per_tick),
            monitor_every_sim_seconds: Some(config.monitor_every_sim_seconds),
            max_ticks: None,
        }
    }
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<u64>,
}

/// Loop control: `start`, `stop`, `is_running`, `set_speed`, `speed`.
///
/// Only one timer drives a given twin; `start` while running is rejected.
pub struct TwinLoop {
    twin: SharedTwin,
    running: Option<RunningLoop>,
}

impl TwinLoop {
    pub fn new(simulation: TwinSimulation) -> Self {
        Self {
            twin: Arc::new(Mutex::new(simulation)),
            running: None,
        }
    }

    /// Shared handle to the simulation (for snapshots, subscriptions, tests).
    pub fn twin(&self) -> SharedTwin {
        Arc::clone(&self.twin)
    }

    /// Start ticking on a real-time interval. Must be called inside a tokio
    /// runtime.
    pub fn start(&mut self, options: LoopOptions) -> Result<(), TwinError> {
        if options.tick_ms == 0 {
            return Err(TwinError::InvalidTickInterval);
        }
        let source = IntervalTicker::new(options.tick_ms);
        self.start_with(source, options)
    }

    /// Start ticking from an arbitrary [`TickSource`]. `options.tick_ms` is
    /// ignored; the source decides the cadence.
    pub fn start_with<S: TickSource>(&mut self, source: S, options: LoopOptions) -> Result<(), TwinError> {
        if self.is_running() {
            return Err(TwinError::AlreadyRunning);
        }

        {
            let mut sim = self.twin.lock().map_err(|_| TwinError::Poisoned)?;
            if let Some(speed) = options.sim_seconds_per_tick {
                sim.set_speed(speed)?;
            }
            if let Some(every) = options.monitor_every_sim_seconds {
                sim.set_monitor_every(every)?;
            }
            info!(
                source = source.source_name(),
                tick_ms = options.tick_ms,
                sim_seconds_per_tick = sim.speed(),
                "Twin loop starting"
            );
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(drive(
            Arc::clone(&self.twin),
            source,
            cancel.clone(),
            options.max_ticks,
        ));
        self.running = Some(RunningLoop { cancel, handle });
        Ok(())
    }

    /// Stop the timer and wait for the in-flight tick (if any) to finish.
    /// Returns the number of ticks the stopped run executed.
    pub async fn stop(&mut self) -> u64 {
        let Some(running) = self.running.take() else {
            return 0;
        };
        running.cancel.cancel();
        let ticks = match running.handle.await {
            Ok(ticks) => ticks,
            Err(e) => {
                error!(error = %e, "Twin loop task ended abnormally");
                0
            }
        };
        info!(ticks, "Twin loop stopped");
        ticks
    }

    /// Wait until the loop ends on its own (source exhausted or `max_ticks`).
    /// Returns immediately with 0 when not running.
    pub async fn finished(&mut self) -> u64 {
        let Some(running) = self.running.as_mut() else {
            return 0;
        };
        let ticks = (&mut running.handle).await.unwrap_or_else(|e| {
            error!(error = %e, "Twin loop task ended abnormally");
            0
        });
        self.running = None;
        ticks
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Change simulated seconds per tick without stopping the timer.
    pub fn set_speed(&self, sim_seconds_per_tick: f64) -> Result<(), TwinError> {
        let mut sim = self.twin.lock().map_err(|_| TwinError::Poisoned)?;
        sim.set_speed(sim_seconds_per_tick)?;
        info!(sim_seconds_per_tick, "Twin speed changed");
        Ok(())
    }

    pub fn speed(&self) -> Result<f64, TwinError> {
        let sim = self.twin.lock().map_err(|_| TwinError::Poisoned)?;
        Ok(sim.speed())
    }

    pub fn subscribe<L: SnapshotListener + 'static>(&self, listener: L) -> Result<SubscriptionId, TwinError> {
        let mut sim = self.twin.lock().map_err(|_| TwinError::Poisoned)?;
        Ok(sim.subscribe(listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, TwinError> {
        let mut sim = self.twin.lock().map_err(|_| TwinError::Poisoned)?;
        Ok(sim.unsubscribe(id))
    }

    /// Step `n` ticks synchronously, bypassing the timer.
    pub fn run_ticks(&self, n: u64) -> Result<Vec<TickReport>, TwinError> {
        (0..n).map(|_| step(&self.twin)).collect()
    }
}

/// Run exactly one tick under the lock.
fn step(twin: &SharedTwin) -> Result<TickReport, TwinError> {
    let mut sim = twin.lock().map_err(|_| TwinError::Poisoned)?;
    Ok(sim.tick())
}

async fn drive<S: TickSource>(
    twin: SharedTwin,
    mut source: S,
    cancel: CancellationToken,
    max_ticks: Option<u64>,
) -> u64 {
    let mut ticks = 0u64;

    loop {
        if max_ticks.is_some_and(|max| ticks >= max) {
            info!(ticks, "Twin loop reached tick limit");
            break;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Twin loop cancellation received");
                break;
            }
            more = source.next_tick() => {
                if !more {
                    info!(source = source.source_name(), ticks, "Tick source exhausted");
                    break;
                }
            }
        }

        match step(&twin) {
            Ok(report) => {
                ticks += 1;
                if !report.completed.is_empty() || report.listener_failures > 0 {
                    debug!(
                        tick = report.tick,
                        completed = report.completed.len(),
                        listener_failures = report.listener_failures,
                        "Tick processed"
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "Twin loop halted");
                break;
            }
        }
    }

    ticks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TwinConfig;
    use crate::twin::ManualTicker;

    fn seeded_loop() -> TwinLoop {
        let mut config = TwinConfig::default();
        config.simulation.seed = Some(11);
        let sim = TwinSimulation::new(&config).unwrap();
        TwinLoop::new(sim)
    }

    #[tokio::test]
    async fn test_manual_ticks_drive_the_twin() {
        let mut twin_loop = seeded_loop();
        let (ticker, handle) = ManualTicker::new();
        twin_loop.start_with(ticker, LoopOptions::default()).unwrap();
        assert!(twin_loop.is_running());

        handle.step(5);
        drop(handle);
        let ticks = twin_loop.finished().await;
        assert_eq!(ticks, 5);
        assert!(!twin_loop.is_running());

        let tick = twin_loop.twin().lock().unwrap().state().tick;
        assert_eq!(tick, 5);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let mut twin_loop = seeded_loop();
        let (ticker, _handle) = ManualTicker::new();
        twin_loop.start_with(ticker, LoopOptions::default()).unwrap();

        let (second, _h2) = ManualTicker::new();
        let err = twin_loop.start_with(second, LoopOptions::default());
        assert!(matches!(err, Err(TwinError::AlreadyRunning)));

        twin_loop.stop().await;
        assert!(!twin_loop.is_running());
    }

    #[tokio::test]
    async fn test_stopped_loop_resumes_on_same_state() {
        let mut twin_loop = seeded_loop();
        let (ticker, handle) = ManualTicker::new();
        twin_loop.start_with(ticker, LoopOptions::default()).unwrap();
        handle.step(2);
        // Give the task a chance to consume both ticks before stopping
        while twin_loop.twin().lock().unwrap().state().tick < 2 {
            tokio::task::yield_now().await;
        }
        twin_loop.stop().await;

        let (ticker, handle) = ManualTicker::new();
        twin_loop.start_with(ticker, LoopOptions::default()).unwrap();
        handle.step(3);
        drop(handle);
        twin_loop.finished().await;
        assert_eq!(twin_loop.twin().lock().unwrap().state().tick, 5);
    }

    #[tokio::test]
    async fn test_speed_changes_while_running() {
        let mut twin_loop = seeded_loop();
        let (ticker, _handle) = ManualTicker::new();
        twin_loop.start_with(ticker, LoopOptions::default()).unwrap();

        twin_loop.set_speed(300.0).unwrap();
        assert!((twin_loop.speed().unwrap() - 300.0).abs() < f64::EPSILON);
        assert!(twin_loop.is_running());
        assert!(matches!(twin_loop.set_speed(0.0), Err(TwinError::InvalidSpeed(_))));

        twin_loop.stop().await;
    }

    #[tokio::test]
    async fn test_max_ticks_ends_run() {
        let mut twin_loop = seeded_loop();
        let (ticker, handle) = ManualTicker::new();
        let options = LoopOptions {
            max_ticks: Some(2),
            ..LoopOptions::default()
        };
        twin_loop.start_with(ticker, options).unwrap();
        handle.step(10);
        assert_eq!(twin_loop.finished().await, 2);
    }

    #[test]
    fn test_panicking_listener_leaves_twin_usable() {
        let twin_loop = seeded_loop();
        twin_loop
            .subscribe(|_: &crate::types::TwinSnapshot| -> anyhow::Result<()> {
                panic!("listener bug")
            })
            .unwrap();

        let first = twin_loop.run_ticks(1).unwrap();
        assert_eq!(first[0].listener_failures, 1);
        let second = twin_loop.run_ticks(1).unwrap();
        assert_eq!(second[0].tick, 2);
        assert!(!twin_loop.twin().is_poisoned());
        twin_loop.set_speed(120.0).unwrap();
    }

    #[test]
    fn test_run_ticks_without_runtime() {
        let twin_loop = seeded_loop();
        let reports = twin_loop.run_ticks(4).unwrap();
        assert_eq!(reports.len(), 4);
        assert_eq!(reports[3].tick, 4);
    }
}
