//! Twin simulation: per-tick batch/equipment dynamics and snapshot fan-out.
//!
//! Batch state machine:
//!
//! ```text
//! running <-> warning -> complete -> replaced (same tick)
//! ```
//!
//! `error` is reserved and never driven here.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Bernoulli, Distribution};
use tracing::{debug, info, warn};

use super::state::{class_baseline, TwinState};
use super::stochastic::drift_step;
use super::TwinError;
use crate::config::{defaults, EquipmentConfig, ProcessConfig, TwinConfig};
use crate::monitor::SharedMonitor;
use crate::prediction;
use crate::types::{
    BatchState, BatchStatus, CompletedBatch, CppParameter, EquipmentTelemetryState, TimelineEntry,
    TwinSnapshot,
};

// ============================================================================
// Subscriptions
// ============================================================================

/// Receives one snapshot per tick, in subscription order.
///
/// Returning `Err` or panicking is logged and isolated: the remaining
/// listeners still run and the tick completes.
pub trait SnapshotListener: Send {
    fn on_snapshot(&mut self, snapshot: &TwinSnapshot) -> anyhow::Result<()>;
}

impl<F> SnapshotListener for F
where
    F: FnMut(&TwinSnapshot) -> anyhow::Result<()> + Send,
{
    fn on_snapshot(&mut self, snapshot: &TwinSnapshot) -> anyhow::Result<()> {
        self(snapshot)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Handle returned by [`TwinSimulation::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// What one tick did, for logging and tests.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub tick: u64,
    pub completed: Vec<CompletedBatch>,
    /// Prediction records appended by periodic sampling this tick.
    pub sampled: usize,
    pub listeners_notified: usize,
    pub listener_failures: usize,
}

// ============================================================================
// Random events
// ============================================================================

/// Per-tick Bernoulli events, built once from config.
struct EventDistributions {
    shock: Bernoulli,
    recovery: Bernoulli,
    alert: Bernoulli,
}

impl EventDistributions {
    fn new(process: &ProcessConfig, equipment: &EquipmentConfig) -> Result<Self, TwinError> {
        let build = |name: &'static str, p: f64| {
            Bernoulli::new(p).map_err(|e| TwinError::InvalidProbability(name, e.to_string()))
        };
        Ok(Self {
            shock: build("process.shock_probability", process.shock_probability)?,
            recovery: build("process.recovery_probability", process.recovery_probability)?,
            alert: build("equipment.alert_probability", equipment.alert_probability)?,
        })
    }
}

// ============================================================================
// Simulation
// ============================================================================

/// One independent twin: owned state, seeded RNG, subscribers and an
/// optional monitor for periodic prediction sampling.
pub struct TwinSimulation {
    state: TwinState,
    rng: StdRng,
    process: ProcessConfig,
    equipment: EquipmentConfig,
    events: EventDistributions,
    sim_seconds_per_tick: f64,
    monitor_every_sim_seconds: f64,
    monitor_accum_secs: f64,
    monitor: Option<SharedMonitor>,
    listeners: Vec<(SubscriptionId, Box<dyn SnapshotListener>)>,
    next_subscription: u64,
}

impl TwinSimulation {
    /// Seeded demonstration plant starting at the current wall-clock time.
    pub fn new(config: &TwinConfig) -> Result<Self, TwinError> {
        Self::starting_at(config, Utc::now())
    }

    /// Seeded demonstration plant with an explicit simulated start time.
    pub fn starting_at(config: &TwinConfig, start: DateTime<Utc>) -> Result<Self, TwinError> {
        let mut rng = match config.simulation.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = TwinState::seeded(config, start, &mut rng);
        Self::from_state(config, state, rng)
    }

    /// Wrap an existing state. Used by tests to drive hand-built batches.
    pub fn from_state(config: &TwinConfig, state: TwinState, rng: StdRng) -> Result<Self, TwinError> {
        let speed = config.simulation.sim_seconds_per_tick;
        if !speed.is_finite() || speed <= 0.0 {
            return Err(TwinError::InvalidSpeed(speed));
        }
        Ok(Self {
            state,
            rng,
            events: EventDistributions::new(&config.process, &config.equipment)?,
            process: config.process.clone(),
            equipment: config.equipment.clone(),
            sim_seconds_per_tick: speed,
            monitor_every_sim_seconds: config.simulation.monitor_every_sim_seconds,
            monitor_accum_secs: 0.0,
            monitor: None,
            listeners: Vec::new(),
            next_subscription: 0,
        })
    }

    /// Attach the monitor that periodic sampling appends to.
    pub fn with_monitor(mut self, monitor: SharedMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn set_monitor(&mut self, monitor: Option<SharedMonitor>) {
        self.monitor = monitor;
    }

    pub fn state(&self) -> &TwinState {
        &self.state
    }

    pub fn snapshot(&self) -> TwinSnapshot {
        self.state.snapshot()
    }

    /// Simulated seconds advanced per tick.
    pub fn speed(&self) -> f64 {
        self.sim_seconds_per_tick
    }

    /// Change simulated seconds per tick; applies from the next tick.
    pub fn set_speed(&mut self, sim_seconds_per_tick: f64) -> Result<(), TwinError> {
        if !sim_seconds_per_tick.is_finite() || sim_seconds_per_tick <= 0.0 {
            return Err(TwinError::InvalidSpeed(sim_seconds_per_tick));
        }
        self.sim_seconds_per_tick = sim_seconds_per_tick;
        Ok(())
    }

    /// Change how many simulated seconds elapse between prediction samples.
    pub fn set_monitor_every(&mut self, sim_seconds: f64) -> Result<(), TwinError> {
        if !sim_seconds.is_finite() || sim_seconds <= 0.0 {
            return Err(TwinError::InvalidSamplingInterval(sim_seconds));
        }
        self.monitor_every_sim_seconds = sim_seconds;
        Ok(())
    }

    pub fn subscribe<L: SnapshotListener + 'static>(&mut self, listener: L) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` for unknown ids.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    /// Advance the twin by one tick. Never fails: listener and sampling
    /// errors are logged and swallowed.
    pub fn tick(&mut self) -> TickReport {
        let dt = self.sim_seconds_per_tick;
        self.state.tick += 1;
        self.state.clock += Duration::milliseconds((dt * 1_000.0).round() as i64);
        let now = self.state.clock;

        let mut report = TickReport {
            tick: self.state.tick,
            ..TickReport::default()
        };

        // Batches
        let mut finished = Vec::new();
        for (idx, batch) in self.state.batches.iter_mut().enumerate() {
            if let Some(final_status) =
                advance_batch(batch, &self.process, &self.events, dt, now, &mut self.rng)
            {
                finished.push((idx, final_status));
            }
        }
        for (idx, final_status) in finished {
            let completed = self.replace_batch(idx, final_status, now);
            report.completed.push(completed);
        }

        // Equipment
        for unit in &mut self.state.equipment {
            advance_equipment(unit, &self.equipment, &self.events, dt, &mut self.rng);
        }

        // Periodic prediction sampling
        self.monitor_accum_secs += dt;
        if self.monitor_accum_secs >= self.monitor_every_sim_seconds {
            self.monitor_accum_secs = 0.0;
            if let Some(monitor) = &self.monitor {
                match prediction::sample_into(
                    &self.state.batches,
                    &self.state.equipment,
                    now,
                    monitor,
                ) {
                    Ok(n) => {
                        report.sampled = n;
                        debug!(tick = report.tick, records = n, "Prediction sample recorded");
                    }
                    Err(e) => {
                        warn!(tick = report.tick, error = %e, "Prediction sampling failed, skipping");
                    }
                }
            }
        }

        // Fan out
        if !self.listeners.is_empty() {
            let snapshot = self.state.snapshot();
            for (id, listener) in &mut self.listeners {
                report.listeners_notified += 1;
                match panic::catch_unwind(AssertUnwindSafe(|| listener.on_snapshot(&snapshot))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        report.listener_failures += 1;
                        warn!(subscription = id.0, tick = snapshot.tick, error = %e, "Snapshot listener failed");
                    }
                    Err(payload) => {
                        report.listener_failures += 1;
                        warn!(
                            subscription = id.0,
                            tick = snapshot.tick,
                            panic = panic_message(payload.as_ref()),
                            "Snapshot listener panicked"
                        );
                    }
                }
            }
        }

        report
    }

    /// Close out a completed batch and put a fresh one from the same product
    /// in its slot.
    fn replace_batch(
        &mut self,
        idx: usize,
        final_status: BatchStatus,
        now: DateTime<Utc>,
    ) -> CompletedBatch {
        let (product, equipment_ids) = {
            let old = &self.state.batches[idx];
            (old.product.clone(), old.equipment_ids.clone())
        };
        let restart_progress = if self.process.restart_progress_max > 0.0 {
            self.rng.gen_range(0.0..self.process.restart_progress_max)
        } else {
            0.0
        };
        let fresh = self
            .state
            .spawn_batch(product, equipment_ids, now, restart_progress, &mut self.rng);
        let old = std::mem::replace(&mut self.state.batches[idx], fresh);

        let summary = CompletedBatch {
            id: old.id.clone(),
            product_code: old.product.product_code.clone(),
            started_at: old.started_at,
            completed_at: now,
            final_status,
            replaced_by: self.state.batches[idx].id.clone(),
        };
        info!(
            batch_id = %summary.id,
            product = %summary.product_code,
            replaced_by = %summary.replaced_by,
            "Batch complete, replacement started"
        );
        self.state.record_completion(summary.clone());
        summary
    }
}

// ============================================================================
// Batch dynamics
// ============================================================================

/// Advance one batch by `dt` simulated seconds. Returns the status held on
/// the tick the batch reached 100%, once it is complete.
fn advance_batch<R: Rng + ?Sized>(
    batch: &mut BatchState,
    process: &ProcessConfig,
    events: &EventDistributions,
    dt: f64,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Option<BatchStatus> {
    if !batch.status.is_active() {
        return None;
    }

    // Progress
    let rate = rng.gen_range(process.progress_rate_min..=process.progress_rate_max);
    batch.progress += (dt / 3_600.0) * rate;

    // CPP drift toward target
    for parameter in CppParameter::ALL {
        let drift = process.drift(parameter);
        let reading = batch.parameters.get_mut(parameter);
        reading.current = drift_step(reading.current, reading.target, drift.k, drift.sigma, dt, rng);
    }

    // Warning recovery (before shocks so a fresh shock keeps its full counter)
    if batch.status == BatchStatus::Warning {
        if batch.warning_ticks_remaining > 0 {
            batch.warning_ticks_remaining -= 1;
        } else if events.recovery.sample(rng) {
            batch.status = BatchStatus::Running;
            debug!(batch_id = %batch.id, "Batch recovered from warning");
        }
    }

    // Transient shock on one parameter
    if events.shock.sample(rng) {
        let parameter = CppParameter::ALL[rng.gen_range(0..CppParameter::ALL.len())];
        let half = batch.bounds.get(parameter).half_range();
        let magnitude = rng.gen_range(process.shock_min_fraction..=process.shock_max_fraction) * half;
        let offset = if rng.gen_bool(0.5) { magnitude } else { -magnitude };
        batch.parameters.get_mut(parameter).current += offset;
        if batch.status == BatchStatus::Running {
            batch.status = BatchStatus::Warning;
            batch.warning_ticks_remaining =
                rng.gen_range(process.warning_ticks_min..=process.warning_ticks_max);
        }
        debug!(batch_id = %batch.id, parameter = %parameter, offset, "Process shock injected");
    }

    // Stage boundaries
    let stage_progress = batch.progress.min(100.0);
    let stage = batch.product.stage_for(stage_progress).to_string();
    if stage != batch.stage {
        if let Some(entry) = batch.active_timeline_entry_mut() {
            entry.ended_at = Some(now);
        }
        batch.timeline.push(TimelineEntry::open(&stage, now));
        batch.stage = stage;
    }

    // Completion
    if batch.progress >= 100.0 {
        let final_status = batch.status;
        batch.progress = 100.0;
        batch.status = BatchStatus::Complete;
        if let Some(entry) = batch.active_timeline_entry_mut() {
            entry.ended_at = Some(now);
        }
        return Some(final_status);
    }

    None
}

// ============================================================================
// Equipment dynamics
// ============================================================================

fn advance_equipment<R: Rng + ?Sized>(
    unit: &mut EquipmentTelemetryState,
    config: &EquipmentConfig,
    events: &EventDistributions,
    dt: f64,
    rng: &mut R,
) {
    if unit.alert_active {
        unit.alert_ticks_remaining = unit.alert_ticks_remaining.saturating_sub(1);
        if unit.alert_ticks_remaining == 0 {
            unit.alert_active = false;
            debug!(equipment_id = %unit.id, "Equipment alert cleared");
        }
    } else if events.alert.sample(rng) {
        unit.alert_active = true;
        unit.alert_ticks_remaining = rng.gen_range(config.alert_ticks_min..=config.alert_ticks_max);
        info!(equipment_id = %unit.id, ticks = unit.alert_ticks_remaining, "Equipment vibration alert raised");
    }

    let (base_rms, base_variance) = class_baseline(config, unit.class);
    let (rms_target, rms_sigma, variance_target) = if unit.alert_active {
        (
            base_rms + config.alert_rms_elevation,
            config.alert_rms_sigma,
            base_variance + config.alert_variance_elevation,
        )
    } else {
        (base_rms, config.rms_sigma, base_variance)
    };

    unit.vibration_rms = drift_step(
        unit.vibration_rms,
        rms_target,
        config.rms_reversion,
        rms_sigma,
        dt,
        rng,
    )
    .clamp(defaults::VIBRATION_RMS_MIN, defaults::VIBRATION_RMS_MAX);

    unit.temperature_variance = drift_step(
        unit.temperature_variance,
        variance_target,
        config.variance_reversion,
        config.variance_sigma,
        dt,
        rng,
    )
    .clamp(defaults::TEMPERATURE_VARIANCE_MIN, defaults::TEMPERATURE_VARIANCE_MAX);

    unit.uptime_hours += dt / 3_600.0;
}
