//! Anomaly / Automation Detector
//!
//! Classifies every CPP of every batch on each snapshot and raises proposals:
//!
//! - **OOS** (Out of Specification): reading outside its bounds. Fires once
//!   per excursion; cleared when the reading returns in bounds.
//! - **OOT** (Out of Trend): reading in bounds, beyond the trend band around
//!   target, and moving further away by more than the minimum step on
//!   consecutive snapshots. Fires when the streak reaches its configured
//!   length; cleared when the reading falls back inside the band.
//!
//! OOS supersedes OOT on the same (batch, parameter). Each new trigger
//! produces one [`ProposalEvent`] carrying a Deviation and an
//! AutomationSuggestion; the detector keeps only the open trigger ids.
//!
//! ## Usage
//!
//! ```ignore
//! let bus = ProposalBus::default();
//! let detector = AnomalyDetector::new(&config.detector, Some(bus.clone())).shared();
//! twin_loop.subscribe(DetectorListener::new(Arc::clone(&detector)))?;
//! ```

pub mod bus;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::config::{defaults, DetectorConfig};
use crate::twin::SnapshotListener;
use crate::types::{
    AutomationSuggestion, BatchState, Compliance, CppBounds, CppParameter, Deviation,
    DeviationSeverity, Measurement, ProposalEvent, TriggerKind, TwinSnapshot,
};

pub use bus::ProposalBus;

/// Detector shared between the snapshot listener and resolution callers.
pub type SharedDetector = Arc<Mutex<AnomalyDetector>>;

type ParamKey = (String, CppParameter);
type TriggerKey = (String, CppParameter, TriggerKind);

/// Trend accumulator for one (batch, parameter).
#[derive(Debug, Clone, Default)]
struct TrendState {
    last_value: Option<f64>,
    away_ticks: u32,
}

pub struct AnomalyDetector {
    config: DetectorConfig,
    bus: Option<ProposalBus>,
    /// Open triggers -> deviation id
    open: HashMap<TriggerKey, String>,
    trends: HashMap<ParamKey, TrendState>,
    rng: StdRng,
}

impl AnomalyDetector {
    pub fn new(config: &DetectorConfig, bus: Option<ProposalBus>) -> Self {
        let rng = match config.id_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config: config.clone(),
            bus,
            open: HashMap::new(),
            trends: HashMap::new(),
            rng,
        }
    }

    pub fn shared(self) -> SharedDetector {
        Arc::new(Mutex::new(self))
    }

    /// Analyze one snapshot. Returns the new proposals, which have also been
    /// published on the bus when one is attached.
    pub fn analyze(&mut self, snapshot: &TwinSnapshot) -> Vec<ProposalEvent> {
        let mut events = Vec::new();

        for batch in &snapshot.batches {
            for parameter in CppParameter::ALL {
                if let Some(event) = self.check(batch, parameter, snapshot.timestamp) {
                    events.push(event);
                }
            }
        }

        self.prune(snapshot);

        for event in &events {
            info!(
                trigger = %event.trigger,
                batch_id = %event.batch_id,
                parameter = %event.parameter,
                severity = %event.deviation.severity,
                deviation_id = %event.deviation.id,
                value = event.measurement.value,
                "Deviation proposed"
            );
            if let Some(bus) = &self.bus {
                bus.publish(event.clone());
            }
        }

        events
    }

    /// Clear the open trigger holding `deviation_id`. Unknown ids are a no-op.
    pub fn notify_resolved(&mut self, deviation_id: &str) -> bool {
        let key = self
            .open
            .iter()
            .find(|(_, id)| id.as_str() == deviation_id)
            .map(|(key, _)| key.clone());

        match key {
            Some(key) => {
                self.open.remove(&key);
                debug!(deviation_id, "Trigger resolved externally");
                true
            }
            None => false,
        }
    }

    pub fn open_trigger_count(&self) -> usize {
        self.open.len()
    }

    pub fn is_open(&self, batch_id: &str, parameter: CppParameter, kind: TriggerKind) -> bool {
        self.open
            .contains_key(&(batch_id.to_string(), parameter, kind))
    }

    // ========================================================================
    // Classification
    // ========================================================================

    fn check(
        &mut self,
        batch: &BatchState,
        parameter: CppParameter,
        now: DateTime<Utc>,
    ) -> Option<ProposalEvent> {
        let reading = batch.parameters.get(parameter);
        let bounds = batch.bounds.get(parameter);
        let value = reading.current;
        let deviation = value - reading.target;

        let oos_key = (batch.id.clone(), parameter, TriggerKind::Oos);
        let oot_key = (batch.id.clone(), parameter, TriggerKind::Oot);
        let trend = self
            .trends
            .entry((batch.id.clone(), parameter))
            .or_default();

        if !bounds.contains(value) {
            trend.last_value = Some(value);
            trend.away_ticks = 0;
            self.open.remove(&oot_key);
            if self.open.contains_key(&oos_key) {
                return None;
            }
            let event = self.build_event(batch, parameter, TriggerKind::Oos, now);
            self.open.insert(oos_key, event.deviation.id.clone());
            return Some(event);
        }

        self.open.remove(&oos_key);

        let half = bounds.half_range();
        let band = self.config.oot_band_fraction * half;
        let min_step = self.config.oot_min_step_fraction * bounds.range();

        if deviation.abs() <= band {
            self.open.remove(&oot_key);
        }

        // First observation only seeds the trend
        let previous = trend.last_value.replace(value)?;

        let delta = value - previous;
        let moving_away = deviation != 0.0
            && delta.signum() == deviation.signum()
            && delta.abs() > min_step
            && deviation.abs() > band;

        if moving_away {
            trend.away_ticks = (trend.away_ticks + 1).min(self.config.oot_streak);
        } else {
            trend.away_ticks = trend.away_ticks.saturating_sub(1);
        }

        if trend.away_ticks < self.config.oot_streak {
            return None;
        }
        trend.away_ticks = 0;

        if self.open.contains_key(&oot_key) {
            return None;
        }
        let event = self.build_event(batch, parameter, TriggerKind::Oot, now);
        self.open.insert(oot_key, event.deviation.id.clone());
        Some(event)
    }

    /// Drop state for batches no longer present (completed and replaced).
    fn prune(&mut self, snapshot: &TwinSnapshot) {
        let live: HashSet<&str> = snapshot.batches.iter().map(|b| b.id.as_str()).collect();
        self.trends.retain(|(batch_id, _), _| live.contains(batch_id.as_str()));
        self.open.retain(|(batch_id, _, _), _| live.contains(batch_id.as_str()));
    }

    // ========================================================================
    // Proposal construction
    // ========================================================================

    fn next_id(&mut self, prefix: &str, now: DateTime<Utc>) -> String {
        let suffix: u32 = self.rng.gen_range(0..0x0100_0000);
        format!("{}-{}-{:06x}", prefix, now.timestamp_millis(), suffix)
    }

    fn build_event(
        &mut self,
        batch: &BatchState,
        parameter: CppParameter,
        kind: TriggerKind,
        now: DateTime<Utc>,
    ) -> ProposalEvent {
        let reading = batch.parameters.get(parameter);
        let bounds = batch.bounds.get(parameter);
        let value = reading.current;
        let deviation = value - reading.target;

        let (severity, confidence, compliance, title, description) = match kind {
            TriggerKind::Oos => {
                let fraction = exceedance_fraction(value, bounds);
                let severity = if fraction > self.config.oos_critical_fraction {
                    DeviationSeverity::Critical
                } else if fraction > self.config.oos_high_fraction {
                    DeviationSeverity::High
                } else {
                    DeviationSeverity::Medium
                };
                (
                    severity,
                    0.6 + 0.3 * fraction.min(1.0),
                    Compliance::OutOfSpec,
                    format!("{} out of specification", parameter.label()),
                    format!(
                        "{} at {:.2} {} is outside [{:.2}, {:.2}] during {}",
                        parameter.label(),
                        value,
                        reading.unit,
                        bounds.min,
                        bounds.max,
                        batch.stage
                    ),
                )
            }
            TriggerKind::Oot => {
                let half = bounds.half_range();
                let ratio = if half > 0.0 { deviation.abs() / half } else { 0.0 };
                let severity = if ratio > self.config.oot_high_ratio {
                    DeviationSeverity::High
                } else {
                    DeviationSeverity::Medium
                };
                let direction = if deviation > 0.0 { "upward" } else { "downward" };
                (
                    severity,
                    0.5 + 0.3 * ratio.min(1.0),
                    Compliance::OutOfTrend,
                    format!("{} trending out of range", parameter.label()),
                    format!(
                        "{} drifting {} for {} consecutive readings, now {:.2} {} (target {:.2}) during {}",
                        parameter.label(),
                        direction,
                        self.config.oot_streak,
                        value,
                        reading.unit,
                        reading.target,
                        batch.stage
                    ),
                )
            }
        };

        let deviation_id = self.next_id(defaults::DEVIATION_ID_PREFIX, now);
        let suggestion_id = self.next_id(defaults::SUGGESTION_ID_PREFIX, now);

        let record = Deviation {
            id: deviation_id.clone(),
            batch_id: batch.id.clone(),
            product_code: batch.product.product_code.clone(),
            parameter,
            kind,
            severity,
            title: format!("{title}: {}", batch.id),
            description,
            stage: batch.stage.clone(),
            detected_at: now,
        };

        let suggestion = AutomationSuggestion {
            id: suggestion_id,
            deviation_id,
            batch_id: batch.id.clone(),
            parameter,
            action: format!(
                "Adjust {} setpoint to {:.2} {}",
                parameter.as_str(),
                reading.target,
                reading.unit
            ),
            rationale: format!(
                "{} is {:+.2} {} from target; restoring the setpoint brings it back toward the centre of [{:.2}, {:.2}]",
                parameter.label(),
                deviation,
                reading.unit,
                bounds.min,
                bounds.max
            ),
            proposed_setpoint: reading.target,
            unit: reading.unit.clone(),
            confidence,
            requires_approval: true,
            created_at: now,
        };

        ProposalEvent {
            trigger: kind,
            batch_id: batch.id.clone(),
            parameter,
            measurement: Measurement {
                value,
                target: reading.target,
                min: bounds.min,
                max: bounds.max,
                deviation,
                compliance,
            },
            deviation: record,
            suggestion,
        }
    }
}

/// Distance beyond the violated bound as a fraction of the full range.
fn exceedance_fraction(value: f64, bounds: CppBounds) -> f64 {
    let range = bounds.range();
    if range <= 0.0 {
        return 0.0;
    }
    let beyond = if value > bounds.max {
        value - bounds.max
    } else if value < bounds.min {
        bounds.min - value
    } else {
        0.0
    };
    beyond / range
}

// ============================================================================
// Snapshot subscription
// ============================================================================

/// Feeds every twin snapshot into a shared detector.
pub struct DetectorListener {
    detector: SharedDetector,
}

impl DetectorListener {
    pub fn new(detector: SharedDetector) -> Self {
        Self { detector }
    }
}

impl SnapshotListener for DetectorListener {
    fn on_snapshot(&mut self, snapshot: &TwinSnapshot) -> anyhow::Result<()> {
        let mut detector = self
            .detector
            .lock()
            .map_err(|_| anyhow::anyhow!("detector lock poisoned"))?;
        detector.analyze(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twin::state::{seed_products, TwinState};

    fn fixture() -> (TwinState, BatchState) {
        let mut rng = StdRng::seed_from_u64(5);
        let mut state = TwinState::new(Utc::now(), 0);
        let (product, eq) = seed_products().remove(0);
        let mut batch = state.spawn_batch(product, eq, Utc::now(), 10.0, &mut rng);
        for parameter in CppParameter::ALL {
            let reading = batch.parameters.get_mut(parameter);
            reading.current = reading.target;
        }
        (state, batch)
    }

    fn snapshot_with_temperature(state: &TwinState, batch: &BatchState, temperature: f64) -> TwinSnapshot {
        let mut batch = batch.clone();
        batch.parameters.temperature.current = temperature;
        let mut snapshot = state.snapshot();
        snapshot.batches = vec![batch];
        snapshot
    }

    fn detector() -> AnomalyDetector {
        let config = DetectorConfig {
            id_seed: Some(9),
            ..DetectorConfig::default()
        };
        AnomalyDetector::new(&config, None)
    }

    #[test]
    fn test_exceedance_fraction() {
        let b = CppBounds { min: 60.0, max: 70.0 };
        assert!((exceedance_fraction(72.5, b) - 0.25).abs() < 1e-12);
        assert!((exceedance_fraction(50.0, b) - 1.0).abs() < 1e-12);
        assert_eq!(exceedance_fraction(65.0, b), 0.0);
    }

    #[test]
    fn test_oos_severity_bands() {
        let (state, batch) = fixture();
        // API-101 temperature [60, 70], range 10
        for (value, expected) in [
            (71.0, DeviationSeverity::Medium),
            (75.5, DeviationSeverity::High),
            (78.0, DeviationSeverity::Critical),
        ] {
            let mut det = detector();
            let events = det.analyze(&snapshot_with_temperature(&state, &batch, value));
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].deviation.severity, expected, "value {value}");
            assert!(events[0].suggestion.requires_approval);
        }
    }

    #[test]
    fn test_proposal_payload() {
        let (state, batch) = fixture();
        let mut det = detector();
        let events = det.analyze(&snapshot_with_temperature(&state, &batch, 71.0));
        let event = &events[0];

        assert_eq!(event.trigger, TriggerKind::Oos);
        assert_eq!(event.batch_id, batch.id);
        assert_eq!(event.measurement.compliance, Compliance::OutOfSpec);
        assert!((event.measurement.deviation - 6.0).abs() < 1e-12);
        assert_eq!(event.suggestion.deviation_id, event.deviation.id);
        assert!(event.deviation.id.starts_with("DEV-"));
        assert!(event.suggestion.id.starts_with("AUT-"));
        assert!((event.suggestion.proposed_setpoint - 65.0).abs() < 1e-12);
    }

    #[test]
    fn test_notify_resolved_is_idempotent() {
        let (state, batch) = fixture();
        let mut det = detector();
        let events = det.analyze(&snapshot_with_temperature(&state, &batch, 71.0));
        let id = events[0].deviation.id.clone();

        assert!(det.notify_resolved(&id));
        assert!(!det.notify_resolved(&id));
        assert!(!det.notify_resolved("DEV-unknown"));
        assert_eq!(det.open_trigger_count(), 0);

        // Still out of spec after external resolution: fires anew
        let events = det.analyze(&snapshot_with_temperature(&state, &batch, 71.0));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_oos_supersedes_oot() {
        let (state, batch) = fixture();
        let mut det = detector();
        for t in [65.0, 67.5, 68.0, 68.5] {
            det.analyze(&snapshot_with_temperature(&state, &batch, t));
        }
        assert!(det.is_open(&batch.id, CppParameter::Temperature, TriggerKind::Oot));

        let events = det.analyze(&snapshot_with_temperature(&state, &batch, 71.0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger, TriggerKind::Oos);
        assert!(!det.is_open(&batch.id, CppParameter::Temperature, TriggerKind::Oot));
        assert!(det.is_open(&batch.id, CppParameter::Temperature, TriggerKind::Oos));
    }

    #[test]
    fn test_state_for_replaced_batches_is_pruned() {
        let (state, batch) = fixture();
        let mut det = detector();
        det.analyze(&snapshot_with_temperature(&state, &batch, 71.0));
        assert_eq!(det.open_trigger_count(), 1);

        let mut empty = state.snapshot();
        empty.batches.clear();
        det.analyze(&empty);
        assert_eq!(det.open_trigger_count(), 0);
    }

    #[tokio::test]
    async fn test_events_are_published_on_bus() {
        let (state, batch) = fixture();
        let bus = ProposalBus::new(8);
        let mut rx = bus.subscribe();
        let mut det = AnomalyDetector::new(&DetectorConfig::default(), Some(bus));

        det.analyze(&snapshot_with_temperature(&state, &batch, 59.0));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.trigger, TriggerKind::Oos);
        assert_eq!(event.parameter, CppParameter::Temperature);
    }

    #[test]
    fn test_publish_without_receivers_is_silent() {
        let bus = ProposalBus::default();
        assert_eq!(bus.receiver_count(), 0);
        let (state, batch) = fixture();
        let mut det = AnomalyDetector::new(&DetectorConfig::default(), Some(bus));
        assert_eq!(det.analyze(&snapshot_with_temperature(&state, &batch, 80.0)).len(), 1);
    }
}
