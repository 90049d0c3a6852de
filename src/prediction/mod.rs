//! Prediction functions
//!
//! Stateless scoring of twin state for three models:
//! - quality: CPP compliance of a batch
//! - deviation risk: distance of temperature/pressure/pH from the bounds midpoint
//! - equipment failure: vibration, temperature variance and alert state
//!
//! Each function returns the probability, the label observed for the same
//! state, and the features used. `sample_into` scores a whole plant and
//! appends the results to the monitor ledger.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::defaults;
use crate::monitor::{MonitorError, SharedMonitor};
use crate::types::{
    BatchState, CppParameter, EquipmentTelemetryState, FeatureMap, Prediction, TwinSnapshot,
};

/// Parameters scored by the deviation-risk model. Volume is left out of the
/// score but still counts toward the label.
const RISK_SCORED: [CppParameter; 3] = [
    CppParameter::Temperature,
    CppParameter::Pressure,
    CppParameter::Ph,
];

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// `p = 0.05 + 0.9 * compliance`, compliance being the fraction of CPPs in
/// bounds. Label 1 iff all four are in bounds.
pub fn predict_quality(batch: &BatchState) -> Prediction {
    let mut features = FeatureMap::new();
    for parameter in CppParameter::ALL {
        features.insert(format!("{}_in_spec", parameter.as_str()), flag(batch.in_spec(parameter)));
    }

    let in_spec = batch.in_spec_count();
    let compliance = in_spec as f64 / CppParameter::ALL.len() as f64;
    features.insert("compliance".to_string(), compliance);

    Prediction {
        probability: 0.05 + 0.9 * compliance,
        label: u8::from(in_spec == CppParameter::ALL.len()),
        features,
    }
}

/// Risk from the largest normalized distance to the bounds midpoint among
/// temperature, pressure and pH: `clamp(max, 0, 2) / 2`. Label 1 iff any of
/// the four CPPs is out of spec.
pub fn predict_deviation_risk(batch: &BatchState) -> Prediction {
    let mut features = FeatureMap::new();
    let mut worst = 0.0f64;

    for parameter in RISK_SCORED {
        let bounds = batch.bounds.get(parameter);
        let current = batch.parameters.get(parameter).current;
        let half = bounds.half_range();
        let distance = if half > 0.0 {
            (current - bounds.midpoint()).abs() / half
        } else {
            0.0
        };
        features.insert(format!("{}_distance", parameter.as_str()), distance);
        worst = worst.max(distance);
    }

    let any_out = CppParameter::ALL.iter().any(|p| !batch.in_spec(*p));
    features.insert("volume_in_spec".to_string(), flag(batch.in_spec(CppParameter::Volume)));

    Prediction {
        probability: worst.clamp(0.0, 2.0) / 2.0,
        label: u8::from(any_out),
        features,
    }
}

/// `clamp(0.6 * rms_norm + 0.3 * var_norm + 0.2 * alert, 0, 1)`. Label is the
/// current alert flag.
pub fn predict_equipment_failure(unit: &EquipmentTelemetryState) -> Prediction {
    let rms_norm = (unit.vibration_rms / defaults::RMS_NORMALIZER).clamp(0.0, 1.0);
    let variance_norm = (unit.temperature_variance / defaults::VARIANCE_NORMALIZER).clamp(0.0, 1.0);
    let alert = flag(unit.alert_active);

    let mut features = FeatureMap::new();
    features.insert("rms_norm".to_string(), rms_norm);
    features.insert("variance_norm".to_string(), variance_norm);
    features.insert("alert".to_string(), alert);

    Prediction {
        probability: (0.6 * rms_norm + 0.3 * variance_norm + 0.2 * alert).clamp(0.0, 1.0),
        label: u8::from(unit.alert_active),
        features,
    }
}

/// Score every batch and unit and append the results to the monitor.
/// Returns the number of records appended.
pub fn sample_into(
    batches: &[BatchState],
    equipment: &[EquipmentTelemetryState],
    timestamp: DateTime<Utc>,
    monitor: &SharedMonitor,
) -> Result<usize, MonitorError> {
    let mut ledger = monitor.write().map_err(|_| MonitorError::Poisoned)?;
    let mut appended = 0;

    for batch in batches {
        let subject = Some(batch.id.clone());
        ledger.record(defaults::MODEL_QUALITY, timestamp, subject.clone(), predict_quality(batch))?;
        ledger.record(defaults::MODEL_DEVIATION_RISK, timestamp, subject, predict_deviation_risk(batch))?;
        appended += 2;
    }
    for unit in equipment {
        ledger.record(
            defaults::MODEL_EQUIPMENT_FAILURE,
            timestamp,
            Some(unit.id.clone()),
            predict_equipment_failure(unit),
        )?;
        appended += 1;
    }

    debug!(records = appended, "Sampled predictions");
    Ok(appended)
}

/// Sample from a snapshot (external call site).
pub fn sample_snapshot(snapshot: &TwinSnapshot, monitor: &SharedMonitor) -> Result<usize, MonitorError> {
    sample_into(
        &snapshot.batches,
        &snapshot.equipment_telemetry,
        snapshot.timestamp,
        monitor,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EquipmentConfig;
    use crate::monitor::ModelMonitor;
    use crate::twin::state::{seed_equipment, TwinState};
    use crate::types::BatchStatus;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn batch_at_target() -> BatchState {
        let mut rng = StdRng::seed_from_u64(3);
        let mut state = TwinState::new(Utc::now(), 0);
        let (product, eq) = crate::twin::state::seed_products().remove(0);
        let mut batch = state.spawn_batch(product, eq, Utc::now(), 10.0, &mut rng);
        for parameter in CppParameter::ALL {
            let reading = batch.parameters.get_mut(parameter);
            reading.current = reading.target;
        }
        assert_eq!(batch.status, BatchStatus::Running);
        batch
    }

    #[test]
    fn test_quality_all_at_target() {
        let p = predict_quality(&batch_at_target());
        assert!((p.probability - 0.95).abs() < 1e-12);
        assert_eq!(p.label, 1);
        assert_eq!(p.features.get("compliance"), Some(&1.0));
    }

    #[test]
    fn test_quality_one_out_of_spec() {
        let mut batch = batch_at_target();
        batch.parameters.temperature.current = batch.bounds.temperature.max + 1.0;
        let p = predict_quality(&batch);
        assert!((p.probability - (0.05 + 0.9 * 0.75)).abs() < 1e-12);
        assert_eq!(p.label, 0);
    }

    #[test]
    fn test_deviation_risk_volume_only_affects_label() {
        let mut batch = batch_at_target();
        batch.parameters.volume.current = batch.bounds.volume.max + 50.0;
        let p = predict_deviation_risk(&batch);
        assert!(p.probability.abs() < 1e-12);
        assert_eq!(p.label, 1);
    }

    #[test]
    fn test_deviation_risk_scales_and_clamps() {
        let mut batch = batch_at_target();
        // API-101 temperature bounds [60, 70]: midpoint 65, half-range 5
        batch.parameters.temperature.current = 67.5;
        let p = predict_deviation_risk(&batch);
        assert!((p.probability - 0.25).abs() < 1e-12);
        assert_eq!(p.label, 0);

        batch.parameters.temperature.current = 200.0;
        let p = predict_deviation_risk(&batch);
        assert!((p.probability - 1.0).abs() < 1e-12);
        assert_eq!(p.label, 1);
    }

    #[test]
    fn test_equipment_failure_score() {
        let mut unit = seed_equipment(&EquipmentConfig::default()).remove(0);
        unit.vibration_rms = 3.0;
        unit.temperature_variance = 0.3;
        unit.alert_active = false;
        let p = predict_equipment_failure(&unit);
        assert!((p.probability - (0.6 * 0.5 + 0.3 * 0.5)).abs() < 1e-12);
        assert_eq!(p.label, 0);

        unit.vibration_rms = 6.5;
        unit.temperature_variance = 0.8;
        unit.alert_active = true;
        let p = predict_equipment_failure(&unit);
        assert!((p.probability - 1.0).abs() < 1e-12);
        assert_eq!(p.label, 1);
    }

    #[test]
    fn test_sample_into_appends_per_model() {
        let monitor = ModelMonitor::shared();
        let batches = vec![batch_at_target(), batch_at_target()];
        let equipment = seed_equipment(&EquipmentConfig::default());

        let n = sample_into(&batches, &equipment, Utc::now(), &monitor).unwrap();
        assert_eq!(n, 2 * 2 + equipment.len());

        let ledger = monitor.read().unwrap();
        assert_eq!(ledger.records(defaults::MODEL_QUALITY).len(), 2);
        assert_eq!(ledger.records(defaults::MODEL_DEVIATION_RISK).len(), 2);
        assert_eq!(ledger.records(defaults::MODEL_EQUIPMENT_FAILURE).len(), equipment.len());
        assert_eq!(
            ledger.records(defaults::MODEL_QUALITY)[0].subject.as_deref(),
            Some(batches[0].id.as_str())
        );
    }
}
