//! Model monitor: append-only prediction ledger and metric queries.
//!
//! Records arrive from two call sites: periodic sampling inside the twin loop
//! and direct external calls. The monitor is shared as [`SharedMonitor`]
//! (`Arc<RwLock<_>>`) so both can append safely. Metrics are recomputed
//! from the full ledger on every query; retention is the caller's concern.

pub mod metrics;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::config::defaults;
use crate::storage::{KeyValueStore, StorageError};
use crate::types::{Prediction, PredictionRecord};

pub use metrics::{CalibrationBin, MetricsOptions, ModelMetrics};

/// Monitor shared between the twin loop and external callers.
pub type SharedMonitor = Arc<RwLock<ModelMonitor>>;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Probability must be finite and within [0, 1] (got {0})")]
    InvalidProbability(f64),

    #[error("Outcome must be 0 or 1 (got {0})")]
    InvalidOutcome(u8),

    #[error("Monitor lock poisoned")]
    Poisoned,

    #[error("Ledger persistence failed: {0}")]
    Storage(#[from] StorageError),
}

/// Serialized form of the ledger.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDocument {
    models: BTreeMap<String, Vec<PredictionRecord>>,
    next_seq: u64,
}

#[derive(Debug, Default)]
pub struct ModelMonitor {
    ledger: BTreeMap<String, Vec<PredictionRecord>>,
    next_seq: u64,
}

impl ModelMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedMonitor {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Append a record under `model`. The record's `model_id` is overwritten
    /// with `model`.
    pub fn record_prediction(&mut self, model: &str, mut record: PredictionRecord) -> Result<(), MonitorError> {
        if !record.probability.is_finite() || !(0.0..=1.0).contains(&record.probability) {
            return Err(MonitorError::InvalidProbability(record.probability));
        }
        if record.outcome > 1 {
            return Err(MonitorError::InvalidOutcome(record.outcome));
        }
        record.model_id = model.to_string();
        self.ledger.entry(model.to_string()).or_default().push(record);
        Ok(())
    }

    /// Append a prediction, generating the record id. Returns the id.
    pub fn record(
        &mut self,
        model: &str,
        timestamp: DateTime<Utc>,
        subject: Option<String>,
        prediction: Prediction,
    ) -> Result<String, MonitorError> {
        let id = format!(
            "{}-{}-{}",
            defaults::PREDICTION_ID_PREFIX,
            timestamp.timestamp_millis(),
            self.next_seq
        );
        let record = PredictionRecord::from_prediction(id.clone(), model, timestamp, subject, prediction);
        self.record_prediction(model, record)?;
        self.next_seq += 1;
        Ok(id)
    }

    /// Records for one model, oldest first.
    pub fn records(&self, model: &str) -> &[PredictionRecord] {
        self.ledger.get(model).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn model_ids(&self) -> Vec<&str> {
        self.ledger.keys().map(String::as_str).collect()
    }

    pub fn total_records(&self) -> usize {
        self.ledger.values().map(Vec::len).sum()
    }

    /// Metrics for one model. Unknown models yield the empty-ledger defaults.
    pub fn metrics(&self, model: &str, opts: &MetricsOptions) -> ModelMetrics {
        metrics::compute(model, self.records(model), opts)
    }

    /// Metrics for every model with at least one record, by model id.
    pub fn all_metrics(&self, opts: &MetricsOptions) -> Vec<ModelMetrics> {
        self.ledger
            .iter()
            .map(|(model, records)| metrics::compute(model, records, opts))
            .collect()
    }

    /// Write the whole ledger to `store` as one JSON document.
    pub fn save_to(&self, store: &dyn KeyValueStore) -> Result<(), MonitorError> {
        let doc = LedgerDocument {
            models: self.ledger.clone(),
            next_seq: self.next_seq,
        };
        let bytes = serde_json::to_vec(&doc).map_err(StorageError::from)?;
        store.put(defaults::LEDGER_STORE_KEY, &bytes)?;
        info!(
            backend = store.backend_name(),
            records = self.total_records(),
            "Prediction ledger saved"
        );
        Ok(())
    }

    /// Replace the ledger with the one in `store`. Returns the number of
    /// records loaded; 0 (and an untouched ledger) when nothing is stored.
    pub fn load_from(&mut self, store: &dyn KeyValueStore) -> Result<usize, MonitorError> {
        let Some(bytes) = store.get(defaults::LEDGER_STORE_KEY)? else {
            debug!(backend = store.backend_name(), "No stored prediction ledger");
            return Ok(0);
        };
        let doc: LedgerDocument = serde_json::from_slice(&bytes).map_err(StorageError::from)?;
        self.ledger = doc.models;
        self.next_seq = doc.next_seq;
        let loaded = self.total_records();
        info!(backend = store.backend_name(), records = loaded, "Prediction ledger restored");
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::FeatureMap;

    fn prediction(p: f64, label: u8) -> Prediction {
        let mut features = FeatureMap::new();
        features.insert("x".to_string(), p);
        Prediction {
            probability: p,
            label,
            features,
        }
    }

    #[test]
    fn test_record_validates_inputs() {
        let mut monitor = ModelMonitor::new();
        let now = Utc::now();
        assert!(matches!(
            monitor.record("m", now, None, prediction(1.2, 1)),
            Err(MonitorError::InvalidProbability(_))
        ));
        assert!(matches!(
            monitor.record("m", now, None, prediction(f64::NAN, 1)),
            Err(MonitorError::InvalidProbability(_))
        ));
        assert!(matches!(
            monitor.record("m", now, None, prediction(0.3, 2)),
            Err(MonitorError::InvalidOutcome(2))
        ));
        assert!(monitor.records("m").is_empty());
    }

    #[test]
    fn test_ledger_is_keyed_by_model() {
        let mut monitor = ModelMonitor::new();
        let now = Utc::now();
        let a = monitor.record("quality", now, Some("B1".into()), prediction(0.9, 1)).unwrap();
        let b = monitor.record("quality", now, None, prediction(0.1, 0)).unwrap();
        monitor.record("equipment_failure", now, None, prediction(0.2, 0)).unwrap();

        assert_ne!(a, b);
        assert_eq!(monitor.records("quality").len(), 2);
        assert_eq!(monitor.model_ids(), vec!["equipment_failure", "quality"]);
        assert_eq!(monitor.records("quality")[0].features.get("x"), Some(&0.9));

        let m = monitor.metrics("quality", &MetricsOptions::default());
        assert_eq!(m.n, 2);
        assert!((m.auroc - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_model_metrics_are_defined() {
        let monitor = ModelMonitor::new();
        let m = monitor.metrics("nope", &MetricsOptions::default());
        assert_eq!(m.n, 0);
        assert!(!m.brier.is_nan() && !m.ece.is_nan() && !m.auroc.is_nan());
    }

    #[test]
    fn test_ledger_round_trips_through_store() {
        let store = MemoryStore::new();
        let mut monitor = ModelMonitor::new();
        monitor.record("quality", Utc::now(), None, prediction(0.7, 1)).unwrap();
        monitor.save_to(&store).unwrap();

        let mut restored = ModelMonitor::new();
        assert_eq!(restored.load_from(&store).unwrap(), 1);
        assert_eq!(restored.records("quality"), monitor.records("quality"));

        // Sequence continues so ids stay unique after restore
        let id = restored.record("quality", Utc::now(), None, prediction(0.2, 0)).unwrap();
        assert!(id.ends_with("-1"));
    }

    #[test]
    fn test_load_from_empty_store_keeps_ledger() {
        let mut monitor = ModelMonitor::new();
        monitor.record("quality", Utc::now(), None, prediction(0.7, 1)).unwrap();
        assert_eq!(monitor.load_from(&MemoryStore::new()).unwrap(), 0);
        assert_eq!(monitor.total_records(), 1);
    }
}
