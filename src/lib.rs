//! Pharma Twin: process digital twin for batch manufacturing oversight
//!
//! Generates synthetic batch and equipment telemetry, watches critical process
//! parameters for out-of-spec and out-of-trend behaviour, and tracks how well
//! the predictive models consuming that telemetry are calibrated.
//!
//! ## Architecture
//!
//! - **Twin**: owned state, stochastic dynamics, timer-driven loop, snapshot subscriptions
//! - **Prediction**: stateless quality / deviation-risk / equipment-failure scoring
//! - **Monitor**: append-only prediction ledger with accuracy, Brier, ECE and AUROC
//! - **Detector**: OOS/OOT classification with hysteresis, proposals on a broadcast bus
//! - **Storage**: pluggable key-value backend for ledger persistence
//! - **Digest**: plain-text summary for the assistant

pub mod config;
pub mod detector;
pub mod digest;
pub mod monitor;
pub mod prediction;
pub mod storage;
pub mod twin;
pub mod types;

// Re-export configuration
pub use config::{ConfigError, TwinConfig};

// Re-export commonly used types
pub use types::{
    BatchState, BatchStatus, CppParameter, Deviation, EquipmentTelemetryState, PredictionRecord,
    ProposalEvent, TriggerKind, TwinSnapshot,
};

// Re-export twin components
pub use twin::{LoopOptions, SnapshotListener, TwinError, TwinLoop, TwinSimulation, TwinState};

// Re-export monitor, detector and storage
pub use detector::{AnomalyDetector, DetectorListener, ProposalBus, SharedDetector};
pub use monitor::{MetricsOptions, ModelMetrics, ModelMonitor, MonitorError, SharedMonitor};
pub use storage::{KeyValueStore, MemoryStore, SledStore, StorageError};
