//! System-wide default constants.
//!
//! Centralises magic numbers used by the simulation, detector and monitor.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Configuration loading
// ============================================================================

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "PHARMA_TWIN_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "twin_config.toml";

// ============================================================================
// Simulation loop
// ============================================================================

/// Real-time interval between ticks (ms).
pub const TICK_MS: u64 = 1_000;

/// Simulated seconds advanced per tick.
pub const SIM_SECONDS_PER_TICK: f64 = 60.0;

/// Simulated seconds between prediction samples.
pub const MONITOR_EVERY_SIM_SECONDS: f64 = 600.0;

/// Completed-batch summaries retained in memory.
pub const COMPLETED_HISTORY: usize = 20;

// ============================================================================
// Equipment telemetry clamps
// ============================================================================

pub const VIBRATION_RMS_MIN: f64 = 0.5;
pub const VIBRATION_RMS_MAX: f64 = 6.5;

pub const TEMPERATURE_VARIANCE_MIN: f64 = 0.05;
pub const TEMPERATURE_VARIANCE_MAX: f64 = 0.8;

// ============================================================================
// Prediction functions
// ============================================================================

/// RMS that maps to a normalized vibration feature of 1.0.
pub const RMS_NORMALIZER: f64 = 6.0;

/// Temperature variance that maps to a normalized variance feature of 1.0.
pub const VARIANCE_NORMALIZER: f64 = 0.6;

/// Model ids recorded by periodic sampling.
pub const MODEL_QUALITY: &str = "quality";
pub const MODEL_DEVIATION_RISK: &str = "deviation_risk";
pub const MODEL_EQUIPMENT_FAILURE: &str = "equipment_failure";

// ============================================================================
// Identifiers
// ============================================================================

pub const BATCH_ID_PREFIX: &str = "BTH";
pub const DEVIATION_ID_PREFIX: &str = "DEV";
pub const SUGGESTION_ID_PREFIX: &str = "AUT";
pub const PREDICTION_ID_PREFIX: &str = "PRD";

// ============================================================================
// Proposal bus / storage
// ============================================================================

/// Broadcast capacity of the proposal bus. Lagging receivers drop the oldest.
pub const PROPOSAL_BUS_CAPACITY: usize = 256;

/// Key under which the prediction ledger is persisted.
pub const LEDGER_STORE_KEY: &str = "monitor/ledger";
