//! Twin Configuration - simulation, detector and monitor tuning as TOML values
//!
//! Each struct implements `Default` with the built-in constants, so a missing
//! config file changes nothing.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use super::defaults;

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one twin instance.
///
/// Load with `TwinConfig::load()` which searches:
/// 1. `$PHARMA_TWIN_CONFIG` env var
/// 2. `./twin_config.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TwinConfig {
    #[serde(default)]
    pub simulation: SimulationConfig,

    #[serde(default)]
    pub process: ProcessConfig,

    #[serde(default)]
    pub equipment: EquipmentConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl TwinConfig {
    /// Load configuration using the standard search order.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(defaults::CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded twin config from {}", defaults::CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load twin config, falling back");
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", defaults::CONFIG_ENV_VAR);
            }
        }

        let local = PathBuf::from(defaults::LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded twin config from ./{}", defaults::LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", defaults::LOCAL_CONFIG_FILE);
                }
            }
        }

        info!("No twin config found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(path.display().to_string(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse("<inline>".to_string(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate all values for internal consistency. Collects every problem
    /// rather than stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        let s = &self.simulation;
        if s.tick_ms == 0 {
            errors.push("simulation.tick_ms must be > 0".to_string());
        }
        check_positive(s.sim_seconds_per_tick, "simulation.sim_seconds_per_tick", &mut errors);
        check_positive(
            s.monitor_every_sim_seconds,
            "simulation.monitor_every_sim_seconds",
            &mut errors,
        );

        let p = &self.process;
        for (name, drift) in [
            ("process.temperature", &p.temperature),
            ("process.pressure", &p.pressure),
            ("process.ph", &p.ph),
            ("process.volume", &p.volume),
        ] {
            check_positive(drift.k, &format!("{name}.k"), &mut errors);
            check_non_negative(drift.sigma, &format!("{name}.sigma"), &mut errors);
        }
        check_probability(p.shock_probability, "process.shock_probability", &mut errors);
        check_probability(p.recovery_probability, "process.recovery_probability", &mut errors);
        check_range(
            p.shock_min_fraction,
            p.shock_max_fraction,
            "process.shock_fraction",
            &mut errors,
        );
        check_range(
            p.progress_rate_min,
            p.progress_rate_max,
            "process.progress_rate",
            &mut errors,
        );
        // Progress only moves forward
        check_positive(p.progress_rate_min, "process.progress_rate_min", &mut errors);
        check_non_negative(p.shock_min_fraction, "process.shock_min_fraction", &mut errors);
        if p.warning_ticks_min > p.warning_ticks_max {
            errors.push(format!(
                "process.warning_ticks_min ({}) must be <= warning_ticks_max ({})",
                p.warning_ticks_min, p.warning_ticks_max
            ));
        }
        if !(0.0..100.0).contains(&p.restart_progress_max) {
            errors.push(format!(
                "process.restart_progress_max ({}) must be in [0, 100)",
                p.restart_progress_max
            ));
        }

        let e = &self.equipment;
        check_probability(e.alert_probability, "equipment.alert_probability", &mut errors);
        if e.alert_ticks_min == 0 || e.alert_ticks_min > e.alert_ticks_max {
            errors.push(format!(
                "equipment.alert_ticks must satisfy 0 < min ({}) <= max ({})",
                e.alert_ticks_min, e.alert_ticks_max
            ));
        }
        check_positive(e.rms_reversion, "equipment.rms_reversion", &mut errors);
        check_positive(e.variance_reversion, "equipment.variance_reversion", &mut errors);
        for (name, value) in [
            ("equipment.standard_rms_baseline", e.standard_rms_baseline),
            ("equipment.high_rms_baseline", e.high_rms_baseline),
            ("equipment.standard_variance_baseline", e.standard_variance_baseline),
            ("equipment.high_variance_baseline", e.high_variance_baseline),
        ] {
            check_positive(value, name, &mut errors);
        }
        for (name, value) in [
            ("equipment.rms_sigma", e.rms_sigma),
            ("equipment.alert_rms_sigma", e.alert_rms_sigma),
            ("equipment.variance_sigma", e.variance_sigma),
            ("equipment.alert_rms_elevation", e.alert_rms_elevation),
            ("equipment.alert_variance_elevation", e.alert_variance_elevation),
        ] {
            check_non_negative(value, name, &mut errors);
        }

        let d = &self.detector;
        check_probability(d.oot_band_fraction, "detector.oot_band_fraction", &mut errors);
        check_probability(d.oot_min_step_fraction, "detector.oot_min_step_fraction", &mut errors);
        if d.oot_streak == 0 {
            errors.push("detector.oot_streak must be > 0".to_string());
        }
        if d.oos_high_fraction >= d.oos_critical_fraction {
            errors.push(format!(
                "detector.oos_high_fraction ({:.2}) must be < oos_critical_fraction ({:.2})",
                d.oos_high_fraction, d.oos_critical_fraction
            ));
        }

        let m = &self.monitor;
        check_probability(m.threshold, "monitor.threshold", &mut errors);
        if m.bins == 0 {
            errors.push("monitor.bins must be > 0".to_string());
        }

        // Sweep for NaN/Inf that slipped through range checks
        if let Ok(s) = toml::to_string(self) {
            if s.contains("nan") || s.contains("inf") {
                errors.push("Config contains NaN or Inf values".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

fn check_positive(value: f64, name: &str, errors: &mut Vec<String>) {
    if !value.is_finite() || value <= 0.0 {
        errors.push(format!("{name} must be a finite value > 0 (got {value})"));
    }
}

fn check_non_negative(value: f64, name: &str, errors: &mut Vec<String>) {
    if !value.is_finite() || value < 0.0 {
        errors.push(format!("{name} must be a finite value >= 0 (got {value})"));
    }
}

fn check_probability(value: f64, name: &str, errors: &mut Vec<String>) {
    if !(0.0..=1.0).contains(&value) {
        errors.push(format!("{name} must be in [0, 1] (got {value})"));
    }
}

fn check_range(min: f64, max: f64, name: &str, errors: &mut Vec<String>) {
    if !min.is_finite() || !max.is_finite() {
        errors.push(format!("{name}: values must be finite (got min={min}, max={max})"));
        return;
    }
    if min > max {
        errors.push(format!("{name}: min ({min:.3}) must be <= max ({max:.3})"));
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error ({0}): {1}")]
    Io(String, std::io::Error),

    #[error("Config parse error ({0}): {1}")]
    Parse(String, toml::de::Error),

    #[error("Config serialization error: {0}")]
    Serialize(toml::ser::Error),

    #[error("Config validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

// ============================================================================
// Simulation
// ============================================================================

/// Loop timing. `sim_seconds_per_tick` is independent of `tick_ms` and can be
/// changed at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub tick_ms: u64,
    pub sim_seconds_per_tick: f64,
    pub monitor_every_sim_seconds: f64,
    /// Fixed RNG seed for replayable runs; entropy when unset.
    pub seed: Option<u64>,
    pub completed_history: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_ms: defaults::TICK_MS,
            sim_seconds_per_tick: defaults::SIM_SECONDS_PER_TICK,
            monitor_every_sim_seconds: defaults::MONITOR_EVERY_SIM_SECONDS,
            seed: None,
            completed_history: defaults::COMPLETED_HISTORY,
        }
    }
}

// ============================================================================
// Process (batch CPP dynamics)
// ============================================================================

/// Mean-reversion strength `k` (per simulated minute) and noise `sigma`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftParams {
    pub k: f64,
    pub sigma: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub temperature: DriftParams,
    pub pressure: DriftParams,
    pub ph: DriftParams,
    pub volume: DriftParams,
    /// Per-tick probability of a transient shock on one batch.
    pub shock_probability: f64,
    /// Shock magnitude as a fraction of the parameter's half-range.
    pub shock_min_fraction: f64,
    pub shock_max_fraction: f64,
    /// Ticks a shocked batch stays in warning before it may recover.
    pub warning_ticks_min: u32,
    pub warning_ticks_max: u32,
    /// Per-tick recovery probability once the warning counter hits zero.
    pub recovery_probability: f64,
    /// Progress gained per simulated hour, in percent.
    pub progress_rate_min: f64,
    pub progress_rate_max: f64,
    /// Replacement batches start with progress in `[0, restart_progress_max)`.
    pub restart_progress_max: f64,
}

impl ProcessConfig {
    pub fn drift(&self, parameter: crate::types::CppParameter) -> DriftParams {
        use crate::types::CppParameter;
        match parameter {
            CppParameter::Temperature => self.temperature,
            CppParameter::Pressure => self.pressure,
            CppParameter::Ph => self.ph,
            CppParameter::Volume => self.volume,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            temperature: DriftParams { k: 0.35, sigma: 0.5 },
            pressure: DriftParams { k: 0.4, sigma: 0.04 },
            ph: DriftParams { k: 0.3, sigma: 0.04 },
            volume: DriftParams { k: 0.25, sigma: 3.0 },
            shock_probability: 0.006,
            shock_min_fraction: 0.5,
            shock_max_fraction: 1.3,
            warning_ticks_min: 2,
            warning_ticks_max: 5,
            recovery_probability: 0.05,
            progress_rate_min: 0.5,
            progress_rate_max: 1.3,
            restart_progress_max: 5.0,
        }
    }
}

// ============================================================================
// Equipment
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquipmentConfig {
    /// Per-tick alert injection probability while no alert is active.
    pub alert_probability: f64,
    /// Ticks an alert stays active before clearing.
    pub alert_ticks_min: u32,
    pub alert_ticks_max: u32,
    pub standard_rms_baseline: f64,
    pub high_rms_baseline: f64,
    pub standard_variance_baseline: f64,
    pub high_variance_baseline: f64,
    pub rms_reversion: f64,
    pub rms_sigma: f64,
    pub alert_rms_elevation: f64,
    pub alert_rms_sigma: f64,
    pub variance_reversion: f64,
    pub variance_sigma: f64,
    pub alert_variance_elevation: f64,
}

impl Default for EquipmentConfig {
    fn default() -> Self {
        Self {
            alert_probability: 0.01,
            alert_ticks_min: 3,
            alert_ticks_max: 6,
            standard_rms_baseline: 1.6,
            high_rms_baseline: 2.4,
            standard_variance_baseline: 0.15,
            high_variance_baseline: 0.25,
            rms_reversion: 0.5,
            rms_sigma: 0.12,
            alert_rms_elevation: 2.5,
            alert_rms_sigma: 0.6,
            variance_reversion: 0.4,
            variance_sigma: 0.02,
            alert_variance_elevation: 0.25,
        }
    }
}

// ============================================================================
// Detector
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// OOT observations only qualify beyond this fraction of half-range from target.
    pub oot_band_fraction: f64,
    /// Minimum step, as a fraction of the full range, for an observation to count.
    pub oot_min_step_fraction: f64,
    /// Consecutive qualifying observations required to fire OOT.
    pub oot_streak: u32,
    /// OOT severity is high above this fraction of half-range, medium otherwise.
    pub oot_high_ratio: f64,
    /// OOS exceedance (fraction of range beyond the bound) for critical severity.
    pub oos_critical_fraction: f64,
    /// OOS exceedance for high severity.
    pub oos_high_fraction: f64,
    /// Seed for deviation/suggestion id suffixes; entropy when unset.
    pub id_seed: Option<u64>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            oot_band_fraction: 0.4,
            oot_min_step_fraction: 0.02,
            oot_streak: 3,
            oot_high_ratio: 0.6,
            oos_critical_fraction: 0.75,
            oos_high_fraction: 0.5,
            id_seed: None,
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Defaults for `ModelMonitor::metrics` options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub threshold: f64,
    pub min_n: usize,
    pub bins: usize,
    pub require_both_classes: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_n: 0,
            bins: 5,
            require_both_classes: false,
        }
    }
}
