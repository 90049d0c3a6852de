//! Twin Configuration Module
//!
//! Per-deployment configuration loaded from TOML, replacing hardcoded
//! simulation, detector and monitor constants with operator-tunable values.
//!
//! ## Loading Order
//!
//! 1. `PHARMA_TWIN_CONFIG` environment variable (path to TOML file)
//! 2. `twin_config.toml` in the current working directory
//! 3. Built-in defaults
//!
//! The loaded `TwinConfig` is owned by the composition root and passed to
//! each component's constructor.

mod twin_config;
pub mod defaults;

pub use twin_config::*;
