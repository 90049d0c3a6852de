//! Equipment telemetry types

use serde::{Deserialize, Serialize};

/// Equipment class. Determines the vibration/variance baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentClass {
    Reactor,
    Filtration,
    Crystallization,
    Dryer,
    Granulator,
    TabletPress,
}

impl EquipmentClass {
    /// Filtration and crystallization run with a higher mechanical baseline.
    pub fn is_high_baseline(&self) -> bool {
        matches!(self, EquipmentClass::Filtration | EquipmentClass::Crystallization)
    }
}

/// Telemetry for one piece of equipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentTelemetryState {
    pub id: String,
    pub class: EquipmentClass,
    /// Vibration RMS (mm/s), kept within [0.5, 6.5].
    pub vibration_rms: f64,
    pub alert_active: bool,
    /// Ticks before an active alert may clear.
    #[serde(default)]
    pub alert_ticks_remaining: u32,
    /// Temperature variance (degC^2), kept within [0.05, 0.8].
    pub temperature_variance: f64,
    /// Cumulative uptime in hours.
    pub uptime_hours: f64,
}
