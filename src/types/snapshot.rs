//! Immutable point-in-time copy of the twin state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BatchState, CompletedBatch, EquipmentTelemetryState};

/// Deep copy of the twin state handed to subscribers.
///
/// Subscribers receive `&TwinSnapshot`; the simulation never shares its live
/// state, so a snapshot cannot be used to mutate the twin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TwinSnapshot {
    /// Simulated time at the end of the tick.
    pub timestamp: DateTime<Utc>,
    /// Monotonic tick counter.
    pub tick: u64,
    pub batches: Vec<BatchState>,
    pub equipment_telemetry: Vec<EquipmentTelemetryState>,
    /// Most recent completions, oldest first.
    #[serde(default)]
    pub recently_completed: Vec<CompletedBatch>,
}

impl TwinSnapshot {
    pub fn batch(&self, id: &str) -> Option<&BatchState> {
        self.batches.iter().find(|b| b.id == id)
    }

    pub fn equipment(&self, id: &str) -> Option<&EquipmentTelemetryState> {
        self.equipment_telemetry.iter().find(|e| e.id == id)
    }
}
