//! Batch types: CppParameter, CppReading, CppBounds, BatchStatus, TimelineEntry,
//! BatchState, ProductTemplate, CompletedBatch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Critical Process Parameters
// ============================================================================

/// The four critical process parameters tracked on every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CppParameter {
    Temperature,
    Pressure,
    Ph,
    Volume,
}

impl CppParameter {
    /// All parameters in canonical order.
    pub const ALL: [CppParameter; 4] = [
        CppParameter::Temperature,
        CppParameter::Pressure,
        CppParameter::Ph,
        CppParameter::Volume,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CppParameter::Temperature => "temperature",
            CppParameter::Pressure => "pressure",
            CppParameter::Ph => "ph",
            CppParameter::Volume => "volume",
        }
    }

    /// Human-readable label used in deviation titles.
    pub fn label(&self) -> &'static str {
        match self {
            CppParameter::Temperature => "Temperature",
            CppParameter::Pressure => "Pressure",
            CppParameter::Ph => "pH",
            CppParameter::Volume => "Volume",
        }
    }
}

impl std::fmt::Display for CppParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live reading for one CPP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CppReading {
    pub current: f64,
    pub target: f64,
    pub unit: String,
}

/// Acceptable range for one CPP (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CppBounds {
    pub min: f64,
    pub max: f64,
}

impl CppBounds {
    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    pub fn half_range(&self) -> f64 {
        self.range() / 2.0
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }

    /// Inclusive containment; NaN is never within bounds.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Readings for all four CPPs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CppSet {
    pub temperature: CppReading,
    pub pressure: CppReading,
    pub ph: CppReading,
    pub volume: CppReading,
}

impl CppSet {
    pub fn get(&self, parameter: CppParameter) -> &CppReading {
        match parameter {
            CppParameter::Temperature => &self.temperature,
            CppParameter::Pressure => &self.pressure,
            CppParameter::Ph => &self.ph,
            CppParameter::Volume => &self.volume,
        }
    }

    pub fn get_mut(&mut self, parameter: CppParameter) -> &mut CppReading {
        match parameter {
            CppParameter::Temperature => &mut self.temperature,
            CppParameter::Pressure => &mut self.pressure,
            CppParameter::Ph => &mut self.ph,
            CppParameter::Volume => &mut self.volume,
        }
    }
}

/// Bounds for all four CPPs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CppBoundSet {
    pub temperature: CppBounds,
    pub pressure: CppBounds,
    pub ph: CppBounds,
    pub volume: CppBounds,
}

impl CppBoundSet {
    pub fn get(&self, parameter: CppParameter) -> CppBounds {
        match parameter {
            CppParameter::Temperature => self.temperature,
            CppParameter::Pressure => self.pressure,
            CppParameter::Ph => self.ph,
            CppParameter::Volume => self.volume,
        }
    }
}

// ============================================================================
// Batch lifecycle
// ============================================================================

/// Batch status. `Error` is reserved and never driven by the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Warning,
    Complete,
    Error,
}

impl BatchStatus {
    /// Whether progress still advances in this status.
    pub fn is_active(&self) -> bool {
        matches!(self, BatchStatus::Running | BatchStatus::Warning)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Running => write!(f, "RUNNING"),
            BatchStatus::Warning => write!(f, "WARNING"),
            BatchStatus::Complete => write!(f, "COMPLETE"),
            BatchStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// One stage of a batch's manufacturing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub stage: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the stage is active.
    pub ended_at: Option<DateTime<Utc>>,
}

impl TimelineEntry {
    pub fn open(stage: &str, at: DateTime<Utc>) -> Self {
        Self {
            stage: stage.to_string(),
            started_at: at,
            ended_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Product metadata and recipe shared by every batch of that product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductTemplate {
    pub product_code: String,
    pub product_name: String,
    /// Ordered manufacturing stages; progress is split evenly across them.
    pub stages: Vec<String>,
    /// Target values for the four CPPs.
    pub targets: CppSet,
    pub bounds: CppBoundSet,
}

impl ProductTemplate {
    /// Stage name for a given progress percentage.
    pub fn stage_for(&self, progress: f64) -> &str {
        if self.stages.is_empty() {
            return "";
        }
        let n = self.stages.len();
        let idx = ((progress / 100.0) * n as f64).floor().max(0.0) as usize;
        &self.stages[idx.min(n - 1)]
    }
}

/// Live state of one production batch.
///
/// Mutated only by the simulation inside a tick; everything else sees clones
/// inside a [`super::TwinSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub id: String,
    pub product: ProductTemplate,
    pub stage: String,
    /// Percent complete, 0..=100. Non-decreasing within one batch life.
    pub progress: f64,
    pub status: BatchStatus,
    pub started_at: DateTime<Utc>,
    pub equipment_ids: Vec<String>,
    pub parameters: CppSet,
    pub bounds: CppBoundSet,
    pub timeline: Vec<TimelineEntry>,
    /// Ticks left before a warning batch becomes eligible for recovery.
    #[serde(default)]
    pub warning_ticks_remaining: u32,
}

impl BatchState {
    /// Whether a CPP is currently within its bounds.
    pub fn in_spec(&self, parameter: CppParameter) -> bool {
        self.bounds
            .get(parameter)
            .contains(self.parameters.get(parameter).current)
    }

    /// Number of CPPs within bounds.
    pub fn in_spec_count(&self) -> usize {
        CppParameter::ALL.iter().filter(|p| self.in_spec(**p)).count()
    }

    pub fn active_timeline_entry_mut(&mut self) -> Option<&mut TimelineEntry> {
        self.timeline.iter_mut().rev().find(|e| e.is_active())
    }
}

/// Summary retained after a batch completes and is replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedBatch {
    pub id: String,
    pub product_code: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Status the batch held on the tick it reached 100%.
    pub final_status: BatchStatus,
    pub replaced_by: String,
}
