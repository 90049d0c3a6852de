//! Deviation types: TriggerKind, DeviationSeverity, Compliance, Measurement,
//! Deviation, AutomationSuggestion, ProposalEvent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::CppParameter;

/// Which rule raised a deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
    /// Out of Specification: reading outside bounds.
    #[serde(rename = "OOS")]
    Oos,
    /// Out of Trend: in bounds but persistently drifting toward a bound.
    #[serde(rename = "OOT")]
    Oot,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerKind::Oos => write!(f, "OOS"),
            TriggerKind::Oot => write!(f, "OOT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationSeverity {
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for DeviationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviationSeverity::Medium => write!(f, "MEDIUM"),
            DeviationSeverity::High => write!(f, "HIGH"),
            DeviationSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Why a reading raised a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compliance {
    OutOfSpec,
    OutOfTrend,
}

/// The reading that raised a proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub target: f64,
    pub min: f64,
    pub max: f64,
    /// Signed distance from target (`value - target`).
    pub deviation: f64,
    pub compliance: Compliance,
}

/// Deviation record proposed for the external deviation store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deviation {
    pub id: String,
    pub batch_id: String,
    pub product_code: String,
    pub parameter: CppParameter,
    pub kind: TriggerKind,
    pub severity: DeviationSeverity,
    pub title: String,
    pub description: String,
    pub stage: String,
    pub detected_at: DateTime<Utc>,
}

/// Corrective action proposed alongside a deviation. Always requires
/// human approval downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationSuggestion {
    pub id: String,
    pub deviation_id: String,
    pub batch_id: String,
    pub parameter: CppParameter,
    pub action: String,
    pub rationale: String,
    /// Setpoint the action would restore.
    pub proposed_setpoint: f64,
    pub unit: String,
    /// Heuristic confidence in the suggestion (0.0-1.0).
    pub confidence: f64,
    pub requires_approval: bool,
    pub created_at: DateTime<Utc>,
}

/// Payload broadcast on the proposal bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalEvent {
    pub trigger: TriggerKind,
    pub batch_id: String,
    pub parameter: CppParameter,
    pub measurement: Measurement,
    pub deviation: Deviation,
    pub suggestion: AutomationSuggestion,
}
