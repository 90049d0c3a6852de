//! Prediction types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named feature values that produced a prediction. Kept verbatim for audit
/// and export.
pub type FeatureMap = BTreeMap<String, f64>;

/// Output of a prediction function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Predicted probability of the positive class, in [0, 1].
    pub probability: f64,
    /// Observed label for the same state (0 or 1).
    pub label: u8,
    pub features: FeatureMap,
}

/// One prediction/outcome pair in the monitor ledger. Never mutated once
/// appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: String,
    pub model_id: String,
    pub timestamp: DateTime<Utc>,
    /// Batch or equipment id the prediction was made for, when known.
    #[serde(default)]
    pub subject: Option<String>,
    pub probability: f64,
    pub outcome: u8,
    #[serde(default)]
    pub features: FeatureMap,
}

impl PredictionRecord {
    pub fn from_prediction(
        id: String,
        model_id: &str,
        timestamp: DateTime<Utc>,
        subject: Option<String>,
        prediction: Prediction,
    ) -> Self {
        Self {
            id,
            model_id: model_id.to_string(),
            timestamp,
            subject,
            probability: prediction.probability,
            outcome: prediction.label,
            features: prediction.features,
        }
    }
}
