//! Calibration and discrimination metrics over a prediction ledger.
//!
//! Provides:
//! - Accuracy at a threshold
//! - Brier score
//! - Expected Calibration Error (equal-width bins)
//! - AUROC via the rank-sum statistic
//!
//! Degenerate inputs (empty ledger, one class only) yield sentinel values,
//! never errors or NaN.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::cmp::Ordering;

use crate::config::MonitorConfig;
use crate::types::PredictionRecord;

/// Query options for [`super::ModelMonitor::metrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsOptions {
    /// Probability at or above which a prediction counts as positive.
    pub threshold: f64,
    /// Accuracy is omitted below this many records.
    pub min_n: usize,
    /// Number of equal-width ECE bins over [0, 1].
    pub bins: usize,
    /// Omit accuracy unless both outcome classes are present.
    pub require_both_classes: bool,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

impl From<&MonitorConfig> for MetricsOptions {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            threshold: config.threshold,
            min_n: config.min_n,
            bins: config.bins,
            require_both_classes: config.require_both_classes,
        }
    }
}

/// One reliability-diagram bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    /// Mean predicted probability (0 for empty bins).
    pub mean_probability: f64,
    /// Observed positive rate (0 for empty bins).
    pub observed_rate: f64,
}

/// Metrics for one model, recomputed from the full ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub model_id: String,
    pub n: usize,
    pub positives: usize,
    pub negatives: usize,
    /// `None` when omitted by `min_n` or `require_both_classes`.
    pub accuracy: Option<f64>,
    pub brier: f64,
    pub ece: f64,
    /// 0 when either class is empty.
    pub auroc: f64,
    pub bins: Vec<CalibrationBin>,
}

/// Compute all metrics for one model's records.
pub fn compute(model_id: &str, records: &[PredictionRecord], opts: &MetricsOptions) -> ModelMetrics {
    let n = records.len();
    let positives = records.iter().filter(|r| r.outcome == 1).count();
    let negatives = n - positives;

    let omit_accuracy =
        n < opts.min_n || (opts.require_both_classes && (positives == 0 || negatives == 0));
    let accuracy = if omit_accuracy {
        None
    } else {
        Some(accuracy(records, opts.threshold))
    };

    let bins = reliability_bins(records, opts.bins);

    ModelMetrics {
        model_id: model_id.to_string(),
        n,
        positives,
        negatives,
        accuracy,
        brier: brier_score(records),
        ece: expected_calibration_error(&bins, n),
        auroc: auroc(records),
        bins,
    }
}

fn outcome(record: &PredictionRecord) -> f64 {
    if record.outcome == 1 {
        1.0
    } else {
        0.0
    }
}

/// Fraction of records whose thresholded prediction matches the outcome.
/// 0 for an empty ledger.
pub fn accuracy(records: &[PredictionRecord], threshold: f64) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    let correct = records
        .iter()
        .filter(|r| u8::from(r.probability >= threshold) == r.outcome)
        .count();
    correct as f64 / records.len() as f64
}

/// Mean squared error between probability and outcome.
pub fn brier_score(records: &[PredictionRecord]) -> f64 {
    if records.is_empty() {
        return 0.0;
    }
    records
        .iter()
        .map(|r| (r.probability - outcome(r)).powi(2))
        .mean()
}

/// Equal-width bins over [0, 1]; p = 1.0 falls in the last bin.
pub fn reliability_bins(records: &[PredictionRecord], num_bins: usize) -> Vec<CalibrationBin> {
    if num_bins == 0 {
        return Vec::new();
    }
    let width = 1.0 / num_bins as f64;
    let mut sums = vec![(0usize, 0.0f64, 0.0f64); num_bins];

    for r in records {
        let idx = ((r.probability * num_bins as f64) as usize).min(num_bins - 1);
        let slot = &mut sums[idx];
        slot.0 += 1;
        slot.1 += r.probability;
        slot.2 += outcome(r);
    }

    sums.into_iter()
        .enumerate()
        .map(|(i, (count, sum_p, sum_y))| {
            let (mean_probability, observed_rate) = if count == 0 {
                (0.0, 0.0)
            } else {
                (sum_p / count as f64, sum_y / count as f64)
            };
            CalibrationBin {
                lower: i as f64 * width,
                upper: (i + 1) as f64 * width,
                count,
                mean_probability,
                observed_rate,
            }
        })
        .collect()
}

/// Sum over non-empty bins of `(count / n) * |mean_p - mean_y|`.
pub fn expected_calibration_error(bins: &[CalibrationBin], n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    bins.iter()
        .filter(|b| b.count > 0)
        .map(|b| (b.count as f64 / n as f64) * (b.mean_probability - b.observed_rate).abs())
        .sum()
}

/// Rank-sum AUROC with average ranks for ties.
pub fn auroc(records: &[PredictionRecord]) -> f64 {
    let n_pos = records.iter().filter(|r| r.outcome == 1).count();
    let n_neg = records.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return 0.0;
    }

    let mut sorted: Vec<(f64, u8)> = records.iter().map(|r| (r.probability, r.outcome)).collect();
    sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    let mut sum_pos_ranks = 0.0;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j + 1 < sorted.len() && sorted[j + 1].0 == sorted[i].0 {
            j += 1;
        }
        // Ranks are 1-based; tied group i..=j shares the mean rank
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        let tied_pos = sorted[i..=j].iter().filter(|(_, y)| *y == 1).count();
        sum_pos_ranks += avg_rank * tied_pos as f64;
        i = j + 1;
    }

    let n_pos_f = n_pos as f64;
    (sum_pos_ranks - n_pos_f * (n_pos_f + 1.0) / 2.0) / (n_pos_f * n_neg as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ledger(pairs: &[(f64, u8)]) -> Vec<PredictionRecord> {
        pairs
            .iter()
            .enumerate()
            .map(|(i, (p, y))| PredictionRecord {
                id: format!("r{i}"),
                model_id: "m".to_string(),
                timestamp: Utc::now(),
                subject: None,
                probability: *p,
                outcome: *y,
                features: Default::default(),
            })
            .collect()
    }

    #[test]
    fn test_auroc_invariant_to_monotone_rescaling() {
        let a = ledger(&[(0.1, 0), (0.4, 1), (0.9, 1)]);
        let b = ledger(&[(0.01, 0), (0.2, 1), (0.99, 1)]);
        assert!((auroc(&a) - 1.0).abs() < 1e-12);
        assert!((auroc(&b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_auroc_ties_and_inversions() {
        // All tied: chance level
        let tied = ledger(&[(0.5, 0), (0.5, 1), (0.5, 0), (0.5, 1)]);
        assert!((auroc(&tied) - 0.5).abs() < 1e-12);

        // Perfectly inverted ranking
        let inverted = ledger(&[(0.9, 0), (0.1, 1)]);
        assert!(auroc(&inverted).abs() < 1e-12);
    }

    #[test]
    fn test_auroc_single_class_is_zero() {
        assert_eq!(auroc(&ledger(&[(0.2, 1), (0.8, 1)])), 0.0);
        assert_eq!(auroc(&[]), 0.0);
    }

    #[test]
    fn test_ece_zero_on_calibrated_ledger() {
        // Bin [0.2, 0.4): p = 0.25, 1 of 4 positive. Bin [0.6, 0.8): p = 0.75, 3 of 4.
        let records = ledger(&[
            (0.25, 1),
            (0.25, 0),
            (0.25, 0),
            (0.25, 0),
            (0.75, 1),
            (0.75, 1),
            (0.75, 1),
            (0.75, 0),
        ]);
        let bins = reliability_bins(&records, 5);
        assert!(expected_calibration_error(&bins, records.len()).abs() < 1e-12);
    }

    #[test]
    fn test_probability_one_lands_in_last_bin() {
        let bins = reliability_bins(&ledger(&[(1.0, 1)]), 5);
        assert_eq!(bins[4].count, 1);
        assert!((bins[4].upper - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_brier_score() {
        let records = ledger(&[(1.0, 1), (0.0, 0), (0.5, 1)]);
        assert!((brier_score(&records) - 0.25 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_ledger_defaults() {
        let m = compute("quality", &[], &MetricsOptions::default());
        assert_eq!(m.n, 0);
        assert_eq!(m.accuracy, Some(0.0));
        assert_eq!(m.brier, 0.0);
        assert_eq!(m.ece, 0.0);
        assert_eq!(m.auroc, 0.0);
        assert_eq!(m.bins.len(), 5);
        assert!(m.bins.iter().all(|b| b.count == 0));
    }

    #[test]
    fn test_accuracy_omission_rules() {
        let one_class = ledger(&[(0.9, 1), (0.8, 1)]);
        let opts = MetricsOptions {
            require_both_classes: true,
            ..MetricsOptions::default()
        };
        assert_eq!(compute("m", &one_class, &opts).accuracy, None);

        let opts = MetricsOptions {
            min_n: 3,
            ..MetricsOptions::default()
        };
        assert_eq!(compute("m", &one_class, &opts).accuracy, None);

        let m = compute("m", &ledger(&[(0.9, 1), (0.2, 1)]), &MetricsOptions::default());
        assert_eq!(m.accuracy, Some(0.5));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let records = ledger(&[(0.5, 1)]);
        assert!((accuracy(&records, 0.5) - 1.0).abs() < 1e-12);
    }
}
