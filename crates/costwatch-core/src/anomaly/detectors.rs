//! Statistical anomaly detectors
//!
//! Each detector is an independent strategy over a daily cost series.
//! Detectors never deduplicate against each other; a point flagged by
//! two methods yields two candidates, and reconciling them is the alert
//! layer's concern.

use statistical::{mean, standard_deviation};

use crate::config::DetectionConfig;
use crate::models::anomaly::{AnomalyCandidate, DetectionMethod};
use crate::models::cost::DailySeries;

use super::isolation::IsolationForestDetector;

/// A pluggable detection method
pub trait Detector: Send + Sync {
    /// The method tag this detector writes on its candidates
    fn method(&self) -> DetectionMethod;

    /// Scan a series and emit zero or more candidates. A series shorter
    /// than the method's minimum sample count is a no-op, not an error.
    fn detect(&self, series: &DailySeries) -> Vec<AnomalyCandidate>;
}

/// Build the configured detector set
pub fn build_detectors(config: &DetectionConfig) -> Vec<Box<dyn Detector>> {
    config
        .methods
        .iter()
        .map(|method| -> Box<dyn Detector> {
            match method {
                DetectionMethod::ZScore => Box::new(ZScoreDetector {
                    k: config.zscore_k,
                    min_samples: config.min_samples,
                }),
                DetectionMethod::Iqr => Box::new(IqrDetector {
                    multiplier: config.iqr_multiplier,
                    min_samples: config.min_samples,
                }),
                DetectionMethod::MovingAvg => Box::new(MovingAvgDetector {
                    window: config.moving_avg_window,
                    threshold: config.moving_avg_threshold,
                    min_samples: config.min_samples,
                }),
                DetectionMethod::IsolationForest => Box::new(IsolationForestDetector {
                    trees: config.isolation_trees,
                    sample_size: config.isolation_sample,
                    score_threshold: config.isolation_score_threshold,
                    seed: config.isolation_seed,
                    min_samples: config.min_samples,
                }),
            }
        })
        .collect()
}

/// Build a candidate, skipping points whose baseline is zero: the
/// deviation percentage is undefined there.
pub(super) fn candidate(
    series_point: (chrono::NaiveDate, f64),
    method: DetectionMethod,
    expected: f64,
    score: f64,
    confidence: f64,
) -> Option<AnomalyCandidate> {
    let (date, actual) = series_point;
    if expected == 0.0 {
        return None;
    }
    Some(AnomalyCandidate {
        date,
        service: String::new(),
        method,
        expected_cost: expected,
        actual_cost: actual,
        deviation_percentage: (actual - expected) / expected * 100.0,
        score: score.clamp(0.0, 100.0),
        confidence: confidence.clamp(0.0, 1.0),
    })
}

/// Flags a point when its standard score against the trailing window
/// exceeds `k`
pub struct ZScoreDetector {
    /// Standard-score threshold
    pub k: f64,
    /// Minimum trailing samples, evaluated point included
    pub min_samples: usize,
}

impl Detector for ZScoreDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::ZScore
    }

    fn detect(&self, series: &DailySeries) -> Vec<AnomalyCandidate> {
        let points = series.points();
        let totals = series.totals();
        let mut candidates = Vec::new();

        for i in 0..points.len() {
            if i == 0 || i + 1 < self.min_samples {
                continue;
            }

            let baseline = &totals[..i];
            let x = totals[i];
            let baseline_mean = mean(baseline);
            let spread = if baseline.len() > 1 {
                standard_deviation(baseline, Some(baseline_mean))
            } else {
                0.0
            };

            // A flat baseline has no spread; any deviation from it is
            // maximally surprising rather than a division error.
            let z = if spread == 0.0 {
                if x == baseline_mean {
                    continue;
                }
                f64::INFINITY
            } else {
                (x - baseline_mean).abs() / spread
            };

            if z <= self.k {
                continue;
            }

            let score = (z / self.k - 1.0) * 100.0;
            let confidence = 1.0 - self.k / z;
            candidates.extend(candidate(
                (points[i].date, x),
                DetectionMethod::ZScore,
                baseline_mean,
                score,
                confidence,
            ));
        }

        candidates
    }
}

/// Flags a point outside the interquartile fences of the trailing window
pub struct IqrDetector {
    /// Fence multiplier (1.5 for the classic Tukey fences)
    pub multiplier: f64,
    /// Minimum trailing samples, evaluated point included
    pub min_samples: usize,
}

impl Detector for IqrDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::Iqr
    }

    fn detect(&self, series: &DailySeries) -> Vec<AnomalyCandidate> {
        let points = series.points();
        let totals = series.totals();
        let mut candidates = Vec::new();

        for i in 0..points.len() {
            if i == 0 || i + 1 < self.min_samples {
                continue;
            }

            let baseline = &totals[..i];
            let x = totals[i];

            let mut sorted = baseline.to_vec();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let q1 = quantile(&sorted, 0.25);
            let q3 = quantile(&sorted, 0.75);
            let iqr = q3 - q1;
            let lower = q1 - self.multiplier * iqr;
            let upper = q3 + self.multiplier * iqr;

            let excess = if x < lower {
                lower - x
            } else if x > upper {
                x - upper
            } else {
                continue;
            };

            let fence_span = self.multiplier * iqr;
            let ratio = if fence_span == 0.0 {
                f64::INFINITY
            } else {
                excess / fence_span
            };

            let expected = quantile(&sorted, 0.5);
            candidates.extend(candidate(
                (points[i].date, x),
                DetectionMethod::Iqr,
                expected,
                ratio * 50.0,
                ratio / 2.0,
            ));
        }

        candidates
    }
}

/// Linear-interpolation quantile over a sorted slice
fn quantile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let h = (sorted.len() - 1) as f64 * p;
    let low = h.floor() as usize;
    let high = h.ceil() as usize;
    sorted[low] + (h - low as f64) * (sorted[high] - sorted[low])
}

/// Flags a point deviating from the trailing simple moving average by
/// more than a relative threshold
pub struct MovingAvgDetector {
    /// Trailing window length
    pub window: usize,
    /// Relative deviation threshold (0.5 = 50%)
    pub threshold: f64,
    /// Minimum trailing samples, evaluated point included
    pub min_samples: usize,
}

impl Detector for MovingAvgDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::MovingAvg
    }

    fn detect(&self, series: &DailySeries) -> Vec<AnomalyCandidate> {
        let points = series.points();
        let totals = series.totals();
        let mut candidates = Vec::new();

        for i in 0..points.len() {
            if i + 1 < self.min_samples || i < self.window {
                continue;
            }

            let sma = mean(&totals[i - self.window..i]);
            if sma == 0.0 {
                continue;
            }

            let x = totals[i];
            let relative = ((x - sma) / sma).abs();
            if relative <= self.threshold {
                continue;
            }

            let score = relative / self.threshold * 50.0;
            let confidence = 1.0 - self.threshold / relative;
            candidates.extend(candidate(
                (points[i].date, x),
                DetectionMethod::MovingAvg,
                sma,
                score,
                confidence,
            ));
        }

        candidates
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{Duration, NaiveDate};
    use pretty_assertions::assert_eq;

    use crate::models::cost::DailyCost;

    use super::*;

    fn series(values: &[f64]) -> DailySeries {
        let start: NaiveDate = "2025-06-01".parse().unwrap();
        DailySeries::new(
            values
                .iter()
                .enumerate()
                .map(|(i, total)| DailyCost {
                    date: start + Duration::days(i as i64),
                    total: *total,
                    by_service: HashMap::new(),
                })
                .collect(),
        )
    }

    #[test]
    fn zscore_flags_spike_after_flat_baseline() {
        let detector = ZScoreDetector { k: 3.0, min_samples: 7 };
        let candidates = detector.detect(&series(&[10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 100.0]));

        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.actual_cost, 100.0);
        assert_eq!(c.expected_cost, 10.0);
        assert_eq!(c.deviation_percentage, 900.0);
        assert_eq!(c.confidence, 1.0);
        assert_eq!(c.method, DetectionMethod::ZScore);
    }

    #[test]
    fn zscore_handles_constant_series_without_division_error() {
        let detector = ZScoreDetector { k: 3.0, min_samples: 7 };
        let candidates = detector.detect(&series(&[10.0; 8]));
        assert!(candidates.is_empty());
    }

    #[test]
    fn zscore_ignores_small_deviations() {
        let detector = ZScoreDetector { k: 3.0, min_samples: 7 };
        let candidates =
            detector.detect(&series(&[10.0, 12.0, 9.0, 11.0, 10.0, 12.0, 9.0, 11.5]));
        assert!(candidates.is_empty());
    }

    #[test]
    fn zscore_skips_short_series() {
        let detector = ZScoreDetector { k: 3.0, min_samples: 7 };
        let candidates = detector.detect(&series(&[10.0, 10.0, 10.0, 100.0]));
        assert!(candidates.is_empty());
    }

    #[test]
    fn zscore_skips_zero_baseline() {
        // Deviation percentage is undefined against a zero baseline
        let detector = ZScoreDetector { k: 3.0, min_samples: 7 };
        let candidates = detector.detect(&series(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0]));
        assert!(candidates.is_empty());
    }

    #[test]
    fn iqr_flags_point_beyond_upper_fence() {
        let detector = IqrDetector { multiplier: 1.5, min_samples: 7 };
        let candidates =
            detector.detect(&series(&[10.0, 11.0, 9.0, 10.0, 12.0, 8.0, 10.0, 40.0]));

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].actual_cost, 40.0);
        assert_eq!(candidates[0].method, DetectionMethod::Iqr);
    }

    #[test]
    fn iqr_flags_point_below_lower_fence() {
        let detector = IqrDetector { multiplier: 1.5, min_samples: 7 };
        let candidates =
            detector.detect(&series(&[100.0, 101.0, 99.0, 100.0, 102.0, 98.0, 100.0, 2.0]));

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].actual_cost, 2.0);
        assert!(candidates[0].deviation_percentage < 0.0);
    }

    #[test]
    fn iqr_keeps_inlier_quiet() {
        let detector = IqrDetector { multiplier: 1.5, min_samples: 7 };
        let candidates =
            detector.detect(&series(&[10.0, 11.0, 9.0, 10.0, 12.0, 8.0, 10.0, 11.0]));
        assert!(candidates.is_empty());
    }

    #[test]
    fn moving_avg_flags_relative_deviation_over_threshold() {
        let detector = MovingAvgDetector { window: 7, threshold: 0.5, min_samples: 7 };
        let candidates =
            detector.detect(&series(&[10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 16.0]));

        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.expected_cost, 10.0);
        assert_eq!(c.actual_cost, 16.0);
        assert!((c.deviation_percentage - 60.0).abs() < 1e-9);
    }

    #[test]
    fn moving_avg_tolerates_deviation_under_threshold() {
        let detector = MovingAvgDetector { window: 7, threshold: 0.5, min_samples: 7 };
        let candidates =
            detector.detect(&series(&[10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 14.0]));
        assert!(candidates.is_empty());
    }

    #[test]
    fn moving_avg_skips_zero_average_windows() {
        let detector = MovingAvgDetector { window: 7, threshold: 0.5, min_samples: 7 };
        let candidates =
            detector.detect(&series(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 5.0]));
        assert!(candidates.is_empty());
    }

    #[test]
    fn methods_flag_independently() {
        let data = series(&[10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 100.0]);
        let config = DetectionConfig::default();

        let all: Vec<AnomalyCandidate> = build_detectors(&config)
            .iter()
            .flat_map(|d| d.detect(&data))
            .collect();

        // The spike yields one candidate per univariate method; no
        // detector-side deduplication happens.
        let methods: Vec<DetectionMethod> = all.iter().map(|c| c.method).collect();
        assert!(methods.contains(&DetectionMethod::ZScore));
        assert!(methods.contains(&DetectionMethod::Iqr));
        assert!(methods.contains(&DetectionMethod::MovingAvg));
    }

    #[test]
    fn quantile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile(&sorted, 0.5), 2.5);
        assert_eq!(quantile(&sorted, 0.25), 1.75);
        assert_eq!(quantile(&sorted, 1.0), 4.0);
    }
}
