//! Isolation-forest-style contextual anomaly detection
//!
//! The univariate detectors miss contextual anomalies: a Saturday that
//! spends like a weekday, a normal-looking total hiding a sudden service
//! mix shift. This detector isolates each day in a small feature space
//! (day-of-week-normalized cost, day-over-day rate of change, service
//! mix entropy) with an ensemble of randomized trees; points that
//! isolate in few splits score high.

use chrono::{Datelike, NaiveDate};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::models::anomaly::{AnomalyCandidate, DetectionMethod};
use crate::models::cost::DailySeries;

use super::detectors::{candidate, Detector};

const FEATURES: usize = 3;

/// Ensemble anomaly detector over multi-dimensional daily features
pub struct IsolationForestDetector {
    /// Trees in the ensemble
    pub trees: usize,
    /// Subsample size per tree
    pub sample_size: usize,
    /// Score above which a point is flagged (0-1)
    pub score_threshold: f64,
    /// RNG seed; fixed so reruns flag the same points
    pub seed: u64,
    /// Minimum series length before any candidate is emitted
    pub min_samples: usize,
}

struct FeatureRow {
    date: NaiveDate,
    actual: f64,
    /// Weekday baseline used as the expected cost for flagged days
    dow_mean: f64,
    features: [f64; FEATURES],
}

impl Detector for IsolationForestDetector {
    fn method(&self) -> DetectionMethod {
        DetectionMethod::IsolationForest
    }

    fn detect(&self, series: &DailySeries) -> Vec<AnomalyCandidate> {
        if series.len() < self.min_samples {
            return Vec::new();
        }

        let rows = feature_rows(series);
        if rows.len() < self.min_samples {
            return Vec::new();
        }

        let data: Vec<[f64; FEATURES]> = rows.iter().map(|r| r.features).collect();
        let forest = Forest::fit(
            &data,
            self.trees,
            self.sample_size.min(data.len()),
            self.seed,
        );

        rows.iter()
            .enumerate()
            .filter_map(|(i, row)| {
                let score = forest.score(&data[i]);
                if score <= self.score_threshold {
                    return None;
                }
                let confidence = (score - self.score_threshold) / (1.0 - self.score_threshold);
                candidate(
                    (row.date, row.actual),
                    DetectionMethod::IsolationForest,
                    row.dow_mean,
                    score * 100.0,
                    confidence,
                )
            })
            .collect()
    }
}

/// Per-day feature extraction. The first day has no rate of change and
/// is excluded.
fn feature_rows(series: &DailySeries) -> Vec<FeatureRow> {
    let points = series.points();
    let mut rows = Vec::with_capacity(points.len().saturating_sub(1));

    for i in 1..points.len() {
        let point = &points[i];
        let previous = &points[i - 1];

        let dow_mean = series.weekday_mean(point.date.weekday()).unwrap_or(0.0);
        let normalized = if dow_mean > 0.0 {
            point.total / dow_mean
        } else {
            1.0
        };
        let rate_of_change = if previous.total != 0.0 {
            (point.total - previous.total) / previous.total
        } else {
            0.0
        };

        rows.push(FeatureRow {
            date: point.date,
            actual: point.total,
            dow_mean,
            features: [normalized, rate_of_change, point.service_mix_entropy()],
        });
    }

    rows
}

enum Node {
    Leaf { size: usize },
    Split { dim: usize, value: f64, left: Box<Node>, right: Box<Node> },
}

struct Forest {
    roots: Vec<Node>,
    sample_size: usize,
}

impl Forest {
    fn fit(data: &[[f64; FEATURES]], trees: usize, sample_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let max_depth = (sample_size.max(2) as f64).log2().ceil() as usize;
        let indices: Vec<usize> = (0..data.len()).collect();

        let roots = (0..trees)
            .map(|_| {
                let sample: Vec<usize> = indices
                    .choose_multiple(&mut rng, sample_size)
                    .copied()
                    .collect();
                build_tree(data, &sample, 0, max_depth, &mut rng)
            })
            .collect();

        Self { roots, sample_size }
    }

    /// Anomaly score in (0, 1): 2^(-E[h]/c(n))
    fn score(&self, point: &[f64; FEATURES]) -> f64 {
        let total: f64 = self
            .roots
            .iter()
            .map(|root| path_length(root, point, 0))
            .sum();
        let mean_path = total / self.roots.len() as f64;
        let normalizer = average_path_length(self.sample_size);
        if normalizer == 0.0 {
            return 0.0;
        }
        2f64.powf(-mean_path / normalizer)
    }
}

fn build_tree(
    data: &[[f64; FEATURES]],
    indices: &[usize],
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
) -> Node {
    if indices.len() <= 1 || depth >= max_depth {
        return Node::Leaf { size: indices.len() };
    }

    // Only dimensions with spread can split the node
    let splittable: Vec<(usize, f64, f64)> = (0..FEATURES)
        .filter_map(|dim| {
            let (mut lo, mut hi) = (f64::INFINITY, f64::NEG_INFINITY);
            for &i in indices {
                lo = lo.min(data[i][dim]);
                hi = hi.max(data[i][dim]);
            }
            (hi > lo).then_some((dim, lo, hi))
        })
        .collect();

    let Some(&(dim, lo, hi)) = splittable.as_slice().choose(rng) else {
        return Node::Leaf { size: indices.len() };
    };

    let value = rng.gen_range(lo..hi);
    let (left, right): (Vec<usize>, Vec<usize>) =
        indices.iter().copied().partition(|&i| data[i][dim] < value);

    Node::Split {
        dim,
        value,
        left: Box::new(build_tree(data, &left, depth + 1, max_depth, rng)),
        right: Box::new(build_tree(data, &right, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &Node, point: &[f64; FEATURES], depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path_length(*size),
        Node::Split { dim, value, left, right } => {
            if point[*dim] < *value {
                path_length(left, point, depth + 1)
            } else {
                path_length(right, point, depth + 1)
            }
        }
    }
}

/// c(n): expected path length of an unsuccessful BST search, the
/// standard isolation-forest normalizer
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + 0.577_215_664_9) - 2.0 * (n - 1.0) / n
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Duration;

    use crate::models::cost::DailyCost;

    use super::*;

    fn detector() -> IsolationForestDetector {
        IsolationForestDetector {
            trees: 100,
            sample_size: 64,
            score_threshold: 0.6,
            seed: 42,
            min_samples: 7,
        }
    }

    fn series_with_spike(days: usize, spike_at: Option<usize>) -> DailySeries {
        let start: NaiveDate = "2025-05-01".parse().unwrap();
        DailySeries::new(
            (0..days)
                .map(|i| {
                    let total = match spike_at {
                        Some(s) if s == i => 500.0,
                        _ => 100.0,
                    };
                    let mut by_service = HashMap::new();
                    by_service.insert("compute".to_string(), total);
                    DailyCost {
                        date: start + Duration::days(i as i64),
                        total,
                        by_service,
                    }
                })
                .collect(),
        )
    }

    #[test]
    fn spike_day_isolates_quickly() {
        let data = series_with_spike(30, Some(20));
        let candidates = detector().detect(&data);

        let spike_date: NaiveDate = "2025-05-21".parse().unwrap();
        assert!(
            candidates.iter().any(|c| c.date == spike_date),
            "spike day not flagged: {candidates:?}"
        );
        // The spike, its recovery day and the spike's weekday peers may
        // stand out; the bulk of the series must not
        assert!(candidates.len() <= 6, "too many flags: {candidates:?}");
    }

    #[test]
    fn quiet_series_stays_quiet() {
        let data = series_with_spike(30, None);
        let candidates = detector().detect(&data);
        assert!(candidates.is_empty(), "unexpected flags: {candidates:?}");
    }

    #[test]
    fn short_series_is_a_noop() {
        let data = series_with_spike(5, Some(3));
        assert!(detector().detect(&data).is_empty());
    }

    #[test]
    fn scores_are_deterministic_across_runs() {
        let data = series_with_spike(30, Some(20));
        let first = detector().detect(&data);
        let second = detector().detect(&data);
        assert_eq!(first, second);
    }

    #[test]
    fn normalizer_grows_with_sample_size() {
        assert_eq!(average_path_length(1), 0.0);
        assert!(average_path_length(16) > average_path_length(8));
    }
}
