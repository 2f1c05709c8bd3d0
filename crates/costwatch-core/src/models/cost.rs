//! Cost record and daily series models

use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An ingested daily spend fact. Append-only; never mutated after
/// ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    /// Unique identifier
    pub id: Uuid,

    /// Subscription the spend belongs to
    pub subscription_id: Uuid,

    /// Day the spend was incurred
    pub record_date: NaiveDate,

    /// Cloud service that produced the spend
    pub service: String,

    /// Resource group (may be empty)
    pub resource_group: String,

    /// Spend amount in `currency`
    pub amount: f64,

    /// ISO currency code
    pub currency: String,

    /// When the record arrived
    pub ingested_at: DateTime<Utc>,
}

/// Input for ingesting a cost record (feed page item)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecordInput {
    pub subscription_id: Uuid,
    pub record_date: NaiveDate,
    pub service: String,
    #[serde(default)]
    pub resource_group: String,
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// Aggregated spend for one day of a series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyCost {
    /// Day
    pub date: NaiveDate,

    /// Total spend across all matching services
    pub total: f64,

    /// Per-service breakdown for the day
    pub by_service: HashMap<String, f64>,
}

impl DailyCost {
    /// Shannon entropy of the per-service spend mix, in nats.
    /// Zero for a single-service day or no spend.
    pub fn service_mix_entropy(&self) -> f64 {
        let total: f64 = self.by_service.values().filter(|v| **v > 0.0).sum();
        if total <= 0.0 {
            return 0.0;
        }
        -self
            .by_service
            .values()
            .filter(|v| **v > 0.0)
            .map(|v| {
                let p = v / total;
                p * p.ln()
            })
            .sum::<f64>()
    }
}

/// An ordered daily cost series for a (subscription, optional service)
/// scope. Gaps are allowed; points are sorted by date ascending.
#[derive(Debug, Clone, Default)]
pub struct DailySeries {
    points: Vec<DailyCost>,
}

impl DailySeries {
    /// Build a series from pre-sorted points
    pub fn new(points: Vec<DailyCost>) -> Self {
        debug_assert!(points.windows(2).all(|w| w[0].date < w[1].date));
        Self { points }
    }

    /// Number of days with data
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the series has no points
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// All points, oldest first
    pub fn points(&self) -> &[DailyCost] {
        &self.points
    }

    /// Daily totals, oldest first
    pub fn totals(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.total).collect()
    }

    /// The most recent point
    pub fn last(&self) -> Option<&DailyCost> {
        self.points.last()
    }

    /// Mean total for a given weekday, if that weekday occurs
    pub fn weekday_mean(&self, weekday: Weekday) -> Option<f64> {
        let values: Vec<f64> = self
            .points
            .iter()
            .filter(|p| p.date.weekday() == weekday)
            .map(|p| p.total)
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(date: &str, total: f64) -> DailyCost {
        DailyCost {
            date: date.parse().unwrap(),
            total,
            by_service: HashMap::new(),
        }
    }

    #[test]
    fn entropy_is_zero_for_single_service() {
        let mut point = day("2025-06-02", 10.0);
        point.by_service.insert("compute".to_string(), 10.0);
        assert_eq!(point.service_mix_entropy(), 0.0);
    }

    #[test]
    fn entropy_is_positive_for_mixed_services() {
        let mut point = day("2025-06-02", 20.0);
        point.by_service.insert("compute".to_string(), 10.0);
        point.by_service.insert("storage".to_string(), 10.0);
        let entropy = point.service_mix_entropy();
        assert!((entropy - std::f64::consts::LN_2).abs() < 1e-9);
    }

    #[test]
    fn weekday_mean_averages_matching_days() {
        // 2025-06-02 and 2025-06-09 are Mondays
        let series = DailySeries::new(vec![
            day("2025-06-02", 10.0),
            day("2025-06-03", 50.0),
            day("2025-06-09", 30.0),
        ]);
        assert_eq!(series.weekday_mean(Weekday::Mon), Some(20.0));
        assert_eq!(series.weekday_mean(Weekday::Fri), None);
    }
}
