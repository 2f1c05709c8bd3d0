//! Cost anomaly data models

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Statistical method that produced an anomaly. Detectors are selected
/// by this closed set of variants, not by inheritance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Standard-score deviation from the trailing window mean
    ZScore,
    /// Interquartile-range fences over the trailing window
    Iqr,
    /// Relative deviation from a trailing simple moving average
    MovingAvg,
    /// Isolation-forest-style ensemble over multi-dimensional features
    IsolationForest,
}

impl DetectionMethod {
    /// Stable string form used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ZScore => "zscore",
            Self::Iqr => "iqr",
            Self::MovingAvg => "moving_avg",
            Self::IsolationForest => "isolation_forest",
        }
    }

    /// Parse the storage string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zscore" => Some(Self::ZScore),
            "iqr" => Some(Self::Iqr),
            "moving_avg" => Some(Self::MovingAvg),
            "isolation_forest" => Some(Self::IsolationForest),
            _ => None,
        }
    }
}

/// A persisted cost anomaly. One per (subscription, date, service,
/// method); mutated only by acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostAnomaly {
    /// Unique identifier
    pub id: Uuid,

    /// Subscription scope
    pub subscription_id: Uuid,

    /// Day the anomalous spend occurred
    pub anomaly_date: NaiveDate,

    /// Service scope; empty for the subscription total
    pub service: String,

    /// Method that flagged the point
    pub detection_method: DetectionMethod,

    /// The method's own baseline estimate for the day
    pub expected_cost: f64,

    /// Observed spend for the day
    pub actual_cost: f64,

    /// (actual - expected) / expected * 100
    pub deviation_percentage: f64,

    /// Method-specific anomaly score, 0-100
    pub anomaly_score: f64,

    /// Confidence in the flag, 0-1
    pub confidence: f64,

    /// Whether an operator has acknowledged the anomaly
    pub is_acknowledged: bool,

    /// Who acknowledged it
    pub acknowledged_by: Option<String>,

    /// When it was acknowledged
    pub acknowledged_at: Option<DateTime<Utc>>,

    /// Free-text operator notes
    pub notes: Option<String>,

    /// When the anomaly was recorded
    pub created_at: DateTime<Utc>,
}

/// A detector's output before persistence
#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyCandidate {
    /// Day the anomalous spend occurred
    pub date: NaiveDate,
    /// Service scope; empty for the subscription total
    pub service: String,
    /// Method that flagged the point
    pub method: DetectionMethod,
    /// The method's baseline estimate
    pub expected_cost: f64,
    /// Observed spend
    pub actual_cost: f64,
    /// (actual - expected) / expected * 100
    pub deviation_percentage: f64,
    /// Method-specific score, 0-100
    pub score: f64,
    /// Confidence, 0-1
    pub confidence: f64,
}
