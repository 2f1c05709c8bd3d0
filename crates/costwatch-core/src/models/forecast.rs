//! Cost forecast data models

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Predictive model family. Models are selected by this closed set of
/// variants and share a single fitting contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastModelKind {
    /// Ordinary least squares over the day index
    Linear,
    /// Autoregression with drift on the differenced series
    Arima,
    /// Weekday seasonal indices over a linear trend
    Prophet,
    /// Lag-window sequence model fit by gradient descent
    Lstm,
}

impl ForecastModelKind {
    /// Stable string form used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Arima => "arima",
            Self::Prophet => "prophet",
            Self::Lstm => "lstm",
        }
    }

    /// Parse the storage string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "linear" => Some(Self::Linear),
            "arima" => Some(Self::Arima),
            "prophet" => Some(Self::Prophet),
            "lstm" => Some(Self::Lstm),
            _ => None,
        }
    }
}

/// A persisted cost forecast for one future date. Immutable except for
/// the one-time reconciliation back-fill of `actual_cost` and
/// `prediction_error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostForecast {
    /// Unique identifier
    pub id: Uuid,

    /// Subscription scope
    pub subscription_id: Uuid,

    /// Day being predicted
    pub forecast_date: NaiveDate,

    /// Point prediction
    pub predicted_cost: f64,

    /// Lower confidence bound
    pub lower_bound: f64,

    /// Upper confidence bound
    pub upper_bound: f64,

    /// Confidence level of the bounds (e.g. 0.95)
    pub confidence_interval: f64,

    /// Model that produced the prediction
    pub model_type: ForecastModelKind,

    /// 1 - MAPE over reconciled forecasts; null until actuals exist
    pub model_accuracy: Option<f64>,

    /// Real spend, back-filled once available
    pub actual_cost: Option<f64>,

    /// actual - predicted, set with `actual_cost`
    pub prediction_error: Option<f64>,

    /// When the forecast was made
    pub created_at: DateTime<Utc>,
}

/// A model's output for one future date, before persistence
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastPoint {
    /// Day being predicted
    pub date: NaiveDate,
    /// Point prediction
    pub predicted: f64,
    /// Lower confidence bound
    pub lower: f64,
    /// Upper confidence bound
    pub upper: f64,
}
