//! Forecast model strategies
//!
//! Every model implements the same fitting contract and fails alone: a
//! series one model cannot handle must not take the others down.

use chrono::{Datelike, Duration, Weekday};
use statistical::mean;

use crate::config::ForecastConfig;
use crate::error::{Error, Result};
use crate::models::cost::DailySeries;
use crate::models::forecast::{ForecastModelKind, ForecastPoint};

/// A pluggable forecast model
pub trait ForecastModel: Send + Sync {
    /// The model tag written on produced forecasts
    fn kind(&self) -> ForecastModelKind;

    /// Fit the series and predict `horizon` days past its end. Returns
    /// a `ModelFit` error for series the model cannot handle.
    fn fit(&self, series: &DailySeries, horizon: u32) -> Result<Vec<ForecastPoint>>;
}

/// Build the configured model set
pub fn build_models(config: &ForecastConfig) -> Vec<Box<dyn ForecastModel>> {
    config
        .models
        .iter()
        .map(|kind| -> Box<dyn ForecastModel> {
            let min_history = config.min_history;
            let confidence_level = config.confidence_level;
            match kind {
                ForecastModelKind::Linear => {
                    Box::new(LinearModel { min_history, confidence_level })
                }
                ForecastModelKind::Arima => {
                    Box::new(ArimaModel { min_history, confidence_level })
                }
                ForecastModelKind::Prophet => {
                    Box::new(ProphetModel { min_history, confidence_level })
                }
                ForecastModelKind::Lstm => Box::new(LstmModel {
                    min_history,
                    confidence_level,
                    window: 7,
                    epochs: 200,
                    learning_rate: 0.05,
                }),
            }
        })
        .collect()
}

/// Shared preconditions: enough history, and not a flat-zero series
fn check_series(kind: ForecastModelKind, series: &DailySeries, min_history: usize) -> Result<Vec<f64>> {
    if series.len() < min_history {
        return Err(Error::model_fit(
            kind.as_str(),
            format!("insufficient history: {} of {min_history} days", series.len()),
        ));
    }
    let totals = series.totals();
    if totals.iter().all(|v| *v == 0.0) {
        return Err(Error::model_fit(kind.as_str(), "degenerate all-zero series"));
    }
    Ok(totals)
}

/// Standard z value for a confidence level
fn z_for_confidence(level: f64) -> f64 {
    match level {
        l if l >= 0.99 => 2.576,
        l if l >= 0.95 => 1.96,
        l if l >= 0.90 => 1.645,
        _ => 1.28,
    }
}

/// Attach widening confidence bounds to point predictions
fn with_bounds(
    series: &DailySeries,
    predictions: Vec<f64>,
    rmse: f64,
    confidence_level: f64,
) -> Vec<ForecastPoint> {
    let last_date = series.last().map(|p| p.date).expect("checked non-empty");
    let z = z_for_confidence(confidence_level);

    predictions
        .into_iter()
        .enumerate()
        .map(|(i, predicted)| {
            // Uncertainty grows with forecast distance
            let margin = z * rmse * (1.0 + 0.1 * i as f64);
            ForecastPoint {
                date: last_date + Duration::days(i as i64 + 1),
                predicted,
                lower: (predicted - margin).max(0.0),
                upper: predicted + margin,
            }
        })
        .collect()
}

/// Ordinary least squares fit: (intercept, slope)
fn fit_ols(values: &[f64]) -> (f64, f64) {
    let n = values.len();
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = mean(values);

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        num += (i as f64 - x_mean) * (y - y_mean);
        den += (i as f64 - x_mean).powi(2);
    }

    let slope = if den != 0.0 { num / den } else { 0.0 };
    (y_mean - slope * x_mean, slope)
}

fn rmse_of(errors: &[f64]) -> f64 {
    if errors.is_empty() {
        return 0.0;
    }
    (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt()
}

/// Linear trend over the day index
pub struct LinearModel {
    /// Minimum history before fitting
    pub min_history: usize,
    /// Confidence level for the bounds
    pub confidence_level: f64,
}

impl ForecastModel for LinearModel {
    fn kind(&self) -> ForecastModelKind {
        ForecastModelKind::Linear
    }

    fn fit(&self, series: &DailySeries, horizon: u32) -> Result<Vec<ForecastPoint>> {
        let values = check_series(self.kind(), series, self.min_history)?;
        let (intercept, slope) = fit_ols(&values);

        let residuals: Vec<f64> = values
            .iter()
            .enumerate()
            .map(|(i, y)| y - (intercept + slope * i as f64))
            .collect();
        let rmse = rmse_of(&residuals);

        let n = values.len();
        let predictions = (0..horizon)
            .map(|i| (intercept + slope * (n + i as usize) as f64).max(0.0))
            .collect();

        Ok(with_bounds(series, predictions, rmse, self.confidence_level))
    }
}

/// First-order autoregression with drift on the differenced series
pub struct ArimaModel {
    /// Minimum history before fitting
    pub min_history: usize,
    /// Confidence level for the bounds
    pub confidence_level: f64,
}

impl ForecastModel for ArimaModel {
    fn kind(&self) -> ForecastModelKind {
        ForecastModelKind::Arima
    }

    fn fit(&self, series: &DailySeries, horizon: u32) -> Result<Vec<ForecastPoint>> {
        let values = check_series(self.kind(), series, self.min_history)?;

        let diffs: Vec<f64> = values.windows(2).map(|w| w[1] - w[0]).collect();
        let mu = mean(&diffs);

        let mut num = 0.0;
        let mut den = 0.0;
        for w in diffs.windows(2) {
            num += (w[0] - mu) * (w[1] - mu);
        }
        for d in &diffs {
            den += (d - mu).powi(2);
        }
        let phi = if den != 0.0 { (num / den).clamp(-0.99, 0.99) } else { 0.0 };

        // One-step in-sample errors for the bound width
        let mut errors = Vec::new();
        for t in 1..diffs.len() {
            let predicted_diff = mu + phi * (diffs[t - 1] - mu);
            errors.push(diffs[t] - predicted_diff);
        }
        let rmse = rmse_of(&errors);

        let mut level = *values.last().expect("checked non-empty");
        let mut previous_diff = *diffs.last().expect("min_history > 1");
        let predictions = (0..horizon)
            .map(|_| {
                let diff = mu + phi * (previous_diff - mu);
                previous_diff = diff;
                level = (level + diff).max(0.0);
                level
            })
            .collect();

        Ok(with_bounds(series, predictions, rmse, self.confidence_level))
    }
}

/// Weekday seasonal indices over a linear trend
pub struct ProphetModel {
    /// Minimum history before fitting
    pub min_history: usize,
    /// Confidence level for the bounds
    pub confidence_level: f64,
}

impl ProphetModel {
    fn seasonal_indices(series: &DailySeries) -> [f64; 7] {
        let overall = mean(&series.totals());
        let mut indices = [1.0; 7];
        if overall <= 0.0 {
            return indices;
        }
        for (i, weekday) in WEEKDAYS.iter().enumerate() {
            if let Some(day_mean) = series.weekday_mean(*weekday) {
                let index = day_mean / overall;
                if index > 0.0 {
                    indices[i] = index;
                }
            }
        }
        indices
    }
}

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

impl ForecastModel for ProphetModel {
    fn kind(&self) -> ForecastModelKind {
        ForecastModelKind::Prophet
    }

    fn fit(&self, series: &DailySeries, horizon: u32) -> Result<Vec<ForecastPoint>> {
        check_series(self.kind(), series, self.min_history)?;

        let indices = Self::seasonal_indices(series);
        let index_for = |date: chrono::NaiveDate| {
            indices[date.weekday().num_days_from_monday() as usize]
        };

        let deseasonalized: Vec<f64> = series
            .points()
            .iter()
            .map(|p| p.total / index_for(p.date))
            .collect();
        let (intercept, slope) = fit_ols(&deseasonalized);

        let residuals: Vec<f64> = series
            .points()
            .iter()
            .enumerate()
            .map(|(i, p)| p.total - (intercept + slope * i as f64) * index_for(p.date))
            .collect();
        let rmse = rmse_of(&residuals);

        let last_date = series.last().expect("checked non-empty").date;
        let n = series.len();
        let predictions = (0..horizon)
            .map(|i| {
                let date = last_date + Duration::days(i as i64 + 1);
                let trend = intercept + slope * (n + i as usize) as f64;
                (trend * index_for(date)).max(0.0)
            })
            .collect();

        Ok(with_bounds(series, predictions, rmse, self.confidence_level))
    }
}

/// Lag-window sequence model: an autoregression over the last `window`
/// days, fit by gradient descent on the mean-normalized series and
/// applied recursively over the horizon. The heaviest model here; runs
/// under the forecaster's fit timeout.
pub struct LstmModel {
    /// Minimum history before fitting
    pub min_history: usize,
    /// Confidence level for the bounds
    pub confidence_level: f64,
    /// Input lag window
    pub window: usize,
    /// Training epochs
    pub epochs: usize,
    /// SGD learning rate
    pub learning_rate: f64,
}

impl ForecastModel for LstmModel {
    fn kind(&self) -> ForecastModelKind {
        ForecastModelKind::Lstm
    }

    fn fit(&self, series: &DailySeries, horizon: u32) -> Result<Vec<ForecastPoint>> {
        let values = check_series(self.kind(), series, self.min_history)?;

        let window = self.window.min(values.len() / 2).max(1);
        let scale = mean(&values);
        let normalized: Vec<f64> = values.iter().map(|v| v / scale).collect();

        // Deterministic init: uniform averaging weights
        let mut weights = vec![1.0 / window as f64; window];
        let mut bias = 0.0;

        for _ in 0..self.epochs {
            for t in window..normalized.len() {
                let inputs = &normalized[t - window..t];
                let predicted: f64 = bias
                    + weights
                        .iter()
                        .zip(inputs)
                        .map(|(w, x)| w * x)
                        .sum::<f64>();
                let error = predicted - normalized[t];

                bias -= self.learning_rate * error;
                for (w, x) in weights.iter_mut().zip(inputs) {
                    *w -= self.learning_rate * error * x;
                }
            }
        }

        // In-sample errors on the original scale
        let mut errors = Vec::new();
        for t in window..normalized.len() {
            let inputs = &normalized[t - window..t];
            let predicted: f64 = bias
                + weights.iter().zip(inputs).map(|(w, x)| w * x).sum::<f64>();
            errors.push((predicted - normalized[t]) * scale);
        }
        let rmse = rmse_of(&errors);

        let mut context: Vec<f64> = normalized[normalized.len() - window..].to_vec();
        let predictions = (0..horizon)
            .map(|_| {
                let predicted: f64 = bias
                    + weights
                        .iter()
                        .zip(&context)
                        .map(|(w, x)| w * x)
                        .sum::<f64>();
                context.remove(0);
                context.push(predicted);
                (predicted * scale).max(0.0)
            })
            .collect();

        Ok(with_bounds(series, predictions, rmse, self.confidence_level))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{Datelike, NaiveDate};
    use pretty_assertions::assert_eq;

    use crate::models::cost::DailyCost;

    use super::*;

    fn series(values: &[f64]) -> DailySeries {
        let start: NaiveDate = "2025-06-02".parse().unwrap();
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

    fn linear_values(n: usize) -> Vec<f64> {
        (0..n).map(|i| 100.0 + 2.0 * i as f64).collect()
    }

    #[test]
    fn linear_model_continues_the_trend() {
        let model = LinearModel { min_history: 14, confidence_level: 0.95 };
        let data = series(&linear_values(14));

        let points = model.fit(&data, 3).unwrap();

        assert_eq!(points.len(), 3);
        // Perfectly linear input: slope 2, next values 128, 130, 132
        assert!((points[0].predicted - 128.0).abs() < 1e-6);
        assert!((points[1].predicted - 130.0).abs() < 1e-6);
        assert!((points[2].predicted - 132.0).abs() < 1e-6);
        // Zero residuals collapse the bounds onto the prediction
        assert!((points[0].lower - points[0].predicted).abs() < 1e-6);
        assert!((points[0].upper - points[0].predicted).abs() < 1e-6);
    }

    #[test]
    fn forecast_dates_follow_the_series_end() {
        let model = LinearModel { min_history: 14, confidence_level: 0.95 };
        let data = series(&linear_values(14));

        let points = model.fit(&data, 2).unwrap();

        assert_eq!(points[0].date, "2025-06-16".parse::<NaiveDate>().unwrap());
        assert_eq!(points[1].date, "2025-06-17".parse::<NaiveDate>().unwrap());
    }

    #[test]
    fn bounds_widen_with_forecast_distance() {
        let model = LinearModel { min_history: 14, confidence_level: 0.95 };
        let noisy: Vec<f64> = (0..20)
            .map(|i| 100.0 + if i % 2 == 0 { 10.0 } else { -10.0 })
            .collect();

        let points = model.fit(&series(&noisy), 5).unwrap();

        let spread = |p: &ForecastPoint| p.upper - p.lower;
        assert!(spread(&points[4]) > spread(&points[0]));
    }

    #[test]
    fn insufficient_history_fails_only_this_model() {
        let model = LinearModel { min_history: 14, confidence_level: 0.95 };
        let err = model.fit(&series(&linear_values(5)), 3).unwrap_err();
        assert!(matches!(err, Error::ModelFit { .. }));
    }

    #[test]
    fn all_zero_series_is_degenerate() {
        let model = ArimaModel { min_history: 14, confidence_level: 0.95 };
        let err = model.fit(&series(&vec![0.0; 20]), 3).unwrap_err();
        assert!(matches!(err, Error::ModelFit { .. }));
    }

    #[test]
    fn arima_carries_constant_drift_forward() {
        let model = ArimaModel { min_history: 14, confidence_level: 0.95 };
        let data = series(&linear_values(14));

        let points = model.fit(&data, 3).unwrap();

        // Constant diffs: mu = 2, phi = 0, each step adds the drift
        assert!((points[0].predicted - 128.0).abs() < 1e-6);
        assert!((points[2].predicted - 132.0).abs() < 1e-6);
    }

    #[test]
    fn prophet_projects_the_weekly_shape() {
        // Weekdays spend 100, weekends 50; series starts on a Monday
        let values: Vec<f64> = (0..28)
            .map(|i| if i % 7 >= 5 { 50.0 } else { 100.0 })
            .collect();
        let model = ProphetModel { min_history: 14, confidence_level: 0.95 };
        let data = series(&values);

        let points = model.fit(&data, 7).unwrap();

        let by_weekday: HashMap<Weekday, f64> = points
            .iter()
            .map(|p| (p.date.weekday(), p.predicted))
            .collect();
        assert!(by_weekday[&Weekday::Sat] < by_weekday[&Weekday::Wed]);
        assert!((by_weekday[&Weekday::Wed] - 100.0).abs() < 5.0);
        assert!((by_weekday[&Weekday::Sun] - 50.0).abs() < 5.0);
    }

    #[test]
    fn sequence_model_holds_a_constant_level() {
        let model = LstmModel {
            min_history: 14,
            confidence_level: 0.95,
            window: 7,
            epochs: 200,
            learning_rate: 0.05,
        };
        let data = series(&vec![100.0; 21]);

        let points = model.fit(&data, 5).unwrap();

        for point in &points {
            assert!((point.predicted - 100.0).abs() < 1.0, "{point:?}");
        }
    }

    #[test]
    fn z_values_match_the_usual_table() {
        assert_eq!(z_for_confidence(0.99), 2.576);
        assert_eq!(z_for_confidence(0.95), 1.96);
        assert_eq!(z_for_confidence(0.90), 1.645);
        assert_eq!(z_for_confidence(0.5), 1.28);
    }
}
