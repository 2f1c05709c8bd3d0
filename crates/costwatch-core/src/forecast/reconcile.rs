//! Forecast reconciliation
//!
//! Attaches real outcomes to past forecasts once their date's records
//! have arrived, then back-computes per-model accuracy. The pass is
//! idempotent: already-filled rows are left untouched and re-running it
//! changes nothing.

use chrono::NaiveDate;
use tracing::debug;
use uuid::Uuid;

use crate::db::CostRecordRepository;
use crate::error::Result;
use crate::models::forecast::ForecastModelKind;

use super::repository::ForecastRepository;

const ACCURACY_SAMPLE: i64 = 90;

/// Back-fills actuals and prediction errors on matured forecasts
#[derive(Clone)]
pub struct Reconciler {
    records: CostRecordRepository,
    forecasts: ForecastRepository,
}

impl Reconciler {
    /// Create a new reconciler
    pub fn new(records: CostRecordRepository, forecasts: ForecastRepository) -> Self {
        Self { records, forecasts }
    }

    /// Reconcile every matured forecast of a subscription. A forecast
    /// date with no records yet is left for a later tick; the feed is
    /// eventually consistent and records may arrive days late.
    pub async fn run(&self, subscription_id: Uuid, today: NaiveDate) -> Result<usize> {
        let pending = self
            .forecasts
            .list_unreconciled(subscription_id, today)
            .await?;

        let mut reconciled = 0usize;
        let mut touched_models: Vec<ForecastModelKind> = Vec::new();

        for forecast in pending {
            let Some(actual) = self
                .records
                .daily_total(subscription_id, forecast.forecast_date)
                .await?
            else {
                debug!(
                    forecast_id = %forecast.id,
                    date = %forecast.forecast_date,
                    "No records yet for forecast date"
                );
                continue;
            };

            if self.forecasts.set_actual(forecast.id, actual).await? {
                reconciled += 1;
                if !touched_models.contains(&forecast.model_type) {
                    touched_models.push(forecast.model_type);
                }
            }
        }

        for model in touched_models {
            let pairs = self
                .forecasts
                .reconciled_pairs(subscription_id, model, ACCURACY_SAMPLE)
                .await?;
            if let Some(accuracy) = accuracy_from_pairs(&pairs) {
                self.forecasts
                    .update_accuracy(subscription_id, model, accuracy)
                    .await?;
            }
        }

        if reconciled > 0 {
            metrics::counter!("costwatch_forecasts_reconciled_total")
                .increment(reconciled as u64);
        }

        Ok(reconciled)
    }
}

/// 1 - mean absolute percentage error over (predicted, actual) pairs.
/// Pairs with a zero actual are skipped; None when nothing is usable.
pub fn accuracy_from_pairs(pairs: &[(f64, f64)]) -> Option<f64> {
    let errors: Vec<f64> = pairs
        .iter()
        .filter(|(_, actual)| *actual != 0.0)
        .map(|(predicted, actual)| ((actual - predicted) / actual).abs())
        .collect();

    if errors.is_empty() {
        return None;
    }

    let mape = errors.iter().sum::<f64>() / errors.len() as f64;
    Some((1.0 - mape).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_predictions_score_one() {
        let pairs = vec![(100.0, 100.0), (50.0, 50.0)];
        assert_eq!(accuracy_from_pairs(&pairs), Some(1.0));
    }

    #[test]
    fn accuracy_is_one_minus_mape() {
        // Errors of 10% and 30% -> MAPE 20% -> accuracy 0.8
        let pairs = vec![(90.0, 100.0), (130.0, 100.0)];
        let accuracy = accuracy_from_pairs(&pairs).unwrap();
        assert!((accuracy - 0.8).abs() < 1e-9);
    }

    #[test]
    fn zero_actuals_are_skipped() {
        let pairs = vec![(90.0, 0.0), (90.0, 100.0)];
        let accuracy = accuracy_from_pairs(&pairs).unwrap();
        assert!((accuracy - 0.9).abs() < 1e-9);
    }

    #[test]
    fn no_usable_pairs_yields_none() {
        assert_eq!(accuracy_from_pairs(&[]), None);
        assert_eq!(accuracy_from_pairs(&[(10.0, 0.0)]), None);
    }

    #[test]
    fn wildly_wrong_predictions_floor_at_zero() {
        let pairs = vec![(1000.0, 100.0)];
        assert_eq!(accuracy_from_pairs(&pairs), Some(0.0));
    }
}
