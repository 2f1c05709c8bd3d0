//! Cost forecasting: pluggable models, persistence and reconciliation

mod models;
mod reconcile;
mod repository;

pub use models::{build_models, ArimaModel, ForecastModel, LinearModel, LstmModel, ProphetModel};
pub use reconcile::{accuracy_from_pairs, Reconciler};
pub use repository::ForecastRepository;

use std::time::Duration;

use chrono::NaiveDate;
use tracing::warn;
use uuid::Uuid;

use crate::config::ForecastConfig;
use crate::db::CostRecordRepository;
use crate::error::{Error, Result};
use crate::models::forecast::CostForecast;

/// Fits the configured models over a subscription's history and stores
/// their projections
pub struct Forecaster {
    records: CostRecordRepository,
    repo: ForecastRepository,
    config: ForecastConfig,
}

impl Forecaster {
    /// Create a new forecaster
    pub fn new(
        records: CostRecordRepository,
        repo: ForecastRepository,
        config: ForecastConfig,
    ) -> Self {
        Self { records, repo, config }
    }

    /// Fit every configured model and persist its horizon. A model that
    /// cannot fit, or that exceeds the fit timeout, fails alone; the
    /// other models still produce forecasts.
    pub async fn run(&self, subscription_id: Uuid, today: NaiveDate) -> Result<Vec<CostForecast>> {
        let from = today - chrono::Duration::days(i64::from(self.config.history_days));
        let series = self
            .records
            .daily_series(subscription_id, None, from, today)
            .await?;

        let mut stored = Vec::new();

        for model in build_models(&self.config) {
            let kind = model.kind();
            let horizon = self.config.horizon_days;
            let model_series = series.clone();

            let fit = tokio::time::timeout(
                Duration::from_secs(self.config.fit_timeout_seconds),
                tokio::task::spawn_blocking(move || model.fit(&model_series, horizon)),
            )
            .await;

            let points = match fit {
                Err(_) => {
                    warn!(
                        subscription_id = %subscription_id,
                        model = kind.as_str(),
                        "Model fit timed out"
                    );
                    metrics::counter!("costwatch_forecast_fit_failures_total").increment(1);
                    continue;
                }
                Ok(Err(join_error)) => {
                    warn!(
                        subscription_id = %subscription_id,
                        model = kind.as_str(),
                        error = %join_error,
                        "Model fit task failed"
                    );
                    metrics::counter!("costwatch_forecast_fit_failures_total").increment(1);
                    continue;
                }
                Ok(Ok(Err(error @ Error::ModelFit { .. }))) => {
                    warn!(
                        subscription_id = %subscription_id,
                        model = kind.as_str(),
                        error = %error,
                        "Model cannot fit this series"
                    );
                    metrics::counter!("costwatch_forecast_fit_failures_total").increment(1);
                    continue;
                }
                Ok(Ok(Err(error))) => return Err(error),
                Ok(Ok(Ok(points))) => points,
            };

            let forecasts = self
                .repo
                .upsert_points(subscription_id, kind, &points, self.config.confidence_level)
                .await?;
            stored.extend(forecasts);
        }

        Ok(stored)
    }
}
