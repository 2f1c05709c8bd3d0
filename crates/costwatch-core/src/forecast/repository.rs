//! Forecast repository

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::PostgresPool;
use crate::error::{Error, Result};
use crate::models::forecast::{CostForecast, ForecastModelKind, ForecastPoint};

/// Repository for cost forecasts
#[derive(Clone)]
pub struct ForecastRepository {
    pool: PgPool,
}

impl ForecastRepository {
    /// Create a new forecast repository
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    /// Store a model run's predictions. Predictions for a date that is
    /// still unreconciled are refreshed; reconciled rows are frozen and
    /// skipped.
    pub async fn upsert_points(
        &self,
        subscription_id: Uuid,
        model: ForecastModelKind,
        points: &[ForecastPoint],
        confidence_level: f64,
    ) -> Result<Vec<CostForecast>> {
        let now = Utc::now();
        let mut stored = Vec::with_capacity(points.len());

        for point in points {
            let row = sqlx::query_as::<_, ForecastRow>(
                r#"
                INSERT INTO cost_forecasts (
                    id, subscription_id, forecast_date, predicted_cost,
                    lower_bound, upper_bound, confidence_interval, model_type,
                    created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (subscription_id, forecast_date, model_type)
                DO UPDATE SET
                    predicted_cost = EXCLUDED.predicted_cost,
                    lower_bound = EXCLUDED.lower_bound,
                    upper_bound = EXCLUDED.upper_bound,
                    confidence_interval = EXCLUDED.confidence_interval,
                    created_at = EXCLUDED.created_at
                WHERE cost_forecasts.actual_cost IS NULL
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(subscription_id)
            .bind(point.date)
            .bind(point.predicted)
            .bind(point.lower)
            .bind(point.upper)
            .bind(confidence_level)
            .bind(model.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                stored.push(CostForecast::try_from(row)?);
            }
        }

        Ok(stored)
    }

    /// List forecasts, optionally scoped, newest forecast date first
    pub async fn list(
        &self,
        subscription_id: Option<Uuid>,
        model: Option<ForecastModelKind>,
        limit: i64,
    ) -> Result<Vec<CostForecast>> {
        let rows = sqlx::query_as::<_, ForecastRow>(
            r#"
            SELECT * FROM cost_forecasts
            WHERE ($1::uuid IS NULL OR subscription_id = $1)
              AND ($2::text IS NULL OR model_type = $2)
            ORDER BY forecast_date DESC
            LIMIT $3
            "#,
        )
        .bind(subscription_id)
        .bind(model.map(ForecastModelKind::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CostForecast::try_from).collect()
    }

    /// Forecasts whose date has passed without an actual being attached
    pub async fn list_unreconciled(
        &self,
        subscription_id: Uuid,
        up_to: NaiveDate,
    ) -> Result<Vec<CostForecast>> {
        let rows = sqlx::query_as::<_, ForecastRow>(
            r#"
            SELECT * FROM cost_forecasts
            WHERE subscription_id = $1
              AND forecast_date <= $2
              AND actual_cost IS NULL
            ORDER BY forecast_date ASC
            "#,
        )
        .bind(subscription_id)
        .bind(up_to)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CostForecast::try_from).collect()
    }

    /// Attach the real cost to a forecast exactly once. The guard on
    /// `actual_cost IS NULL` makes a second reconciliation a no-op.
    pub async fn set_actual(&self, id: Uuid, actual: f64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE cost_forecasts
            SET actual_cost = $2,
                prediction_error = $2 - predicted_cost
            WHERE id = $1 AND actual_cost IS NULL
            "#,
        )
        .bind(id)
        .bind(actual)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reconciled (predicted, actual) pairs for a model, newest first
    pub async fn reconciled_pairs(
        &self,
        subscription_id: Uuid,
        model: ForecastModelKind,
        limit: i64,
    ) -> Result<Vec<(f64, f64)>> {
        let rows = sqlx::query_as::<_, (f64, f64)>(
            r#"
            SELECT predicted_cost, actual_cost FROM cost_forecasts
            WHERE subscription_id = $1
              AND model_type = $2
              AND actual_cost IS NOT NULL
            ORDER BY forecast_date DESC
            LIMIT $3
            "#,
        )
        .bind(subscription_id)
        .bind(model.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Record the back-computed accuracy on a model's forecasts
    pub async fn update_accuracy(
        &self,
        subscription_id: Uuid,
        model: ForecastModelKind,
        accuracy: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cost_forecasts
            SET model_accuracy = $3
            WHERE subscription_id = $1 AND model_type = $2
            "#,
        )
        .bind(subscription_id)
        .bind(model.as_str())
        .bind(accuracy)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// Database row type for mapping

#[derive(sqlx::FromRow)]
struct ForecastRow {
    id: Uuid,
    subscription_id: Uuid,
    forecast_date: NaiveDate,
    predicted_cost: f64,
    lower_bound: f64,
    upper_bound: f64,
    confidence_interval: f64,
    model_type: String,
    model_accuracy: Option<f64>,
    actual_cost: Option<f64>,
    prediction_error: Option<f64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ForecastRow> for CostForecast {
    type Error = Error;

    fn try_from(row: ForecastRow) -> Result<Self> {
        let model_type = ForecastModelKind::parse(&row.model_type)
            .ok_or_else(|| Error::internal(format!("unknown model type: {}", row.model_type)))?;

        Ok(CostForecast {
            id: row.id,
            subscription_id: row.subscription_id,
            forecast_date: row.forecast_date,
            predicted_cost: row.predicted_cost,
            lower_bound: row.lower_bound,
            upper_bound: row.upper_bound,
            confidence_interval: row.confidence_interval,
            model_type,
            model_accuracy: row.model_accuracy,
            actual_cost: row.actual_cost,
            prediction_error: row.prediction_error,
            created_at: row.created_at,
        })
    }
}
