//! Anomaly repository

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::PostgresPool;
use crate::error::{Error, Result};
use crate::models::anomaly::{AnomalyCandidate, CostAnomaly, DetectionMethod};

/// Repository for detected cost anomalies
#[derive(Clone)]
pub struct AnomalyRepository {
    pool: PgPool,
}

impl AnomalyRepository {
    /// Create a new anomaly repository
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    /// Persist candidates, returning only the genuinely new anomalies.
    /// A (subscription, date, service, method) combination that already
    /// exists is skipped, which keeps re-detection across ticks from
    /// duplicating records or re-firing anomaly rules.
    pub async fn insert_candidates(
        &self,
        subscription_id: Uuid,
        candidates: &[AnomalyCandidate],
    ) -> Result<Vec<CostAnomaly>> {
        let mut inserted = Vec::new();
        let now = Utc::now();

        for candidate in candidates {
            let row = sqlx::query_as::<_, AnomalyRow>(
                r#"
                INSERT INTO cost_anomalies (
                    id, subscription_id, anomaly_date, service, detection_method,
                    expected_cost, actual_cost, deviation_percentage,
                    anomaly_score, confidence, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (subscription_id, anomaly_date, service, detection_method)
                DO NOTHING
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(subscription_id)
            .bind(candidate.date)
            .bind(&candidate.service)
            .bind(candidate.method.as_str())
            .bind(candidate.expected_cost)
            .bind(candidate.actual_cost)
            .bind(candidate.deviation_percentage)
            .bind(candidate.score)
            .bind(candidate.confidence)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                inserted.push(CostAnomaly::try_from(row)?);
            }
        }

        Ok(inserted)
    }

    /// Get an anomaly by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<CostAnomaly>> {
        let row = sqlx::query_as::<_, AnomalyRow>("SELECT * FROM cost_anomalies WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(CostAnomaly::try_from).transpose()
    }

    /// List anomalies, newest first
    pub async fn list(
        &self,
        subscription_id: Option<Uuid>,
        unacknowledged_only: bool,
        limit: i64,
    ) -> Result<Vec<CostAnomaly>> {
        let rows = sqlx::query_as::<_, AnomalyRow>(
            r#"
            SELECT * FROM cost_anomalies
            WHERE ($1::uuid IS NULL OR subscription_id = $1)
              AND (NOT $2 OR NOT is_acknowledged)
            ORDER BY anomaly_date DESC, created_at DESC
            LIMIT $3
            "#,
        )
        .bind(subscription_id)
        .bind(unacknowledged_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CostAnomaly::try_from).collect()
    }

    /// Acknowledge an anomaly with optional notes. Acknowledgment is the
    /// only mutation an anomaly record supports.
    pub async fn acknowledge(
        &self,
        id: Uuid,
        acknowledged_by: &str,
        notes: Option<&str>,
    ) -> Result<CostAnomaly> {
        let row = sqlx::query_as::<_, AnomalyRow>(
            r#"
            UPDATE cost_anomalies
            SET is_acknowledged = true,
                acknowledged_by = $2,
                acknowledged_at = $3,
                notes = COALESCE($4, notes)
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(acknowledged_by)
        .bind(Utc::now())
        .bind(notes)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("CostAnomaly", id.to_string()))?;

        CostAnomaly::try_from(row)
    }

    /// Delete anomalies older than the retention window
    pub async fn prune_before(&self, cutoff: NaiveDate) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cost_anomalies WHERE anomaly_date < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

// Database row type for mapping

#[derive(sqlx::FromRow)]
struct AnomalyRow {
    id: Uuid,
    subscription_id: Uuid,
    anomaly_date: NaiveDate,
    service: String,
    detection_method: String,
    expected_cost: f64,
    actual_cost: f64,
    deviation_percentage: f64,
    anomaly_score: f64,
    confidence: f64,
    is_acknowledged: bool,
    acknowledged_by: Option<String>,
    acknowledged_at: Option<DateTime<Utc>>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AnomalyRow> for CostAnomaly {
    type Error = Error;

    fn try_from(row: AnomalyRow) -> Result<Self> {
        let detection_method = DetectionMethod::parse(&row.detection_method).ok_or_else(|| {
            Error::internal(format!("unknown detection method: {}", row.detection_method))
        })?;

        Ok(CostAnomaly {
            id: row.id,
            subscription_id: row.subscription_id,
            anomaly_date: row.anomaly_date,
            service: row.service,
            detection_method,
            expected_cost: row.expected_cost,
            actual_cost: row.actual_cost,
            deviation_percentage: row.deviation_percentage,
            anomaly_score: row.anomaly_score,
            confidence: row.confidence,
            is_acknowledged: row.is_acknowledged,
            acknowledged_by: row.acknowledged_by,
            acknowledged_at: row.acknowledged_at,
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}
