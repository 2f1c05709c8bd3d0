//! PostgreSQL connection and the cost series reader

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::models::budget::BudgetFilters;
use crate::models::cost::{CostRecordInput, DailyCost, DailySeries};

/// PostgreSQL connection pool
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Create a new PostgreSQL connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Spend grouped by currency, as summed for a budget
#[derive(Debug, Clone)]
pub struct SpendByCurrency {
    /// ISO currency code
    pub currency: String,
    /// Total spend in that currency
    pub total: f64,
}

/// Read-only view over ingested daily cost records. Leaf dependency for
/// all analysis components.
#[derive(Clone)]
pub struct CostRecordRepository {
    pool: PgPool,
}

impl CostRecordRepository {
    /// Create a new cost record repository
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool.clone(),
        }
    }

    /// Insert a batch of records. Records are append-only facts; a row
    /// that already exists for (subscription, date, service,
    /// resource_group) is left untouched, which makes feed re-pulls
    /// idempotent.
    pub async fn upsert_batch(&self, records: &[CostRecordInput]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut count = 0usize;

        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO cost_records (
                    id, subscription_id, record_date, service, resource_group,
                    amount, currency, ingested_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (subscription_id, record_date, service, resource_group)
                DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(record.subscription_id)
            .bind(record.record_date)
            .bind(&record.service)
            .bind(&record.resource_group)
            .bind(record.amount)
            .bind(&record.currency)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

            count += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(count)
    }

    /// Daily series for a (subscription, optional service) scope over an
    /// inclusive date range, with per-service breakdown
    pub async fn daily_series(
        &self,
        subscription_id: Uuid,
        service: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<DailySeries> {
        let rows = sqlx::query_as::<_, (NaiveDate, String, f64)>(
            r#"
            SELECT record_date, service, SUM(amount) AS total
            FROM cost_records
            WHERE subscription_id = $1
              AND record_date BETWEEN $2 AND $3
              AND ($4::text IS NULL OR service = $4)
            GROUP BY record_date, service
            ORDER BY record_date ASC
            "#,
        )
        .bind(subscription_id)
        .bind(from)
        .bind(to)
        .bind(service)
        .fetch_all(&self.pool)
        .await?;

        let mut days: BTreeMap<NaiveDate, DailyCost> = BTreeMap::new();
        for (date, svc, total) in rows {
            let day = days.entry(date).or_insert_with(|| DailyCost {
                date,
                total: 0.0,
                by_service: Default::default(),
            });
            day.total += total;
            day.by_service.insert(svc, total);
        }

        Ok(DailySeries::new(days.into_values().collect()))
    }

    /// Total spend for one day of a subscription, None when no records
    /// have arrived for that day yet
    pub async fn daily_total(
        &self,
        subscription_id: Uuid,
        date: NaiveDate,
    ) -> Result<Option<f64>> {
        let total: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT SUM(amount)
            FROM cost_records
            WHERE subscription_id = $1 AND record_date = $2
            "#,
        )
        .bind(subscription_id)
        .bind(date)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    /// Spend matching a budget's filters over an inclusive date range,
    /// grouped by record currency. Currencies are never summed together;
    /// the tracker decides what a mixed result means.
    pub async fn spend_matching(
        &self,
        subscription_id: Uuid,
        filters: &BudgetFilters,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<SpendByCurrency>> {
        let rows = sqlx::query_as::<_, (String, f64)>(
            r#"
            SELECT currency, SUM(amount) AS total
            FROM cost_records
            WHERE subscription_id = $1
              AND record_date BETWEEN $2 AND $3
              AND (cardinality($4::text[]) = 0 OR service = ANY($4))
              AND (cardinality($5::text[]) = 0 OR resource_group = ANY($5))
            GROUP BY currency
            "#,
        )
        .bind(subscription_id)
        .bind(from)
        .bind(to)
        .bind(&filters.services)
        .bind(&filters.resource_groups)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(currency, total)| SpendByCurrency { currency, total })
            .collect())
    }

    /// Subscriptions with any active budget or alert rule; the set the
    /// scheduler iterates on every tick
    pub async fn active_subscriptions(&self) -> Result<Vec<Uuid>> {
        let rows: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT subscription_id FROM budgets WHERE is_active
            UNION
            SELECT DISTINCT subscription_id FROM alert_rules WHERE is_active
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Delete records older than the retention window
    pub async fn prune_before(&self, cutoff: NaiveDate) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cost_records WHERE record_date < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
