//! Budget repository for storing and querying budgets and thresholds

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::PostgresPool;
use crate::error::{Error, Result};
use crate::models::alert::NotificationChannel;
use crate::models::budget::{
    Budget, BudgetFilters, BudgetInput, BudgetPeriod, BudgetStatus, BudgetThreshold,
};

/// Repository for budgets and their thresholds
#[derive(Clone)]
pub struct BudgetRepository {
    pool: PgPool,
}

impl BudgetRepository {
    /// Create a new budget repository
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    /// Create a new budget with its thresholds
    pub async fn create(&self, input: BudgetInput) -> Result<Budget> {
        if input.amount <= 0.0 {
            return Err(Error::validation("budget amount must be positive"));
        }
        if let Some(end) = input.end_date {
            if end < input.start_date {
                return Err(Error::validation("end_date precedes start_date"));
            }
        }

        let now = Utc::now();
        let budget = Budget {
            id: Uuid::new_v4(),
            subscription_id: input.subscription_id,
            name: input.name,
            amount: input.amount,
            currency: input.currency,
            period: input.period,
            start_date: input.start_date,
            end_date: input.end_date,
            filters: input.filters,
            is_active: input.is_active,
            last_status: None,
            created_at: now,
            updated_at: now,
        };

        let filters_json = serde_json::to_value(&budget.filters)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO budgets (
                id, subscription_id, name, amount, currency, period,
                start_date, end_date, filters, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(budget.id)
        .bind(budget.subscription_id)
        .bind(&budget.name)
        .bind(budget.amount)
        .bind(&budget.currency)
        .bind(budget.period.as_str())
        .bind(budget.start_date)
        .bind(budget.end_date)
        .bind(&filters_json)
        .bind(budget.is_active)
        .bind(budget.created_at)
        .bind(budget.updated_at)
        .execute(&mut *tx)
        .await?;

        for threshold in &input.thresholds {
            if !(0.0..=200.0).contains(&threshold.percentage) {
                return Err(Error::validation(format!(
                    "threshold percentage out of range: {}",
                    threshold.percentage
                )));
            }
            let channels_json = serde_json::to_value(&threshold.notification_channels)?;
            sqlx::query(
                r#"
                INSERT INTO budget_thresholds (
                    id, budget_id, percentage, notification_channels, is_active
                )
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(budget.id)
            .bind(threshold.percentage)
            .bind(&channels_json)
            .bind(threshold.is_active)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(budget)
    }

    /// Update a budget. Replaces thresholds when the input carries any;
    /// replaced thresholds start re-armed.
    pub async fn update(&self, id: Uuid, input: BudgetInput) -> Result<Option<Budget>> {
        if input.amount <= 0.0 {
            return Err(Error::validation("budget amount must be positive"));
        }

        let filters_json = serde_json::to_value(&input.filters)?;

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE budgets SET
                name = $2,
                amount = $3,
                currency = $4,
                period = $5,
                start_date = $6,
                end_date = $7,
                filters = $8,
                is_active = $9,
                updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(input.amount)
        .bind(&input.currency)
        .bind(input.period.as_str())
        .bind(input.start_date)
        .bind(input.end_date)
        .bind(&filters_json)
        .bind(input.is_active)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        if !input.thresholds.is_empty() {
            sqlx::query("DELETE FROM budget_thresholds WHERE budget_id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            for threshold in &input.thresholds {
                let channels_json = serde_json::to_value(&threshold.notification_channels)?;
                sqlx::query(
                    r#"
                    INSERT INTO budget_thresholds (
                        id, budget_id, percentage, notification_channels, is_active
                    )
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(id)
                .bind(threshold.percentage)
                .bind(&channels_json)
                .bind(threshold.is_active)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        self.get(id).await
    }

    /// Get a budget by ID
    pub async fn get(&self, id: Uuid) -> Result<Option<Budget>> {
        let row = sqlx::query_as::<_, BudgetRow>("SELECT * FROM budgets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Budget::try_from).transpose()
    }

    /// List budgets, optionally scoped to a subscription
    pub async fn list(&self, subscription_id: Option<Uuid>) -> Result<Vec<Budget>> {
        let rows = sqlx::query_as::<_, BudgetRow>(
            r#"
            SELECT * FROM budgets
            WHERE ($1::uuid IS NULL OR subscription_id = $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Budget::try_from).collect()
    }

    /// List active budgets for a subscription
    pub async fn list_active(&self, subscription_id: Uuid) -> Result<Vec<Budget>> {
        let rows = sqlx::query_as::<_, BudgetRow>(
            r#"
            SELECT * FROM budgets
            WHERE subscription_id = $1 AND is_active
            ORDER BY created_at ASC
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Budget::try_from).collect()
    }

    /// Thresholds of a budget, lowest percentage first
    pub async fn thresholds_for_budget(&self, budget_id: Uuid) -> Result<Vec<BudgetThreshold>> {
        let rows = sqlx::query_as::<_, ThresholdRow>(
            r#"
            SELECT * FROM budget_thresholds
            WHERE budget_id = $1
            ORDER BY percentage ASC
            "#,
        )
        .bind(budget_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BudgetThreshold::try_from).collect()
    }

    /// Mark a threshold as triggered. It stays disarmed until the budget
    /// period advances past this instant.
    pub async fn mark_threshold_triggered(
        &self,
        threshold_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE budget_thresholds SET last_triggered = $2 WHERE id = $1")
            .bind(threshold_id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Record the status observed by the latest evaluation (bookkeeping
    /// for edge-triggered budget rules)
    pub async fn set_last_status(&self, budget_id: Uuid, status: BudgetStatus) -> Result<()> {
        sqlx::query("UPDATE budgets SET last_status = $2 WHERE id = $1")
            .bind(budget_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

// Database row types for mapping

#[derive(sqlx::FromRow)]
struct BudgetRow {
    id: Uuid,
    subscription_id: Uuid,
    name: String,
    amount: f64,
    currency: String,
    period: String,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    filters: serde_json::Value,
    is_active: bool,
    last_status: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BudgetRow> for Budget {
    type Error = Error;

    fn try_from(row: BudgetRow) -> Result<Self> {
        let period = BudgetPeriod::parse(&row.period)
            .ok_or_else(|| Error::internal(format!("unknown budget period: {}", row.period)))?;
        let last_status = row
            .last_status
            .as_deref()
            .map(|s| {
                BudgetStatus::parse(s)
                    .ok_or_else(|| Error::internal(format!("unknown budget status: {s}")))
            })
            .transpose()?;
        let filters: BudgetFilters = serde_json::from_value(row.filters)?;

        Ok(Budget {
            id: row.id,
            subscription_id: row.subscription_id,
            name: row.name,
            amount: row.amount,
            currency: row.currency,
            period,
            start_date: row.start_date,
            end_date: row.end_date,
            filters,
            is_active: row.is_active,
            last_status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ThresholdRow {
    id: Uuid,
    budget_id: Uuid,
    percentage: f64,
    notification_channels: serde_json::Value,
    is_active: bool,
    last_triggered: Option<DateTime<Utc>>,
}

impl TryFrom<ThresholdRow> for BudgetThreshold {
    type Error = Error;

    fn try_from(row: ThresholdRow) -> Result<Self> {
        let notification_channels: Vec<NotificationChannel> =
            serde_json::from_value(row.notification_channels)?;

        Ok(BudgetThreshold {
            id: row.id,
            budget_id: row.budget_id,
            percentage: row.percentage,
            notification_channels,
            is_active: row.is_active,
            last_triggered: row.last_triggered,
        })
    }
}
