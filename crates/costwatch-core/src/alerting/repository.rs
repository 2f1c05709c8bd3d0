//! Alert repository for rules and alerts
//!
//! Rule firing and alert transitions are transactional: the cooldown
//! check reads `last_triggered` under a row lock in the same transaction
//! that updates it, so two near-simultaneous ticks cannot both observe a
//! stale "not in cooldown" state.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::PostgresPool;
use crate::error::{Error, Result};
use crate::models::alert::{
    Alert, AlertRule, AlertRuleInput, AlertStatus, NotificationChannel, RuleType, Severity,
};

use super::engine::{in_cooldown, Firing};

/// Repository for alert rules and alerts
#[derive(Clone)]
pub struct AlertRepository {
    pool: PgPool,
}

impl AlertRepository {
    /// Create a new alert repository
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    // --- Alert rules ---

    /// Create a new alert rule. Conditions are validated up front so a
    /// rule that would be disabled on first evaluation is rejected here
    /// instead.
    pub async fn create_rule(&self, input: AlertRuleInput) -> Result<AlertRule> {
        let now = Utc::now();
        let rule = AlertRule {
            id: Uuid::new_v4(),
            subscription_id: input.subscription_id,
            name: input.name,
            rule_type: input.rule_type,
            severity: input.severity,
            conditions: input.conditions,
            notification_channels: input.notification_channels,
            cooldown_minutes: input.cooldown_minutes,
            is_active: input.is_active,
            last_triggered: None,
            trigger_count: 0,
            created_at: now,
            updated_at: now,
        };

        rule.parsed_conditions()
            .map_err(|e| Error::validation(format!("invalid conditions: {e}")))?;
        if rule.cooldown_minutes < 0 {
            return Err(Error::validation("cooldown_minutes must be non-negative"));
        }

        let channels_json = serde_json::to_value(&rule.notification_channels)?;

        sqlx::query(
            r#"
            INSERT INTO alert_rules (
                id, subscription_id, name, rule_type, severity, conditions,
                notification_channels, cooldown_minutes, is_active,
                trigger_count, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(rule.id)
        .bind(rule.subscription_id)
        .bind(&rule.name)
        .bind(rule.rule_type.as_str())
        .bind(rule.severity.as_str())
        .bind(&rule.conditions)
        .bind(&channels_json)
        .bind(rule.cooldown_minutes)
        .bind(rule.is_active)
        .bind(rule.trigger_count)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(rule)
    }

    /// Update a rule, keeping its trigger bookkeeping. Conditions are
    /// validated before anything is written.
    pub async fn update_rule(&self, id: Uuid, input: AlertRuleInput) -> Result<Option<AlertRule>> {
        let probe = AlertRule {
            id,
            subscription_id: input.subscription_id,
            name: input.name.clone(),
            rule_type: input.rule_type,
            severity: input.severity,
            conditions: input.conditions.clone(),
            notification_channels: vec![],
            cooldown_minutes: input.cooldown_minutes,
            is_active: input.is_active,
            last_triggered: None,
            trigger_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        probe
            .parsed_conditions()
            .map_err(|e| Error::validation(format!("invalid conditions: {e}")))?;

        let channels_json = serde_json::to_value(&input.notification_channels)?;

        let result = sqlx::query(
            r#"
            UPDATE alert_rules SET
                name = $2,
                rule_type = $3,
                severity = $4,
                conditions = $5,
                notification_channels = $6,
                cooldown_minutes = $7,
                is_active = $8,
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&input.name)
        .bind(input.rule_type.as_str())
        .bind(input.severity.as_str())
        .bind(&input.conditions)
        .bind(&channels_json)
        .bind(input.cooldown_minutes)
        .bind(input.is_active)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_rule(id).await
    }

    /// Get a rule by ID
    pub async fn get_rule(&self, id: Uuid) -> Result<Option<AlertRule>> {
        let row = sqlx::query_as::<_, AlertRuleRow>("SELECT * FROM alert_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(AlertRule::try_from).transpose()
    }

    /// List rules, optionally scoped to a subscription
    pub async fn list_rules(&self, subscription_id: Option<Uuid>) -> Result<Vec<AlertRule>> {
        let rows = sqlx::query_as::<_, AlertRuleRow>(
            r#"
            SELECT * FROM alert_rules
            WHERE ($1::uuid IS NULL OR subscription_id = $1)
            ORDER BY created_at DESC
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AlertRule::try_from).collect()
    }

    /// List active rules for a subscription
    pub async fn list_active(&self, subscription_id: Uuid) -> Result<Vec<AlertRule>> {
        let rows = sqlx::query_as::<_, AlertRuleRow>(
            r#"
            SELECT * FROM alert_rules
            WHERE subscription_id = $1 AND is_active
            ORDER BY created_at ASC
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AlertRule::try_from).collect()
    }

    /// Delete a rule
    pub async fn delete_rule(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM alert_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Disable a rule (fatal configuration error path)
    pub async fn disable_rule(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE alert_rules SET is_active = false, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // --- Firing ---

    /// Record a rule fire. `last_triggered` and `trigger_count` are
    /// always updated; the alert row is only created when the rule is
    /// outside its cooldown window. The persisted `last_triggered` is
    /// read under `FOR UPDATE` in the same transaction that writes it.
    pub async fn fire_rule(&self, rule: &AlertRule, firing: &Firing) -> Result<Option<Alert>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let last_triggered: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT last_triggered FROM alert_rules WHERE id = $1 FOR UPDATE",
        )
        .bind(rule.id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::not_found("AlertRule", rule.id.to_string()))?;

        sqlx::query(
            r#"
            UPDATE alert_rules
            SET last_triggered = $2, trigger_count = trigger_count + 1
            WHERE id = $1
            "#,
        )
        .bind(rule.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if in_cooldown(last_triggered, rule.cooldown_minutes, now) {
            tx.commit().await?;
            return Ok(None);
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            subscription_id: rule.subscription_id,
            rule_id: Some(rule.id),
            title: firing.title.clone(),
            message: firing.message.clone(),
            severity: rule.severity,
            alert_type: rule.rule_type,
            triggered_value: firing.triggered_value,
            threshold_value: firing.threshold_value,
            status: AlertStatus::Active,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            notification_sent: false,
            created_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO alerts (
                id, subscription_id, rule_id, title, message, severity,
                alert_type, triggered_value, threshold_value, status,
                notification_sent, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(alert.id)
        .bind(alert.subscription_id)
        .bind(alert.rule_id)
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(alert.severity.as_str())
        .bind(alert.alert_type.as_str())
        .bind(alert.triggered_value)
        .bind(alert.threshold_value)
        .bind(alert.status.as_str())
        .bind(alert.notification_sent)
        .bind(alert.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(alert))
    }

    // --- Alerts ---

    /// Get an alert by ID
    pub async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>> {
        let row = sqlx::query_as::<_, AlertRow>("SELECT * FROM alerts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Alert::try_from).transpose()
    }

    /// List alerts, newest first
    pub async fn list_alerts(
        &self,
        subscription_id: Option<Uuid>,
        status: Option<AlertStatus>,
        limit: i64,
    ) -> Result<Vec<Alert>> {
        let rows = sqlx::query_as::<_, AlertRow>(
            r#"
            SELECT * FROM alerts
            WHERE ($1::uuid IS NULL OR subscription_id = $1)
              AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(subscription_id)
        .bind(status.map(AlertStatus::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Alert::try_from).collect()
    }

    /// Apply a validated status transition, recording the acting user
    /// and timestamp. The row is locked for the read-validate-write.
    pub async fn transition_alert(
        &self,
        id: Uuid,
        to: AlertStatus,
        actor: &str,
    ) -> Result<Alert> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, AlertRow>("SELECT * FROM alerts WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::not_found("Alert", id.to_string()))?;

        let mut alert = Alert::try_from(row)?;
        alert.transition(to, actor, Utc::now())?;

        sqlx::query(
            r#"
            UPDATE alerts SET
                status = $2,
                acknowledged_by = $3,
                acknowledged_at = $4,
                resolved_by = $5,
                resolved_at = $6
            WHERE id = $1
            "#,
        )
        .bind(alert.id)
        .bind(alert.status.as_str())
        .bind(&alert.acknowledged_by)
        .bind(alert.acknowledged_at)
        .bind(&alert.resolved_by)
        .bind(alert.resolved_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(alert)
    }

    /// Record confirmed delivery. One-way: the flag is never unset.
    pub async fn set_notification_sent(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE alerts SET notification_sent = true WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

// Database row types for mapping

#[derive(sqlx::FromRow)]
struct AlertRuleRow {
    id: Uuid,
    subscription_id: Uuid,
    name: String,
    rule_type: String,
    severity: String,
    conditions: serde_json::Value,
    notification_channels: serde_json::Value,
    cooldown_minutes: i32,
    is_active: bool,
    last_triggered: Option<DateTime<Utc>>,
    trigger_count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AlertRuleRow> for AlertRule {
    type Error = Error;

    fn try_from(row: AlertRuleRow) -> Result<Self> {
        let rule_type = RuleType::parse(&row.rule_type)
            .ok_or_else(|| Error::internal(format!("unknown rule type: {}", row.rule_type)))?;
        let severity = Severity::parse(&row.severity)
            .ok_or_else(|| Error::internal(format!("unknown severity: {}", row.severity)))?;
        let notification_channels: Vec<NotificationChannel> =
            serde_json::from_value(row.notification_channels)?;

        Ok(AlertRule {
            id: row.id,
            subscription_id: row.subscription_id,
            name: row.name,
            rule_type,
            severity,
            conditions: row.conditions,
            notification_channels,
            cooldown_minutes: row.cooldown_minutes,
            is_active: row.is_active,
            last_triggered: row.last_triggered,
            trigger_count: row.trigger_count,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: Uuid,
    subscription_id: Uuid,
    rule_id: Option<Uuid>,
    title: String,
    message: String,
    severity: String,
    alert_type: String,
    triggered_value: f64,
    threshold_value: f64,
    status: String,
    acknowledged_by: Option<String>,
    acknowledged_at: Option<DateTime<Utc>>,
    resolved_by: Option<String>,
    resolved_at: Option<DateTime<Utc>>,
    notification_sent: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = Error;

    fn try_from(row: AlertRow) -> Result<Self> {
        let severity = Severity::parse(&row.severity)
            .ok_or_else(|| Error::internal(format!("unknown severity: {}", row.severity)))?;
        let alert_type = RuleType::parse(&row.alert_type)
            .ok_or_else(|| Error::internal(format!("unknown alert type: {}", row.alert_type)))?;
        let status = AlertStatus::parse(&row.status)
            .ok_or_else(|| Error::internal(format!("unknown alert status: {}", row.status)))?;

        Ok(Alert {
            id: row.id,
            subscription_id: row.subscription_id,
            rule_id: row.rule_id,
            title: row.title,
            message: row.message,
            severity,
            alert_type,
            triggered_value: row.triggered_value,
            threshold_value: row.threshold_value,
            status,
            acknowledged_by: row.acknowledged_by,
            acknowledged_at: row.acknowledged_at,
            resolved_by: row.resolved_by,
            resolved_at: row.resolved_at,
            notification_sent: row.notification_sent,
            created_at: row.created_at,
        })
    }
}
