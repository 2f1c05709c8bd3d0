//! API handlers for the HTTP REST API

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alerting::{AlertRepository, DeliveryReport};
use crate::anomaly::AnomalyRepository;
use crate::budget::{BudgetRepository, BudgetTracker};
use crate::error::Error;
use crate::forecast::ForecastRepository;
use crate::models::alert::{Alert, AlertRule, AlertRuleInput, AlertStatus};
use crate::models::anomaly::CostAnomaly;
use crate::models::budget::{Budget, BudgetInput, BudgetStatus};
use crate::models::forecast::{CostForecast, ForecastModelKind};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub budgets: BudgetRepository,
    pub tracker: BudgetTracker,
    pub anomalies: AnomalyRepository,
    pub forecasts: ForecastRepository,
    pub alerts: AlertRepository,
}

type ApiError = (StatusCode, String);

fn error_response(error: Error) -> ApiError {
    let status = match &error {
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::Validation(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
        Error::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string())
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// --- Budgets ---

/// Query parameters for listing budgets
#[derive(Debug, Deserialize)]
pub struct ListBudgetsQuery {
    pub subscription_id: Option<Uuid>,
}

/// List budgets
pub async fn list_budgets(
    State(state): State<AppState>,
    Query(query): Query<ListBudgetsQuery>,
) -> Result<Json<Vec<Budget>>, ApiError> {
    let budgets = state
        .budgets
        .list(query.subscription_id)
        .await
        .map_err(error_response)?;
    Ok(Json(budgets))
}

/// Create a budget
pub async fn create_budget(
    State(state): State<AppState>,
    Json(input): Json<BudgetInput>,
) -> Result<(StatusCode, Json<Budget>), ApiError> {
    let budget = state.budgets.create(input).await.map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(budget)))
}

/// Get a budget
pub async fn get_budget(
    State(state): State<AppState>,
    Path(budget_id): Path<Uuid>,
) -> Result<Json<Budget>, ApiError> {
    let budget = state
        .budgets
        .get(budget_id)
        .await
        .map_err(error_response)?
        .ok_or((StatusCode::NOT_FOUND, "Budget not found".to_string()))?;
    Ok(Json(budget))
}

/// Update a budget
pub async fn update_budget(
    State(state): State<AppState>,
    Path(budget_id): Path<Uuid>,
    Json(input): Json<BudgetInput>,
) -> Result<Json<Budget>, ApiError> {
    let budget = state
        .budgets
        .update(budget_id, input)
        .await
        .map_err(error_response)?
        .ok_or((StatusCode::NOT_FOUND, "Budget not found".to_string()))?;
    Ok(Json(budget))
}

/// Computed status of a budget
#[derive(Serialize)]
pub struct BudgetStatusResponse {
    pub budget_id: Uuid,
    pub current_spend: f64,
    pub percentage_used: f64,
    pub amount_remaining: f64,
    pub status: BudgetStatus,
    pub currency_mismatch: bool,
    pub period_start: chrono::NaiveDate,
    pub period_end: chrono::NaiveDate,
}

/// Recompute and return a budget's derived status. Read-only; never
/// touches threshold state.
pub async fn budget_status(
    State(state): State<AppState>,
    Path(budget_id): Path<Uuid>,
) -> Result<Json<BudgetStatusResponse>, ApiError> {
    let budget = state
        .budgets
        .get(budget_id)
        .await
        .map_err(error_response)?
        .ok_or((StatusCode::NOT_FOUND, "Budget not found".to_string()))?;

    let evaluation = state
        .tracker
        .peek(&budget, Utc::now().date_naive())
        .await
        .map_err(error_response)?;

    Ok(Json(BudgetStatusResponse {
        budget_id: budget.id,
        current_spend: evaluation.current_spend,
        percentage_used: evaluation.percentage_used,
        amount_remaining: evaluation.amount_remaining,
        status: evaluation.status,
        currency_mismatch: evaluation.currency_mismatch,
        period_start: evaluation.period_start,
        period_end: evaluation.period_end,
    }))
}

// --- Anomalies ---

/// Query parameters for listing anomalies
#[derive(Debug, Deserialize)]
pub struct ListAnomaliesQuery {
    pub subscription_id: Option<Uuid>,
    #[serde(default)]
    pub unacknowledged_only: bool,
    pub limit: Option<i64>,
}

/// List anomalies
pub async fn list_anomalies(
    State(state): State<AppState>,
    Query(query): Query<ListAnomaliesQuery>,
) -> Result<Json<Vec<CostAnomaly>>, ApiError> {
    let anomalies = state
        .anomalies
        .list(
            query.subscription_id,
            query.unacknowledged_only,
            query.limit.unwrap_or(100),
        )
        .await
        .map_err(error_response)?;
    Ok(Json(anomalies))
}

/// Request body for acknowledging an anomaly
#[derive(Debug, Deserialize)]
pub struct AcknowledgeAnomalyRequest {
    pub acknowledged_by: String,
    pub notes: Option<String>,
}

/// Acknowledge an anomaly with optional notes
pub async fn acknowledge_anomaly(
    State(state): State<AppState>,
    Path(anomaly_id): Path<Uuid>,
    Json(request): Json<AcknowledgeAnomalyRequest>,
) -> Result<Json<CostAnomaly>, ApiError> {
    let anomaly = state
        .anomalies
        .acknowledge(anomaly_id, &request.acknowledged_by, request.notes.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(anomaly))
}

// --- Forecasts ---

/// Query parameters for listing forecasts
#[derive(Debug, Deserialize)]
pub struct ListForecastsQuery {
    pub subscription_id: Option<Uuid>,
    pub model: Option<ForecastModelKind>,
    pub limit: Option<i64>,
}

/// List forecasts
pub async fn list_forecasts(
    State(state): State<AppState>,
    Query(query): Query<ListForecastsQuery>,
) -> Result<Json<Vec<CostForecast>>, ApiError> {
    let forecasts = state
        .forecasts
        .list(query.subscription_id, query.model, query.limit.unwrap_or(100))
        .await
        .map_err(error_response)?;
    Ok(Json(forecasts))
}

// --- Alert rules ---

/// Query parameters for listing rules
#[derive(Debug, Deserialize)]
pub struct ListRulesQuery {
    pub subscription_id: Option<Uuid>,
}

/// List alert rules
pub async fn list_alert_rules(
    State(state): State<AppState>,
    Query(query): Query<ListRulesQuery>,
) -> Result<Json<Vec<AlertRule>>, ApiError> {
    let rules = state
        .alerts
        .list_rules(query.subscription_id)
        .await
        .map_err(error_response)?;
    Ok(Json(rules))
}

/// Create an alert rule
pub async fn create_alert_rule(
    State(state): State<AppState>,
    Json(input): Json<AlertRuleInput>,
) -> Result<(StatusCode, Json<AlertRule>), ApiError> {
    let rule = state
        .alerts
        .create_rule(input)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

/// Get an alert rule
pub async fn get_alert_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<Uuid>,
) -> Result<Json<AlertRule>, ApiError> {
    let rule = state
        .alerts
        .get_rule(rule_id)
        .await
        .map_err(error_response)?
        .ok_or((StatusCode::NOT_FOUND, "AlertRule not found".to_string()))?;
    Ok(Json(rule))
}

/// Update an alert rule
pub async fn update_alert_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<Uuid>,
    Json(input): Json<AlertRuleInput>,
) -> Result<Json<AlertRule>, ApiError> {
    let rule = state
        .alerts
        .update_rule(rule_id, input)
        .await
        .map_err(error_response)?
        .ok_or((StatusCode::NOT_FOUND, "AlertRule not found".to_string()))?;
    Ok(Json(rule))
}

/// Delete an alert rule
pub async fn delete_alert_rule(
    State(state): State<AppState>,
    Path(rule_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let deleted = state
        .alerts
        .delete_rule(rule_id)
        .await
        .map_err(error_response)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, "AlertRule not found".to_string()))
    }
}

// --- Alerts ---

/// Query parameters for listing alerts
#[derive(Debug, Deserialize)]
pub struct ListAlertsQuery {
    pub subscription_id: Option<Uuid>,
    pub status: Option<AlertStatus>,
    pub limit: Option<i64>,
}

/// List alerts
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<ListAlertsQuery>,
) -> Result<Json<Vec<Alert>>, ApiError> {
    let alerts = state
        .alerts
        .list_alerts(query.subscription_id, query.status, query.limit.unwrap_or(100))
        .await
        .map_err(error_response)?;
    Ok(Json(alerts))
}

/// Get an alert
pub async fn get_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<Uuid>,
) -> Result<Json<Alert>, ApiError> {
    let alert = state
        .alerts
        .get_alert(alert_id)
        .await
        .map_err(error_response)?
        .ok_or((StatusCode::NOT_FOUND, "Alert not found".to_string()))?;
    Ok(Json(alert))
}

/// Request body for alert transitions
#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub by: String,
}

/// Acknowledge an alert
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> Result<Json<Alert>, ApiError> {
    transition(&state, alert_id, AlertStatus::Acknowledged, &request.by).await
}

/// Resolve an alert
pub async fn resolve_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> Result<Json<Alert>, ApiError> {
    transition(&state, alert_id, AlertStatus::Resolved, &request.by).await
}

/// Dismiss an alert
pub async fn dismiss_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> Result<Json<Alert>, ApiError> {
    transition(&state, alert_id, AlertStatus::Dismissed, &request.by).await
}

async fn transition(
    state: &AppState,
    alert_id: Uuid,
    to: AlertStatus,
    actor: &str,
) -> Result<Json<Alert>, ApiError> {
    let alert = state
        .alerts
        .transition_alert(alert_id, to, actor)
        .await
        .map_err(error_response)?;
    Ok(Json(alert))
}

/// Dispatcher callback reporting per-channel delivery outcomes. Success
/// on any channel marks the alert as notified; the flag is never unset.
pub async fn report_delivery(
    State(state): State<AppState>,
    Path(alert_id): Path<Uuid>,
    Json(report): Json<DeliveryReport>,
) -> Result<StatusCode, ApiError> {
    if report.any_succeeded() {
        state
            .alerts
            .set_notification_sent(alert_id)
            .await
            .map_err(error_response)?;
    }
    Ok(StatusCode::NO_CONTENT)
}
