//! API routes

use axum::{
    routing::{delete, get, post, put},
    Router,
};

use super::handlers::{self, AppState};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))

        // Budgets
        .route("/api/v1/budgets", get(handlers::list_budgets))
        .route("/api/v1/budgets", post(handlers::create_budget))
        .route("/api/v1/budgets/:budget_id", get(handlers::get_budget))
        .route("/api/v1/budgets/:budget_id", put(handlers::update_budget))
        .route("/api/v1/budgets/:budget_id/status", get(handlers::budget_status))

        // Anomalies
        .route("/api/v1/anomalies", get(handlers::list_anomalies))
        .route("/api/v1/anomalies/:anomaly_id/acknowledge", post(handlers::acknowledge_anomaly))

        // Forecasts
        .route("/api/v1/forecasts", get(handlers::list_forecasts))

        // Alert rules
        .route("/api/v1/alerts/rules", get(handlers::list_alert_rules))
        .route("/api/v1/alerts/rules", post(handlers::create_alert_rule))
        .route("/api/v1/alerts/rules/:rule_id", get(handlers::get_alert_rule))
        .route("/api/v1/alerts/rules/:rule_id", put(handlers::update_alert_rule))
        .route("/api/v1/alerts/rules/:rule_id", delete(handlers::delete_alert_rule))

        // Alerts
        .route("/api/v1/alerts", get(handlers::list_alerts))
        .route("/api/v1/alerts/:alert_id", get(handlers::get_alert))
        .route("/api/v1/alerts/:alert_id/acknowledge", post(handlers::acknowledge_alert))
        .route("/api/v1/alerts/:alert_id/resolve", post(handlers::resolve_alert))
        .route("/api/v1/alerts/:alert_id/dismiss", post(handlers::dismiss_alert))
        .route("/api/v1/alerts/:alert_id/delivery", post(handlers::report_delivery))

        .with_state(state)
}
