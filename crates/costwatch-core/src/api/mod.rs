//! REST API implementation
//!
//! Read-only query surface for the presentation layer plus the few
//! mutations the engine exposes: budget and rule management, alert and
//! anomaly acknowledgment, and the dispatcher's delivery callback. No
//! request here ever blocks on the evaluation pipeline; reads serve the
//! last materialized results.

pub mod handlers;
pub mod routes;

pub use handlers::AppState;
pub use routes::create_router;

use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::budget::{BudgetRepository, BudgetTracker};
use crate::alerting::AlertRepository;
use crate::anomaly::AnomalyRepository;
use crate::db::{CostRecordRepository, Database};
use crate::error::Result;
use crate::forecast::ForecastRepository;

/// HTTP API server
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    /// Wire the API onto a database bundle
    pub fn new(db: &Database) -> Self {
        let records = CostRecordRepository::new(&db.postgres);
        let budgets = BudgetRepository::new(&db.postgres);

        Self {
            state: AppState {
                tracker: BudgetTracker::new(records, budgets.clone()),
                budgets,
                anomalies: AnomalyRepository::new(&db.postgres),
                forecasts: ForecastRepository::new(&db.postgres),
                alerts: AlertRepository::new(&db.postgres),
            },
        }
    }

    /// Start the HTTP server
    pub async fn serve(self, addr: &str) -> Result<()> {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = create_router(self.state).layer(cors);

        let listener = TcpListener::bind(addr).await?;

        info!("HTTP server listening on {}", addr);

        axum::serve(listener, app)
            .await
            .map_err(|e| crate::error::Error::internal(e.to_string()))?;

        Ok(())
    }
}
