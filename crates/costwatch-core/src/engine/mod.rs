//! Periodic evaluation engine
//!
//! One logical pipeline invocation per subscription per tick:
//! reconcile matured forecasts, then run the budget tracker, anomaly
//! detector and forecaster concurrently, then hand all three outputs to
//! the alert rule engine. Invocations for different subscriptions run in
//! parallel; a per-subscription lease keeps two workers from evaluating
//! the same subscription at once.

pub mod lease;

pub use lease::SubscriptionLease;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::alerting::{AlertRepository, AlertRuleEngine, DispatchQueue, TickOutputs};
use crate::anomaly::{AnomalyRepository, AnomalyService};
use crate::budget::{BudgetRepository, BudgetTracker};
use crate::config::Config;
use crate::db::{CostRecordRepository, Database, RedisLease};
use crate::error::Result;
use crate::forecast::{ForecastRepository, Forecaster, Reconciler};

/// The periodic cost evaluation engine
pub struct EvaluationEngine {
    records: CostRecordRepository,
    tracker: BudgetTracker,
    anomalies: AnomalyService,
    forecaster: Forecaster,
    reconciler: Reconciler,
    rules: AlertRuleEngine,
    lease: Arc<dyn SubscriptionLease>,
    tick_interval_seconds: u64,
    lookback_days: u32,
}

impl EvaluationEngine {
    /// Wire the engine onto a database bundle
    pub fn new(db: &Database, config: &Config) -> Self {
        let records = CostRecordRepository::new(&db.postgres);
        let budgets = BudgetRepository::new(&db.postgres);
        let anomaly_repo = AnomalyRepository::new(&db.postgres);
        let forecast_repo = ForecastRepository::new(&db.postgres);
        let alert_repo = AlertRepository::new(&db.postgres);

        Self {
            records: records.clone(),
            tracker: BudgetTracker::new(records.clone(), budgets),
            anomalies: AnomalyService::new(&config.detection, anomaly_repo),
            forecaster: Forecaster::new(
                records.clone(),
                forecast_repo.clone(),
                config.forecast.clone(),
            ),
            reconciler: Reconciler::new(records, forecast_repo),
            rules: AlertRuleEngine::new(alert_repo, DispatchQueue::new(&db.redis)),
            lease: Arc::new(RedisLease::new(&db.redis, config.engine.lease_ttl_seconds)),
            tick_interval_seconds: config.engine.tick_interval_seconds,
            lookback_days: config.engine.lookback_days,
        }
    }

    /// Replace the lease implementation (tests use an in-memory one)
    pub fn with_lease(mut self, lease: Arc<dyn SubscriptionLease>) -> Self {
        self.lease = lease;
        self
    }

    /// Run the evaluation loop until the process stops
    pub async fn start(&self) {
        info!(
            interval_seconds = self.tick_interval_seconds,
            "Starting evaluation engine"
        );

        let mut ticker = interval(Duration::from_secs(self.tick_interval_seconds));

        loop {
            ticker.tick().await;

            if let Err(e) = self.run_tick().await {
                error!(error = %e, "Error running evaluation tick");
            }
        }
    }

    /// Evaluate every active subscription once. Subscriptions are
    /// independent and evaluated in parallel; one failing subscription
    /// never blocks the others.
    pub async fn run_tick(&self) -> Result<()> {
        let started = Instant::now();
        let subscriptions = self.records.active_subscriptions().await?;
        debug!(count = subscriptions.len(), "Evaluation tick");

        let results = join_all(
            subscriptions
                .iter()
                .map(|&subscription_id| self.evaluate_subscription(subscription_id)),
        )
        .await;

        for (subscription_id, result) in subscriptions.iter().zip(results) {
            if let Err(e) = result {
                error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Subscription evaluation failed; will retry next tick"
                );
            }
        }

        metrics::histogram!("costwatch_tick_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(())
    }

    /// Evaluate one subscription under its lease. Returns false when the
    /// lease is held elsewhere and the tick was skipped; the evaluation
    /// simply happens on a later tick instead.
    pub async fn evaluate_subscription(&self, subscription_id: Uuid) -> Result<bool> {
        let Some(token) = self.lease.acquire(subscription_id).await? else {
            debug!(subscription_id = %subscription_id, "Lease held elsewhere, skipping tick");
            metrics::counter!("costwatch_ticks_skipped_total").increment(1);
            return Ok(false);
        };

        let result = self.evaluate_locked(subscription_id).await;

        if let Err(release_error) = self.lease.release(subscription_id, &token).await {
            // The lease expires on its own; the next tick is not blocked
            error!(
                subscription_id = %subscription_id,
                error = %release_error,
                "Failed to release evaluation lease"
            );
        }

        result.map(|()| true)
    }

    async fn evaluate_locked(&self, subscription_id: Uuid) -> Result<()> {
        let today = Utc::now().date_naive();

        self.reconciler.run(subscription_id, today).await?;

        let from = today - chrono::Duration::days(i64::from(self.lookback_days));
        let series = self
            .records
            .daily_series(subscription_id, None, from, today)
            .await?;

        // No data dependency between the three analyzers
        let (budget_evaluations, new_anomalies, forecasts) = tokio::join!(
            self.tracker.evaluate_subscription(subscription_id, today),
            self.anomalies.detect_and_store(subscription_id, &series),
            self.forecaster.run(subscription_id, today),
        );

        // Infrastructure failures abort this subscription's tick before
        // any alert decisions are made from partial outputs; model and
        // data-quality failures were already absorbed inside each stage.
        let outputs = TickOutputs {
            budget_evaluations: budget_evaluations?,
            new_anomalies: new_anomalies?,
            forecasts: forecasts?,
            latest_daily_total: series.last().map(|p| p.total),
        };

        let alerts = self.rules.evaluate(subscription_id, &outputs, today).await?;

        metrics::counter!("costwatch_subscriptions_evaluated_total").increment(1);
        if !alerts.is_empty() {
            info!(
                subscription_id = %subscription_id,
                alerts = alerts.len(),
                "Evaluation produced alerts"
            );
        }

        Ok(())
    }
}
