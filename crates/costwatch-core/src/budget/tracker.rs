//! Budget spend tracking and threshold crossing detection
//!
//! Spend, percentage and status are recomputed from the record set on
//! every evaluation; nothing here trusts a stored derived value, so a
//! recomputation is idempotent and side-effect-free. Persistent side
//! effects (threshold trigger marks, the last-status bookkeeping for
//! edge-triggered rules) happen in [`BudgetTracker::evaluate_subscription`]
//! after the pure evaluation.

use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{CostRecordRepository, SpendByCurrency};
use crate::error::Result;
use crate::models::alert::NotificationChannel;
use crate::models::budget::{Budget, BudgetStatus, BudgetThreshold};

use super::repository::BudgetRepository;

/// A threshold crossing signal, consumed by the alert rule engine
#[derive(Debug, Clone)]
pub struct ThresholdCrossing {
    /// Budget whose threshold was crossed
    pub budget_id: Uuid,
    /// The crossed threshold
    pub threshold_id: Uuid,
    /// Configured threshold percentage
    pub percentage: f64,
    /// Spend percentage at crossing time
    pub percentage_used: f64,
    /// Channels configured on the threshold
    pub channels: Vec<NotificationChannel>,
}

/// Computed state of one budget for one evaluation
#[derive(Debug, Clone)]
pub struct BudgetEvaluation {
    /// The evaluated budget
    pub budget: Budget,
    /// Sum of matching spend in the budget's currency
    pub current_spend: f64,
    /// current_spend / amount * 100
    pub percentage_used: f64,
    /// amount - current_spend; negative once exceeded
    pub amount_remaining: f64,
    /// Computed status
    pub status: BudgetStatus,
    /// Records in a different currency matched the filters; their spend
    /// is excluded from the percentage rather than silently summed
    pub currency_mismatch: bool,
    /// Spend per foreign currency, reported in its native currency
    pub foreign_spend: Vec<SpendByCurrency>,
    /// Thresholds that crossed on this evaluation and were still armed
    pub crossings: Vec<ThresholdCrossing>,
    /// Status moved into exceeded on this evaluation (edge, not level)
    pub newly_exceeded: bool,
    /// First day of the current budget period
    pub period_start: NaiveDate,
    /// Last day of the current budget period
    pub period_end: NaiveDate,
}

/// Pure budget evaluation over pre-fetched spend sums.
pub fn evaluate_budget(
    budget: &Budget,
    thresholds: &[BudgetThreshold],
    spend: &[SpendByCurrency],
    today: NaiveDate,
) -> BudgetEvaluation {
    let period_start = budget.current_period_start(today);
    let period_end = budget.current_period_end(today);
    let period_start_at = budget.current_period_start_at(today);

    let current_spend: f64 = spend
        .iter()
        .filter(|s| s.currency == budget.currency)
        .map(|s| s.total)
        .sum();
    let foreign_spend: Vec<SpendByCurrency> = spend
        .iter()
        .filter(|s| s.currency != budget.currency && s.total != 0.0)
        .cloned()
        .collect();
    let currency_mismatch = !foreign_spend.is_empty();

    let percentage_used = if budget.amount > 0.0 {
        current_spend / budget.amount * 100.0
    } else {
        0.0
    };

    let status = if percentage_used >= 100.0 {
        BudgetStatus::Exceeded
    } else if thresholds
        .iter()
        .any(|t| t.is_active && t.percentage <= percentage_used)
    {
        BudgetStatus::Warning
    } else {
        BudgetStatus::Ok
    };

    let crossings = thresholds
        .iter()
        .filter(|t| t.percentage <= percentage_used && t.is_armed(period_start_at))
        .map(|t| ThresholdCrossing {
            budget_id: budget.id,
            threshold_id: t.id,
            percentage: t.percentage,
            percentage_used,
            channels: t.notification_channels.clone(),
        })
        .collect();

    let newly_exceeded =
        status == BudgetStatus::Exceeded && budget.last_status != Some(BudgetStatus::Exceeded);

    BudgetEvaluation {
        budget: budget.clone(),
        current_spend,
        percentage_used,
        amount_remaining: budget.amount - current_spend,
        status,
        currency_mismatch,
        foreign_spend,
        crossings,
        newly_exceeded,
        period_start,
        period_end,
    }
}

/// Evaluates every active budget of a subscription against its records
#[derive(Clone)]
pub struct BudgetTracker {
    records: CostRecordRepository,
    budgets: BudgetRepository,
}

impl BudgetTracker {
    /// Create a new budget tracker
    pub fn new(records: CostRecordRepository, budgets: BudgetRepository) -> Self {
        Self { records, budgets }
    }

    /// Evaluate all active budgets for a subscription. Marks crossed
    /// thresholds as triggered and records the observed status, so a
    /// threshold fires at most once per budget period no matter how
    /// often spend is recomputed above it.
    pub async fn evaluate_subscription(
        &self,
        subscription_id: Uuid,
        today: NaiveDate,
    ) -> Result<Vec<BudgetEvaluation>> {
        let now = Utc::now();
        let budgets = self.budgets.list_active(subscription_id).await?;
        let mut evaluations = Vec::with_capacity(budgets.len());

        for budget in budgets {
            let thresholds = self.budgets.thresholds_for_budget(budget.id).await?;

            let window_start = budget.current_period_start(today);
            let window_end = match budget.end_date {
                Some(end) if end < today => end,
                _ => today,
            };
            if window_end < window_start {
                debug!(budget_id = %budget.id, "Budget window not yet started");
                continue;
            }

            let spend = self
                .records
                .spend_matching(subscription_id, &budget.filters, window_start, window_end)
                .await?;

            let evaluation = evaluate_budget(&budget, &thresholds, &spend, today);

            if evaluation.currency_mismatch {
                warn!(
                    budget_id = %budget.id,
                    currency = %budget.currency,
                    foreign = ?evaluation
                        .foreign_spend
                        .iter()
                        .map(|s| s.currency.as_str())
                        .collect::<Vec<_>>(),
                    "currency_mismatch: records in a foreign currency excluded from spend"
                );
            }

            for crossing in &evaluation.crossings {
                self.budgets
                    .mark_threshold_triggered(crossing.threshold_id, now)
                    .await?;
            }

            if budget.last_status != Some(evaluation.status) {
                self.budgets
                    .set_last_status(budget.id, evaluation.status)
                    .await?;
            }

            evaluations.push(evaluation);
        }

        Ok(evaluations)
    }

    /// Evaluate a single budget without side effects; the read API uses
    /// this for the computed-status endpoint.
    pub async fn peek(&self, budget: &Budget, today: NaiveDate) -> Result<BudgetEvaluation> {
        let thresholds = self.budgets.thresholds_for_budget(budget.id).await?;

        let window_start = budget.current_period_start(today);
        let window_end = match budget.end_date {
            Some(end) if end < today => end,
            _ => today,
        };

        let spend = if window_end < window_start {
            vec![]
        } else {
            self.records
                .spend_matching(budget.subscription_id, &budget.filters, window_start, window_end)
                .await?
        };

        Ok(evaluate_budget(budget, &thresholds, &spend, today))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::models::budget::{BudgetFilters, BudgetPeriod};

    use super::*;

    fn budget(amount: f64) -> Budget {
        Budget {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            name: "monthly".to_string(),
            amount,
            currency: "USD".to_string(),
            period: BudgetPeriod::Monthly,
            start_date: "2025-06-01".parse().unwrap(),
            end_date: None,
            filters: BudgetFilters::default(),
            is_active: true,
            last_status: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn threshold(budget_id: Uuid, percentage: f64) -> BudgetThreshold {
        BudgetThreshold {
            id: Uuid::new_v4(),
            budget_id,
            percentage,
            notification_channels: vec![],
            is_active: true,
            last_triggered: None,
        }
    }

    fn usd(total: f64) -> Vec<SpendByCurrency> {
        vec![SpendByCurrency { currency: "USD".to_string(), total }]
    }

    fn today() -> NaiveDate {
        "2025-06-15".parse().unwrap()
    }

    #[test]
    fn warning_status_with_one_crossing_at_85_percent() {
        let b = budget(1000.0);
        let t = threshold(b.id, 80.0);

        let eval = evaluate_budget(&b, &[t], &usd(850.0), today());

        assert_eq!(eval.status, BudgetStatus::Warning);
        assert_eq!(eval.current_spend, 850.0);
        assert_eq!(eval.percentage_used, 85.0);
        assert_eq!(eval.amount_remaining, 150.0);
        assert_eq!(eval.crossings.len(), 1);
        assert_eq!(eval.crossings[0].percentage, 80.0);
    }

    #[test]
    fn threshold_fires_once_per_period() {
        let b = budget(1000.0);
        let mut t = threshold(b.id, 80.0);

        // 79%: no crossing
        let eval = evaluate_budget(&b, &[t.clone()], &usd(790.0), today());
        assert!(eval.crossings.is_empty());

        // 81%: crossing fires, tracker marks the threshold
        let eval = evaluate_budget(&b, &[t.clone()], &usd(810.0), today());
        assert_eq!(eval.crossings.len(), 1);
        t.last_triggered =
            Some("2025-06-15T12:00:00Z".parse::<chrono::DateTime<Utc>>().unwrap());

        // 85% recompute in the same period: suppressed
        let eval = evaluate_budget(&b, &[t.clone()], &usd(850.0), today());
        assert!(eval.crossings.is_empty());
        assert_eq!(eval.status, BudgetStatus::Warning);

        // Next period: re-armed
        let next_period: NaiveDate = "2025-07-02".parse().unwrap();
        let eval = evaluate_budget(&b, &[t], &usd(850.0), next_period);
        assert_eq!(eval.crossings.len(), 1);
    }

    #[test]
    fn exceeded_is_edge_triggered_via_last_status() {
        let mut b = budget(1000.0);

        let eval = evaluate_budget(&b, &[], &usd(1100.0), today());
        assert_eq!(eval.status, BudgetStatus::Exceeded);
        assert!(eval.newly_exceeded);

        // Once the tracker has recorded exceeded, re-evaluations while
        // still over are not a new edge
        b.last_status = Some(BudgetStatus::Exceeded);
        let eval = evaluate_budget(&b, &[], &usd(1200.0), today());
        assert_eq!(eval.status, BudgetStatus::Exceeded);
        assert!(!eval.newly_exceeded);
    }

    #[test]
    fn exactly_100_percent_is_exceeded() {
        let b = budget(1000.0);
        let eval = evaluate_budget(&b, &[], &usd(1000.0), today());
        assert_eq!(eval.status, BudgetStatus::Exceeded);
        assert_eq!(eval.amount_remaining, 0.0);
    }

    #[test]
    fn foreign_currency_is_flagged_not_summed() {
        let b = budget(1000.0);
        let spend = vec![
            SpendByCurrency { currency: "USD".to_string(), total: 400.0 },
            SpendByCurrency { currency: "EUR".to_string(), total: 9000.0 },
        ];

        let eval = evaluate_budget(&b, &[], &spend, today());

        assert!(eval.currency_mismatch);
        assert_eq!(eval.current_spend, 400.0);
        assert_eq!(eval.status, BudgetStatus::Ok);
        assert_eq!(eval.foreign_spend.len(), 1);
        assert_eq!(eval.foreign_spend[0].currency, "EUR");
    }

    #[test]
    fn inactive_threshold_neither_warns_nor_fires() {
        let b = budget(1000.0);
        let mut t = threshold(b.id, 50.0);
        t.is_active = false;

        let eval = evaluate_budget(&b, &[t], &usd(600.0), today());
        assert_eq!(eval.status, BudgetStatus::Ok);
        assert!(eval.crossings.is_empty());
    }

    proptest! {
        // Recomputing from the same record set is deterministic: same
        // percentage, same status, both matching the defining formulas.
        #[test]
        fn evaluation_is_deterministic(amount in 1.0f64..1e6, spent in 0.0f64..2e6) {
            let b = budget(amount);
            let t = threshold(b.id, 80.0);

            let first = evaluate_budget(&b, &[t.clone()], &usd(spent), today());
            let second = evaluate_budget(&b, &[t], &usd(spent), today());

            prop_assert_eq!(first.percentage_used, second.percentage_used);
            prop_assert_eq!(first.status, second.status);
            prop_assert_eq!(first.percentage_used, spent / amount * 100.0);

            let expected = if first.percentage_used >= 100.0 {
                BudgetStatus::Exceeded
            } else if first.percentage_used >= 80.0 {
                BudgetStatus::Warning
            } else {
                BudgetStatus::Ok
            };
            prop_assert_eq!(first.status, expected);
        }
    }
}
