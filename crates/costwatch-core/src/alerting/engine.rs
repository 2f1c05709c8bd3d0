//! Alert rule evaluation
//!
//! Consumes the freshest outputs of the budget tracker, anomaly
//! detector and forecaster for one subscription and decides which rules
//! fire. Bookkeeping (`last_triggered`, `trigger_count`) is updated on
//! every fire; alert creation and notification are suppressed while a
//! rule is inside its cooldown window, so operators can still see
//! suppressed activity.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::budget::BudgetEvaluation;
use crate::error::Result;
use crate::models::alert::{Alert, AlertRule, RuleConditions};
use crate::models::anomaly::CostAnomaly;
use crate::models::forecast::CostForecast;

use super::dispatch::DispatchQueue;
use super::repository::AlertRepository;

/// Everything one evaluation tick produced for a subscription
#[derive(Debug, Clone, Default)]
pub struct TickOutputs {
    /// Budget evaluations, threshold crossings included
    pub budget_evaluations: Vec<BudgetEvaluation>,
    /// Anomalies created on this tick (pre-existing ones never re-fire)
    pub new_anomalies: Vec<CostAnomaly>,
    /// Forecasts stored on this tick
    pub forecasts: Vec<CostForecast>,
    /// Most recent daily total, for custom rules
    pub latest_daily_total: Option<f64>,
}

/// One concrete reason a rule fires
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    /// Short human-readable title
    pub title: String,
    /// Rendered description
    pub message: String,
    /// The observed value
    pub triggered_value: f64,
    /// The configured limit
    pub threshold_value: f64,
}

/// Whether a rule that last fired at `last_triggered` is still cooling
/// down at `now`
pub fn in_cooldown(
    last_triggered: Option<DateTime<Utc>>,
    cooldown_minutes: i32,
    now: DateTime<Utc>,
) -> bool {
    last_triggered.is_some_and(|last| now - last < Duration::minutes(i64::from(cooldown_minutes)))
}

/// Evaluate one rule against the tick outputs. Pure: persistence and
/// cooldown live elsewhere.
pub fn firings_for_rule(
    rule: &AlertRule,
    conditions: &RuleConditions,
    outputs: &TickOutputs,
    today: NaiveDate,
) -> Vec<Firing> {
    match conditions {
        RuleConditions::Threshold { budget_id } => outputs
            .budget_evaluations
            .iter()
            .filter(|eval| budget_id.map_or(true, |id| id == eval.budget.id))
            .flat_map(|eval| {
                let budget_name = eval.budget.name.clone();
                eval.crossings.iter().map(move |crossing| Firing {
                    title: format!("Budget threshold crossed: {budget_name}"),
                    message: format!(
                        "Budget '{budget_name}' reached {:.1}% of its amount, \
                         crossing the {:.0}% threshold",
                        crossing.percentage_used, crossing.percentage
                    ),
                    triggered_value: crossing.percentage_used,
                    threshold_value: crossing.percentage,
                })
            })
            .collect(),

        RuleConditions::Anomaly { min_confidence, method } => outputs
            .new_anomalies
            .iter()
            .filter(|anomaly| anomaly.confidence >= *min_confidence)
            .filter(|anomaly| method.map_or(true, |m| m == anomaly.detection_method))
            .map(|anomaly| Firing {
                title: format!("Cost anomaly on {}", anomaly.anomaly_date),
                message: format!(
                    "{} flagged {} on {}: spend {:.2} deviates {:+.1}% from the \
                     expected {:.2} (confidence {:.2})",
                    anomaly.detection_method.as_str(),
                    if anomaly.service.is_empty() {
                        "the subscription total".to_string()
                    } else {
                        format!("service '{}'", anomaly.service)
                    },
                    anomaly.anomaly_date,
                    anomaly.actual_cost,
                    anomaly.deviation_percentage,
                    anomaly.expected_cost,
                    anomaly.confidence,
                ),
                triggered_value: anomaly.actual_cost,
                threshold_value: anomaly.expected_cost,
            })
            .collect(),

        RuleConditions::Budget { budget_id } => outputs
            .budget_evaluations
            .iter()
            .filter(|eval| budget_id.map_or(true, |id| id == eval.budget.id))
            .filter(|eval| eval.newly_exceeded)
            .map(|eval| Firing {
                title: format!("Budget exceeded: {}", eval.budget.name),
                message: format!(
                    "Budget '{}' is at {:.1}% ({:.2} of {:.2} {})",
                    eval.budget.name,
                    eval.percentage_used,
                    eval.current_spend,
                    eval.budget.amount,
                    eval.budget.currency,
                ),
                triggered_value: eval.percentage_used,
                threshold_value: 100.0,
            })
            .collect(),

        RuleConditions::Forecast { budget_id, model } => outputs
            .budget_evaluations
            .iter()
            .filter(|eval| budget_id.map_or(true, |id| id == eval.budget.id))
            .filter_map(|eval| {
                let remaining_predicted: f64 = outputs
                    .forecasts
                    .iter()
                    .filter(|f| f.model_type == *model)
                    .filter(|f| f.forecast_date > today && f.forecast_date <= eval.period_end)
                    .map(|f| f.predicted_cost)
                    .sum();
                let projected = eval.current_spend + remaining_predicted;

                (projected > eval.budget.amount).then(|| Firing {
                    title: format!("Projected budget overrun: {}", eval.budget.name),
                    message: format!(
                        "Spend of {:.2} plus {} projection of {:.2} through {} \
                         exceeds budget '{}' of {:.2} {}",
                        eval.current_spend,
                        model.as_str(),
                        remaining_predicted,
                        eval.period_end,
                        eval.budget.name,
                        eval.budget.amount,
                        eval.budget.currency,
                    ),
                    triggered_value: projected,
                    threshold_value: eval.budget.amount,
                })
            })
            .collect(),

        RuleConditions::Custom { operator, value } => outputs
            .latest_daily_total
            .filter(|total| operator.check(*total, *value))
            .map(|total| Firing {
                title: format!("Rule condition met: {}", rule.name),
                message: format!(
                    "Latest daily total {total:.2} compared {operator:?} against {value:.2}"
                ),
                triggered_value: total,
                threshold_value: *value,
            })
            .into_iter()
            .collect(),
    }
}

/// Evaluates every active rule for a subscription and materializes
/// alerts
pub struct AlertRuleEngine {
    repo: AlertRepository,
    dispatch: DispatchQueue,
}

impl AlertRuleEngine {
    /// Create a new rule engine
    pub fn new(repo: AlertRepository, dispatch: DispatchQueue) -> Self {
        Self { repo, dispatch }
    }

    /// Evaluate all active rules against the tick outputs. Rules with
    /// malformed conditions are disabled and surfaced; a failing rule
    /// never aborts evaluation of the others.
    pub async fn evaluate(
        &self,
        subscription_id: Uuid,
        outputs: &TickOutputs,
        today: NaiveDate,
    ) -> Result<Vec<Alert>> {
        let rules = self.repo.list_active(subscription_id).await?;
        debug!(subscription_id = %subscription_id, count = rules.len(), "Evaluating alert rules");

        let mut created = Vec::new();

        for rule in rules {
            let conditions = match rule.parsed_conditions() {
                Ok(conditions) => conditions,
                Err(parse_error) => {
                    error!(
                        rule_id = %rule.id,
                        error = %parse_error,
                        "Disabling rule with malformed conditions"
                    );
                    self.repo.disable_rule(rule.id).await?;
                    metrics::counter!("costwatch_rules_disabled_total").increment(1);
                    continue;
                }
            };

            for firing in firings_for_rule(&rule, &conditions, outputs, today) {
                match self.repo.fire_rule(&rule, &firing).await {
                    Ok(Some(alert)) => {
                        metrics::counter!("costwatch_alerts_created_total").increment(1);
                        if let Err(enqueue_error) = self
                            .dispatch
                            .enqueue(&alert, &rule.notification_channels)
                            .await
                        {
                            // Fire-and-forget: the alert exists either
                            // way and the dispatcher retries
                            warn!(
                                alert_id = %alert.id,
                                error = %enqueue_error,
                                "Failed to enqueue delivery intent"
                            );
                        }
                        created.push(alert);
                    }
                    Ok(None) => {
                        debug!(rule_id = %rule.id, "Fire suppressed by cooldown");
                        metrics::counter!("costwatch_fires_suppressed_total").increment(1);
                    }
                    Err(fire_error) => {
                        error!(rule_id = %rule.id, error = %fire_error, "Error firing rule");
                    }
                }
            }
        }

        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    use crate::budget::ThresholdCrossing;
    use crate::models::alert::{RuleType, Severity};
    use crate::models::anomaly::DetectionMethod;
    use crate::models::budget::{Budget, BudgetFilters, BudgetPeriod, BudgetStatus};
    use crate::models::forecast::ForecastModelKind;

    use super::*;

    fn today() -> NaiveDate {
        "2025-06-15".parse().unwrap()
    }

    fn rule(rule_type: RuleType) -> AlertRule {
        AlertRule {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            name: "rule".to_string(),
            rule_type,
            severity: Severity::High,
            conditions: serde_json::json!({}),
            notification_channels: vec![],
            cooldown_minutes: 60,
            is_active: true,
            last_triggered: None,
            trigger_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn evaluation(percentage_used: f64, crossings: Vec<ThresholdCrossing>) -> BudgetEvaluation {
        let budget = Budget {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            name: "monthly".to_string(),
            amount: 1000.0,
            currency: "USD".to_string(),
            period: BudgetPeriod::Monthly,
            start_date: "2025-06-01".parse().unwrap(),
            end_date: None,
            filters: BudgetFilters::default(),
            is_active: true,
            last_status: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let current_spend = percentage_used * 10.0;
        BudgetEvaluation {
            period_start: budget.current_period_start(today()),
            period_end: budget.current_period_end(today()),
            current_spend,
            percentage_used,
            amount_remaining: budget.amount - current_spend,
            status: if percentage_used >= 100.0 {
                BudgetStatus::Exceeded
            } else {
                BudgetStatus::Warning
            },
            currency_mismatch: false,
            foreign_spend: vec![],
            crossings,
            newly_exceeded: percentage_used >= 100.0,
            budget,
        }
    }

    fn crossing(percentage: f64, percentage_used: f64) -> ThresholdCrossing {
        ThresholdCrossing {
            budget_id: Uuid::new_v4(),
            threshold_id: Uuid::new_v4(),
            percentage,
            percentage_used,
            channels: vec![],
        }
    }

    fn anomaly(confidence: f64, method: DetectionMethod) -> CostAnomaly {
        CostAnomaly {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            anomaly_date: today(),
            service: String::new(),
            detection_method: method,
            expected_cost: 100.0,
            actual_cost: 400.0,
            deviation_percentage: 300.0,
            anomaly_score: 90.0,
            confidence,
            is_acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
            notes: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn threshold_rule_fires_on_crossing_signal() {
        let outputs = TickOutputs {
            budget_evaluations: vec![evaluation(85.0, vec![crossing(80.0, 85.0)])],
            ..Default::default()
        };
        let rule = rule(RuleType::Threshold);
        let conditions = rule.parsed_conditions().unwrap();

        let firings = firings_for_rule(&rule, &conditions, &outputs, today());

        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].triggered_value, 85.0);
        assert_eq!(firings[0].threshold_value, 80.0);
    }

    #[test]
    fn threshold_rule_scoped_to_another_budget_stays_quiet() {
        let outputs = TickOutputs {
            budget_evaluations: vec![evaluation(85.0, vec![crossing(80.0, 85.0)])],
            ..Default::default()
        };
        let mut rule = rule(RuleType::Threshold);
        rule.conditions = serde_json::json!({ "budget_id": Uuid::new_v4() });
        let conditions = rule.parsed_conditions().unwrap();

        assert!(firings_for_rule(&rule, &conditions, &outputs, today()).is_empty());
    }

    #[test]
    fn anomaly_rule_applies_the_confidence_floor() {
        let outputs = TickOutputs {
            new_anomalies: vec![
                anomaly(0.9, DetectionMethod::ZScore),
                anomaly(0.3, DetectionMethod::Iqr),
            ],
            ..Default::default()
        };
        let mut rule = rule(RuleType::Anomaly);
        rule.conditions = serde_json::json!({ "min_confidence": 0.5 });
        let conditions = rule.parsed_conditions().unwrap();

        let firings = firings_for_rule(&rule, &conditions, &outputs, today());

        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].triggered_value, 400.0);
    }

    #[test]
    fn anomaly_rule_can_pin_a_method() {
        let outputs = TickOutputs {
            new_anomalies: vec![
                anomaly(0.9, DetectionMethod::ZScore),
                anomaly(0.9, DetectionMethod::Iqr),
            ],
            ..Default::default()
        };
        let mut rule = rule(RuleType::Anomaly);
        rule.conditions = serde_json::json!({ "method": "iqr" });
        let conditions = rule.parsed_conditions().unwrap();

        let firings = firings_for_rule(&rule, &conditions, &outputs, today());
        assert_eq!(firings.len(), 1);
    }

    #[test]
    fn budget_rule_is_edge_triggered() {
        let mut exceeded = evaluation(110.0, vec![]);
        assert!(exceeded.newly_exceeded);

        let rule = rule(RuleType::Budget);
        let conditions = rule.parsed_conditions().unwrap();

        let outputs = TickOutputs {
            budget_evaluations: vec![exceeded.clone()],
            ..Default::default()
        };
        assert_eq!(firings_for_rule(&rule, &conditions, &outputs, today()).len(), 1);

        // Still exceeded on a later tick, but no longer a new edge
        exceeded.newly_exceeded = false;
        let outputs = TickOutputs {
            budget_evaluations: vec![exceeded],
            ..Default::default()
        };
        assert!(firings_for_rule(&rule, &conditions, &outputs, today()).is_empty());
    }

    #[test]
    fn forecast_rule_projects_end_of_period_overrun() {
        let eval = evaluation(50.0, vec![]);
        let period_end = eval.period_end;
        let forecasts: Vec<CostForecast> = (1..=10)
            .map(|i| CostForecast {
                id: Uuid::new_v4(),
                subscription_id: eval.budget.subscription_id,
                forecast_date: today() + Duration::days(i),
                predicted_cost: 60.0,
                lower_bound: 50.0,
                upper_bound: 70.0,
                confidence_interval: 0.95,
                model_type: ForecastModelKind::Linear,
                model_accuracy: None,
                actual_cost: None,
                prediction_error: None,
                created_at: Utc::now(),
            })
            .filter(|f| f.forecast_date <= period_end)
            .collect();
        assert!(!forecasts.is_empty());

        // 500 spent + 10 * 60 projected = 1100 > 1000
        let outputs = TickOutputs {
            budget_evaluations: vec![eval],
            forecasts,
            ..Default::default()
        };
        let rule = rule(RuleType::Forecast);
        let conditions = rule.parsed_conditions().unwrap();

        let firings = firings_for_rule(&rule, &conditions, &outputs, today());

        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].threshold_value, 1000.0);
        assert!(firings[0].triggered_value > 1000.0);
    }

    #[test]
    fn forecast_rule_ignores_other_models() {
        let eval = evaluation(50.0, vec![]);
        let forecasts = vec![CostForecast {
            id: Uuid::new_v4(),
            subscription_id: eval.budget.subscription_id,
            forecast_date: today() + Duration::days(1),
            predicted_cost: 10_000.0,
            lower_bound: 0.0,
            upper_bound: 20_000.0,
            confidence_interval: 0.95,
            model_type: ForecastModelKind::Lstm,
            model_accuracy: None,
            actual_cost: None,
            prediction_error: None,
            created_at: Utc::now(),
        }];

        let outputs = TickOutputs {
            budget_evaluations: vec![eval],
            forecasts,
            ..Default::default()
        };
        // Conditions default to the linear model
        let rule = rule(RuleType::Forecast);
        let conditions = rule.parsed_conditions().unwrap();

        assert!(firings_for_rule(&rule, &conditions, &outputs, today()).is_empty());
    }

    #[test]
    fn custom_rule_compares_the_latest_total() {
        let mut rule = rule(RuleType::Custom);
        rule.conditions = serde_json::json!({ "operator": "gt", "value": 200.0 });
        let conditions = rule.parsed_conditions().unwrap();

        let outputs = TickOutputs {
            latest_daily_total: Some(250.0),
            ..Default::default()
        };
        assert_eq!(firings_for_rule(&rule, &conditions, &outputs, today()).len(), 1);

        let outputs = TickOutputs {
            latest_daily_total: Some(150.0),
            ..Default::default()
        };
        assert!(firings_for_rule(&rule, &conditions, &outputs, today()).is_empty());
    }

    #[test]
    fn cooldown_window_suppresses_then_releases() {
        let fired_at = Utc::now();

        assert!(in_cooldown(Some(fired_at), 60, fired_at + Duration::minutes(30)));
        assert!(!in_cooldown(Some(fired_at), 60, fired_at + Duration::minutes(61)));
        assert!(!in_cooldown(None, 60, fired_at));
    }
}
