//! Alert rule and alert data models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::anomaly::DetectionMethod;
use super::forecast::ForecastModelKind;

/// Alert severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Low,
    /// Default for system-generated alerts without a rule
    #[default]
    Medium,
    /// Needs attention soon
    High,
    /// Needs attention now
    Critical,
}

impl Severity {
    /// Stable string form used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse the storage string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// What kind of condition a rule evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// A budget threshold crossing signal
    Threshold,
    /// A newly detected cost anomaly
    Anomaly,
    /// A budget transitioning into exceeded
    Budget,
    /// A forecast projecting budget overrun
    Forecast,
    /// A comparator over the latest daily total
    Custom,
}

impl RuleType {
    /// Stable string form used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Threshold => "threshold",
            Self::Anomaly => "anomaly",
            Self::Budget => "budget",
            Self::Forecast => "forecast",
            Self::Custom => "custom",
        }
    }

    /// Parse the storage string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "threshold" => Some(Self::Threshold),
            "anomaly" => Some(Self::Anomaly),
            "budget" => Some(Self::Budget),
            "forecast" => Some(Self::Forecast),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Comparison operator for custom rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal to
    Gte,
    /// Less than or equal to
    Lte,
}

impl Operator {
    /// Check a value against a threshold
    pub fn check(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Lt => value < threshold,
            Self::Gte => value >= threshold,
            Self::Lte => value <= threshold,
        }
    }
}

/// Notification channel configuration, forwarded to the external
/// dispatcher verbatim
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationChannel {
    /// Email notification
    Email { to: Vec<String> },
    /// Generic webhook
    Webhook { url: String },
    /// SMS notification
    Sms { to: Vec<String> },
}

/// Status of an alert. Transitions form a strict partial order; nothing
/// re-enters `Active` and `Resolved`/`Dismissed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// Newly fired, unhandled
    #[default]
    Active,
    /// Seen by an operator, not yet resolved
    Acknowledged,
    /// Terminal: handled
    Resolved,
    /// Terminal: discarded without handling
    Dismissed,
}

impl AlertStatus {
    /// Stable string form used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
            Self::Dismissed => "dismissed",
        }
    }

    /// Parse the storage string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "acknowledged" => Some(Self::Acknowledged),
            "resolved" => Some(Self::Resolved),
            "dismissed" => Some(Self::Dismissed),
            _ => None,
        }
    }

    /// Transition table. Validated on every status write.
    pub fn can_transition(self, to: AlertStatus) -> bool {
        matches!(
            (self, to),
            (Self::Active, Self::Acknowledged)
                | (Self::Active, Self::Resolved)
                | (Self::Active, Self::Dismissed)
                | (Self::Acknowledged, Self::Resolved)
        )
    }
}

/// A configured alerting rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique identifier
    pub id: Uuid,

    /// Subscription scope
    pub subscription_id: Uuid,

    /// Human-readable name
    pub name: String,

    /// Condition kind
    pub rule_type: RuleType,

    /// Severity copied onto fired alerts
    pub severity: Severity,

    /// Type-specific condition payload; parsed by `parsed_conditions`
    pub conditions: serde_json::Value,

    /// Channels notified when the rule fires
    pub notification_channels: Vec<NotificationChannel>,

    /// Minimum minutes between alert creations for this rule
    pub cooldown_minutes: i32,

    /// Whether the rule is evaluated
    pub is_active: bool,

    /// Last fire time, cooldown-suppressed fires included
    pub last_triggered: Option<DateTime<Utc>>,

    /// Total fires, cooldown-suppressed fires included
    pub trigger_count: i64,

    /// When the rule was created
    pub created_at: DateTime<Utc>,

    /// When the rule was last updated
    pub updated_at: DateTime<Utc>,
}

/// Typed view of `AlertRule::conditions`
#[derive(Debug, Clone, PartialEq)]
pub enum RuleConditions {
    /// Fire on a crossing of the target budget's thresholds
    Threshold {
        /// Target budget; any budget of the subscription when None
        budget_id: Option<Uuid>,
    },
    /// Fire on new anomalies meeting a confidence floor
    Anomaly {
        /// Minimum anomaly confidence
        min_confidence: f64,
        /// Only consider this method when set
        method: Option<DetectionMethod>,
    },
    /// Fire when the target budget becomes exceeded
    Budget {
        /// Target budget; any budget of the subscription when None
        budget_id: Option<Uuid>,
    },
    /// Fire when projected end-of-period spend overruns the budget
    Forecast {
        /// Target budget; any budget of the subscription when None
        budget_id: Option<Uuid>,
        /// Model whose forecasts drive the projection
        model: ForecastModelKind,
    },
    /// Fire when the latest daily total compares true
    Custom {
        /// Comparison operator
        operator: Operator,
        /// Comparison value
        value: f64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThresholdConditions {
    #[serde(default)]
    budget_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AnomalyConditions {
    #[serde(default = "default_min_confidence")]
    min_confidence: f64,
    #[serde(default)]
    method: Option<DetectionMethod>,
}

fn default_min_confidence() -> f64 {
    0.5
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ForecastConditions {
    #[serde(default)]
    budget_id: Option<Uuid>,
    #[serde(default = "default_forecast_model")]
    model: ForecastModelKind,
}

fn default_forecast_model() -> ForecastModelKind {
    ForecastModelKind::Linear
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CustomConditions {
    operator: Operator,
    value: f64,
}

impl AlertRule {
    /// Parse the JSON conditions for this rule's type. A parse failure
    /// is a fatal configuration error: the caller disables the rule.
    pub fn parsed_conditions(&self) -> Result<RuleConditions> {
        let conditions = self.conditions.clone();
        let parsed = match self.rule_type {
            RuleType::Threshold => {
                let c: ThresholdConditions = serde_json::from_value(conditions)?;
                RuleConditions::Threshold { budget_id: c.budget_id }
            }
            RuleType::Anomaly => {
                let c: AnomalyConditions = serde_json::from_value(conditions)?;
                if !(0.0..=1.0).contains(&c.min_confidence) {
                    return Err(Error::validation(format!(
                        "min_confidence out of range: {}",
                        c.min_confidence
                    )));
                }
                RuleConditions::Anomaly {
                    min_confidence: c.min_confidence,
                    method: c.method,
                }
            }
            RuleType::Budget => {
                let c: ThresholdConditions = serde_json::from_value(conditions)?;
                RuleConditions::Budget { budget_id: c.budget_id }
            }
            RuleType::Forecast => {
                let c: ForecastConditions = serde_json::from_value(conditions)?;
                RuleConditions::Forecast {
                    budget_id: c.budget_id,
                    model: c.model,
                }
            }
            RuleType::Custom => {
                let c: CustomConditions = serde_json::from_value(conditions)?;
                RuleConditions::Custom {
                    operator: c.operator,
                    value: c.value,
                }
            }
        };
        Ok(parsed)
    }
}

/// Input for creating or updating an alert rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleInput {
    pub subscription_id: Uuid,
    pub name: String,
    pub rule_type: RuleType,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_conditions")]
    pub conditions: serde_json::Value,
    #[serde(default)]
    pub notification_channels: Vec<NotificationChannel>,
    #[serde(default = "default_cooldown")]
    pub cooldown_minutes: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_conditions() -> serde_json::Value {
    serde_json::json!({})
}

fn default_cooldown() -> i32 {
    60
}

fn default_true() -> bool {
    true
}

/// A materialized alert, the terminal output of the rule engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Unique identifier
    pub id: Uuid,

    /// Subscription scope
    pub subscription_id: Uuid,

    /// The rule that fired; None for system-generated alerts
    pub rule_id: Option<Uuid>,

    /// Short human-readable title
    pub title: String,

    /// Rendered description
    pub message: String,

    /// Severity, copied verbatim from the firing rule
    pub severity: Severity,

    /// Kind of condition that fired
    pub alert_type: RuleType,

    /// The observed value that fired the rule
    pub triggered_value: f64,

    /// The configured limit that was crossed
    pub threshold_value: f64,

    /// Lifecycle status
    pub status: AlertStatus,

    /// Who acknowledged the alert
    pub acknowledged_by: Option<String>,

    /// When it was acknowledged
    pub acknowledged_at: Option<DateTime<Utc>>,

    /// Who resolved or dismissed the alert
    pub resolved_by: Option<String>,

    /// When it was resolved or dismissed
    pub resolved_at: Option<DateTime<Utc>>,

    /// Set once the dispatcher confirms delivery; never unset
    pub notification_sent: bool,

    /// When the alert was created
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Apply a status transition, recording the acting user and
    /// timestamp. Illegal transitions are rejected outright.
    pub fn transition(&mut self, to: AlertStatus, actor: &str, at: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        match to {
            AlertStatus::Acknowledged => {
                self.acknowledged_by = Some(actor.to_string());
                self.acknowledged_at = Some(at);
            }
            AlertStatus::Resolved | AlertStatus::Dismissed => {
                self.resolved_by = Some(actor.to_string());
                self.resolved_at = Some(at);
            }
            AlertStatus::Active => unreachable!("no transition re-enters active"),
        }

        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(status: AlertStatus) -> Alert {
        Alert {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            rule_id: None,
            title: "test".to_string(),
            message: "test".to_string(),
            severity: Severity::Medium,
            alert_type: RuleType::Budget,
            triggered_value: 110.0,
            threshold_value: 100.0,
            status,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            notification_sent: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn active_to_resolved_is_allowed() {
        let mut a = alert(AlertStatus::Active);
        a.transition(AlertStatus::Resolved, "ops", Utc::now()).unwrap();
        assert_eq!(a.status, AlertStatus::Resolved);
        assert_eq!(a.resolved_by.as_deref(), Some("ops"));
        assert!(a.resolved_at.is_some());
    }

    #[test]
    fn active_via_acknowledged_to_resolved_is_allowed() {
        let mut a = alert(AlertStatus::Active);
        a.transition(AlertStatus::Acknowledged, "ops", Utc::now()).unwrap();
        assert_eq!(a.acknowledged_by.as_deref(), Some("ops"));
        a.transition(AlertStatus::Resolved, "ops", Utc::now()).unwrap();
        assert_eq!(a.status, AlertStatus::Resolved);
    }

    #[test]
    fn resolved_to_active_is_rejected() {
        let mut a = alert(AlertStatus::Resolved);
        let err = a.transition(AlertStatus::Active, "ops", Utc::now());
        assert!(matches!(err, Err(Error::InvalidTransition { .. })));
        assert_eq!(a.status, AlertStatus::Resolved);
    }

    #[test]
    fn dismissed_is_terminal() {
        for to in [
            AlertStatus::Active,
            AlertStatus::Acknowledged,
            AlertStatus::Resolved,
        ] {
            let mut a = alert(AlertStatus::Dismissed);
            assert!(a.transition(to, "ops", Utc::now()).is_err());
        }
    }

    #[test]
    fn acknowledged_cannot_be_dismissed() {
        // Only active -> dismissed exists in the transition table
        let mut a = alert(AlertStatus::Acknowledged);
        assert!(a.transition(AlertStatus::Dismissed, "ops", Utc::now()).is_err());
    }

    #[test]
    fn anomaly_conditions_parse_with_defaults() {
        let rule = AlertRule {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            name: "anomaly".to_string(),
            rule_type: RuleType::Anomaly,
            severity: Severity::High,
            conditions: serde_json::json!({}),
            notification_channels: vec![],
            cooldown_minutes: 60,
            is_active: true,
            last_triggered: None,
            trigger_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let parsed = rule.parsed_conditions().unwrap();
        assert_eq!(
            parsed,
            RuleConditions::Anomaly { min_confidence: 0.5, method: None }
        );
    }

    #[test]
    fn malformed_conditions_are_rejected() {
        let mut rule = AlertRule {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            name: "custom".to_string(),
            rule_type: RuleType::Custom,
            severity: Severity::Low,
            conditions: serde_json::json!({"operator": "between", "value": 5.0}),
            notification_channels: vec![],
            cooldown_minutes: 60,
            is_active: true,
            last_triggered: None,
            trigger_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert!(rule.parsed_conditions().is_err());

        rule.conditions = serde_json::json!({"operator": "gt"});
        assert!(rule.parsed_conditions().is_err());

        rule.conditions = serde_json::json!({"operator": "gt", "value": 5.0});
        assert!(rule.parsed_conditions().is_ok());
    }
}
