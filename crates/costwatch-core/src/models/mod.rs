//! Data models for CostWatch

pub mod alert;
pub mod anomaly;
pub mod budget;
pub mod cost;
pub mod forecast;

pub use alert::{Alert, AlertRule, AlertRuleInput, AlertStatus, NotificationChannel, RuleType, Severity};
pub use anomaly::{AnomalyCandidate, CostAnomaly, DetectionMethod};
pub use budget::{Budget, BudgetInput, BudgetPeriod, BudgetStatus, BudgetThreshold};
pub use cost::{CostRecord, CostRecordInput, DailyCost, DailySeries};
pub use forecast::{CostForecast, ForecastModelKind, ForecastPoint};
