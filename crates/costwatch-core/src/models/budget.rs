//! Budget data models and period arithmetic

use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::alert::NotificationChannel;
use super::cost::CostRecord;

/// Recurrence of a budget's tracking window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    /// Daily
    Daily,
    /// Weekly
    Weekly,
    /// Monthly
    Monthly,
    /// Quarterly
    Quarterly,
    /// Yearly
    Yearly,
}

impl BudgetPeriod {
    /// Stable string form used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::Yearly => "yearly",
        }
    }

    /// Parse the storage string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            "quarterly" => Some(Self::Quarterly),
            "yearly" => Some(Self::Yearly),
            _ => None,
        }
    }
}

/// Computed health of a budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    /// Spend is below every active threshold
    #[default]
    Ok,
    /// Spend crossed at least one active threshold but is under 100%
    Warning,
    /// Spend reached or passed 100% of the budget amount
    Exceeded,
}

impl BudgetStatus {
    /// Stable string form used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Exceeded => "exceeded",
        }
    }

    /// Parse the storage string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "warning" => Some(Self::Warning),
            "exceeded" => Some(Self::Exceeded),
            _ => None,
        }
    }
}

/// Record predicates a budget tracks. An empty dimension matches
/// everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetFilters {
    /// Services the budget covers
    pub services: Vec<String>,
    /// Resource groups the budget covers
    pub resource_groups: Vec<String>,
}

impl BudgetFilters {
    /// Whether a record satisfies every populated dimension
    pub fn matches(&self, record: &CostRecord) -> bool {
        (self.services.is_empty() || self.services.contains(&record.service))
            && (self.resource_groups.is_empty()
                || self.resource_groups.contains(&record.resource_group))
    }
}

/// A spend budget for a subscription scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    /// Unique identifier
    pub id: Uuid,

    /// Subscription this budget tracks
    pub subscription_id: Uuid,

    /// Human-readable name
    pub name: String,

    /// Budgeted amount per period
    pub amount: f64,

    /// ISO currency code of the budgeted amount
    pub currency: String,

    /// Tracking window recurrence
    pub period: BudgetPeriod,

    /// First day of the first period
    pub start_date: NaiveDate,

    /// Last tracked day (open-ended when None)
    pub end_date: Option<NaiveDate>,

    /// Record predicates
    pub filters: BudgetFilters,

    /// Whether the budget is evaluated
    pub is_active: bool,

    /// Status observed by the previous evaluation; bookkeeping for
    /// edge-triggered budget rules, never the computed status itself
    pub last_status: Option<BudgetStatus>,

    /// When the budget was created
    pub created_at: DateTime<Utc>,

    /// When the budget was last updated
    pub updated_at: DateTime<Utc>,
}

impl Budget {
    /// First day of the period containing `today`, anchored at
    /// `start_date`. Thresholds re-arm only when this advances.
    pub fn current_period_start(&self, today: NaiveDate) -> NaiveDate {
        if today <= self.start_date {
            return self.start_date;
        }
        match self.period {
            BudgetPeriod::Daily => today,
            BudgetPeriod::Weekly => {
                self.start_date + Duration::weeks((today - self.start_date).num_weeks())
            }
            BudgetPeriod::Monthly => step_months(self.start_date, 1, today),
            BudgetPeriod::Quarterly => step_months(self.start_date, 3, today),
            BudgetPeriod::Yearly => step_months(self.start_date, 12, today),
        }
    }

    /// Last day of the period containing `today`, capped at `end_date`
    pub fn current_period_end(&self, today: NaiveDate) -> NaiveDate {
        let start = self.current_period_start(today);
        let next = match self.period {
            BudgetPeriod::Daily => start + Duration::days(1),
            BudgetPeriod::Weekly => start + Duration::weeks(1),
            BudgetPeriod::Monthly => add_months(start, 1),
            BudgetPeriod::Quarterly => add_months(start, 3),
            BudgetPeriod::Yearly => add_months(start, 12),
        };
        let end = next - Duration::days(1);
        match self.end_date {
            Some(cap) if cap < end => cap,
            _ => end,
        }
    }

    /// Start of the current period as an instant, for comparing against
    /// threshold trigger timestamps
    pub fn current_period_start_at(&self, today: NaiveDate) -> DateTime<Utc> {
        self.current_period_start(today)
            .and_hms_opt(0, 0, 0)
            .expect("midnight is a valid time")
            .and_utc()
    }
}

fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    date.checked_add_months(Months::new(months)).unwrap_or(date)
}

/// Advance from `start` in `step`-month increments to the latest
/// boundary not after `today`.
fn step_months(start: NaiveDate, step: u32, today: NaiveDate) -> NaiveDate {
    let mut current = start;
    loop {
        let next = add_months(current, step);
        if next > today || next == current {
            return current;
        }
        current = next;
    }
}

/// A notification threshold owned by a budget. Fires at most once per
/// budget period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetThreshold {
    /// Unique identifier
    pub id: Uuid,

    /// Owning budget
    pub budget_id: Uuid,

    /// Percentage of the budget amount at which the threshold fires
    pub percentage: f64,

    /// Channels notified on crossing
    pub notification_channels: Vec<NotificationChannel>,

    /// Whether the threshold is considered
    pub is_active: bool,

    /// Last time the threshold fired; re-arms when the period advances
    pub last_triggered: Option<DateTime<Utc>>,
}

impl BudgetThreshold {
    /// Whether the threshold is armed for the period starting at
    /// `period_start`
    pub fn is_armed(&self, period_start: DateTime<Utc>) -> bool {
        self.is_active
            && self
                .last_triggered
                .map_or(true, |triggered| triggered < period_start)
    }
}

/// Input for creating or updating a budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetInput {
    pub subscription_id: Uuid,
    pub name: String,
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub period: BudgetPeriod,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub filters: BudgetFilters,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub thresholds: Vec<ThresholdInput>,
}

/// Input for creating a budget threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdInput {
    pub percentage: f64,
    #[serde(default)]
    pub notification_channels: Vec<NotificationChannel>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn budget(period: BudgetPeriod, start: &str) -> Budget {
        Budget {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            name: "test".to_string(),
            amount: 1000.0,
            currency: "USD".to_string(),
            period,
            start_date: start.parse().unwrap(),
            end_date: None,
            filters: BudgetFilters::default(),
            is_active: true,
            last_status: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn monthly_period_advances_on_anchor_day() {
        let b = budget(BudgetPeriod::Monthly, "2025-01-15");
        assert_eq!(b.current_period_start(date("2025-01-20")), date("2025-01-15"));
        assert_eq!(b.current_period_start(date("2025-02-14")), date("2025-01-15"));
        assert_eq!(b.current_period_start(date("2025-02-15")), date("2025-02-15"));
        assert_eq!(b.current_period_end(date("2025-02-20")), date("2025-03-14"));
    }

    #[test]
    fn weekly_period_is_seven_day_aligned() {
        let b = budget(BudgetPeriod::Weekly, "2025-06-02");
        assert_eq!(b.current_period_start(date("2025-06-08")), date("2025-06-02"));
        assert_eq!(b.current_period_start(date("2025-06-09")), date("2025-06-09"));
    }

    #[test]
    fn quarterly_period_steps_three_months() {
        let b = budget(BudgetPeriod::Quarterly, "2025-01-01");
        assert_eq!(b.current_period_start(date("2025-03-31")), date("2025-01-01"));
        assert_eq!(b.current_period_start(date("2025-04-01")), date("2025-04-01"));
    }

    #[test]
    fn period_end_respects_budget_end_date() {
        let mut b = budget(BudgetPeriod::Monthly, "2025-01-01");
        b.end_date = Some(date("2025-01-20"));
        assert_eq!(b.current_period_end(date("2025-01-10")), date("2025-01-20"));
    }

    #[test]
    fn threshold_rearms_across_period_boundary() {
        let b = budget(BudgetPeriod::Monthly, "2025-01-01");
        let threshold = BudgetThreshold {
            id: Uuid::new_v4(),
            budget_id: b.id,
            percentage: 80.0,
            notification_channels: vec![],
            is_active: true,
            last_triggered: Some(
                date("2025-01-20").and_hms_opt(12, 0, 0).unwrap().and_utc(),
            ),
        };

        // Same period: still disarmed
        assert!(!threshold.is_armed(b.current_period_start_at(date("2025-01-25"))));
        // Next period: armed again
        assert!(threshold.is_armed(b.current_period_start_at(date("2025-02-05"))));
    }

    #[test]
    fn empty_filter_dimensions_match_everything() {
        let record = CostRecord {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            record_date: date("2025-06-02"),
            service: "compute".to_string(),
            resource_group: "prod".to_string(),
            amount: 1.0,
            currency: "USD".to_string(),
            ingested_at: Utc::now(),
        };

        assert!(BudgetFilters::default().matches(&record));

        let filters = BudgetFilters {
            services: vec!["storage".to_string()],
            resource_groups: vec![],
        };
        assert!(!filters.matches(&record));

        let filters = BudgetFilters {
            services: vec!["compute".to_string()],
            resource_groups: vec!["prod".to_string()],
        };
        assert!(filters.matches(&record));
    }
}
