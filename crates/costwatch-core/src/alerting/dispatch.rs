//! Notification dispatch boundary
//!
//! Delivery itself is the external dispatcher's job; the engine only
//! enqueues a delivery intent and proceeds. The dispatcher reports
//! per-channel outcomes back through the API, which folds success into
//! `Alert::notification_sent`.

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::db::{RedisPool, RedisQueue};
use crate::error::Result;
use crate::models::alert::{Alert, NotificationChannel};

/// Queue key consumed by the external dispatcher
const DISPATCH_QUEUE_KEY: &str = "costwatch:dispatch";

/// A delivery intent handed to the external dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryIntent {
    /// Alert to deliver
    pub alert_id: Uuid,
    /// Channels to deliver through
    pub channels: Vec<NotificationChannel>,
    /// Pre-rendered human-readable message
    pub rendered_message: String,
}

/// Per-channel outcome reported back by the dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDelivery {
    /// Channel type ("email", "webhook", "sms")
    pub channel_type: String,
    /// Whether delivery succeeded
    pub success: bool,
    /// Error message if it failed
    pub error: Option<String>,
}

/// Delivery report for one alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Per-channel outcomes
    pub deliveries: Vec<ChannelDelivery>,
}

impl DeliveryReport {
    /// An alert counts as notified once any channel confirmed delivery
    pub fn any_succeeded(&self) -> bool {
        self.deliveries.iter().any(|d| d.success)
    }
}

/// Render the message body handed to the dispatcher
pub fn render_message(alert: &Alert) -> String {
    format!(
        "[{}] {}: {} (value {:.2}, threshold {:.2})",
        alert.severity.as_str().to_uppercase(),
        alert.title,
        alert.message,
        alert.triggered_value,
        alert.threshold_value,
    )
}

/// Enqueues delivery intents for the external dispatcher
#[derive(Clone)]
pub struct DispatchQueue {
    queue: RedisQueue,
}

impl DispatchQueue {
    /// Create the dispatch queue
    pub fn new(pool: &RedisPool) -> Self {
        Self {
            queue: RedisQueue::new(pool, DISPATCH_QUEUE_KEY),
        }
    }

    /// Enqueue a delivery intent. Fire-and-forget relative to the
    /// evaluation pipeline.
    pub async fn enqueue(&self, alert: &Alert, channels: &[NotificationChannel]) -> Result<()> {
        let intent = DeliveryIntent {
            alert_id: alert.id,
            channels: channels.to_vec(),
            rendered_message: render_message(alert),
        };

        self.queue.push(&serde_json::to_string(&intent)?).await?;
        metrics::counter!("costwatch_dispatch_enqueued_total").increment(1);

        info!(alert_id = %alert.id, channels = channels.len(), "Delivery intent enqueued");
        Ok(())
    }

    /// Current queue depth
    pub async fn depth(&self) -> Result<u64> {
        self.queue.len().await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::models::alert::{AlertStatus, RuleType, Severity};

    use super::*;

    #[test]
    fn rendered_message_carries_severity_and_values() {
        let alert = Alert {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            rule_id: None,
            title: "Budget threshold crossed: monthly".to_string(),
            message: "Budget 'monthly' reached 85.0%".to_string(),
            severity: Severity::High,
            alert_type: RuleType::Threshold,
            triggered_value: 85.0,
            threshold_value: 80.0,
            status: AlertStatus::Active,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            notification_sent: false,
            created_at: Utc::now(),
        };

        let rendered = render_message(&alert);
        assert!(rendered.starts_with("[HIGH]"));
        assert!(rendered.contains("85.00"));
        assert!(rendered.contains("80.00"));
    }

    #[test]
    fn report_succeeds_when_any_channel_delivers() {
        let report = DeliveryReport {
            deliveries: vec![
                ChannelDelivery {
                    channel_type: "email".to_string(),
                    success: false,
                    error: Some("smtp timeout".to_string()),
                },
                ChannelDelivery {
                    channel_type: "webhook".to_string(),
                    success: true,
                    error: None,
                },
            ],
        };
        assert!(report.any_succeeded());

        let report = DeliveryReport { deliveries: vec![] };
        assert!(!report.any_succeeded());
    }

    #[test]
    fn delivery_intent_round_trips_as_json() {
        let intent = DeliveryIntent {
            alert_id: Uuid::new_v4(),
            channels: vec![NotificationChannel::Webhook {
                url: "https://hooks.example.com/costs".to_string(),
            }],
            rendered_message: "[HIGH] test".to_string(),
        };

        let json = serde_json::to_string(&intent).unwrap();
        let parsed: DeliveryIntent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.alert_id, intent.alert_id);
        assert_eq!(parsed.rendered_message, intent.rendered_message);
    }
}
