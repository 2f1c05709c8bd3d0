//! Alert rule evaluation, alert lifecycle and the dispatch boundary

mod dispatch;
mod engine;
mod repository;

pub use dispatch::{render_message, ChannelDelivery, DeliveryIntent, DeliveryReport, DispatchQueue};
pub use engine::{firings_for_rule, in_cooldown, AlertRuleEngine, Firing, TickOutputs};
pub use repository::AlertRepository;
