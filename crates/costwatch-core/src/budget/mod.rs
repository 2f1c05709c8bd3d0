//! Budget tracking: spend-to-date, status and threshold crossings

mod repository;
mod tracker;

pub use repository::BudgetRepository;
pub use tracker::{evaluate_budget, BudgetEvaluation, BudgetTracker, ThresholdCrossing};
