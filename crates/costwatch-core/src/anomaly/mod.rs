//! Anomaly detection: pluggable statistical detectors over daily series

mod detectors;
mod isolation;
mod repository;

pub use detectors::{build_detectors, Detector, IqrDetector, MovingAvgDetector, ZScoreDetector};
pub use isolation::IsolationForestDetector;
pub use repository::AnomalyRepository;

use tracing::debug;
use uuid::Uuid;

use crate::config::DetectionConfig;
use crate::error::Result;
use crate::models::anomaly::CostAnomaly;
use crate::models::cost::DailySeries;

/// Runs the configured detectors over a subscription's series and
/// persists what they flag
pub struct AnomalyService {
    detectors: Vec<Box<dyn Detector>>,
    repo: AnomalyRepository,
}

impl AnomalyService {
    /// Create a service with the configured detector set
    pub fn new(config: &DetectionConfig, repo: AnomalyRepository) -> Self {
        Self {
            detectors: build_detectors(config),
            repo,
        }
    }

    /// Run every detector independently and store the candidates.
    /// Returns only anomalies that did not exist before this run; those
    /// are what anomaly rules react to.
    pub async fn detect_and_store(
        &self,
        subscription_id: Uuid,
        series: &DailySeries,
    ) -> Result<Vec<CostAnomaly>> {
        let mut new_anomalies = Vec::new();

        for detector in &self.detectors {
            let candidates = detector.detect(series);
            if candidates.is_empty() {
                continue;
            }

            debug!(
                subscription_id = %subscription_id,
                method = detector.method().as_str(),
                count = candidates.len(),
                "Detector flagged candidates"
            );

            let inserted = self
                .repo
                .insert_candidates(subscription_id, &candidates)
                .await?;
            metrics::counter!("costwatch_anomalies_created_total")
                .increment(inserted.len() as u64);
            new_anomalies.extend(inserted);
        }

        Ok(new_anomalies)
    }
}
