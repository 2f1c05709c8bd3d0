//! Per-subscription evaluation lease
//!
//! Two concurrent evaluation runs for the same subscription could
//! double-fire thresholds or duplicate anomalies, so every run holds a
//! lease for its subscription. The production implementation is
//! [`crate::db::RedisLease`]; the lease lives outside the process so the
//! exclusion also holds across workers.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

/// Mutual exclusion for one subscription's evaluation run
#[async_trait]
pub trait SubscriptionLease: Send + Sync {
    /// Try to take the lease. Returns a release token on success, None
    /// when another holder has it.
    async fn acquire(&self, subscription_id: Uuid) -> Result<Option<String>>;

    /// Release a lease acquired with `acquire`. A stale token (lease
    /// expired and re-acquired elsewhere) must be a no-op.
    async fn release(&self, subscription_id: Uuid, token: &str) -> Result<()>;
}

#[cfg(test)]
pub mod testing {
    //! In-memory lease double with the same token semantics as the
    //! Redis implementation, minus expiry.

    use std::collections::HashMap;

    use tokio::sync::Mutex;

    use super::*;

    /// Process-local lease for tests
    #[derive(Default)]
    pub struct InMemoryLease {
        held: Mutex<HashMap<Uuid, String>>,
    }

    #[async_trait]
    impl SubscriptionLease for InMemoryLease {
        async fn acquire(&self, subscription_id: Uuid) -> Result<Option<String>> {
            let mut held = self.held.lock().await;
            if held.contains_key(&subscription_id) {
                return Ok(None);
            }
            let token = Uuid::new_v4().to_string();
            held.insert(subscription_id, token.clone());
            Ok(Some(token))
        }

        async fn release(&self, subscription_id: Uuid, token: &str) -> Result<()> {
            let mut held = self.held.lock().await;
            if held.get(&subscription_id).is_some_and(|t| t.as_str() == token) {
                held.remove(&subscription_id);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::testing::InMemoryLease;
    use super::*;

    #[tokio::test]
    async fn concurrent_ticks_cannot_both_acquire() {
        let lease = Arc::new(InMemoryLease::default());
        let subscription = Uuid::new_v4();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let lease = lease.clone();
                tokio::spawn(async move { lease.acquire(subscription).await.unwrap() })
            })
            .collect();

        let mut acquired = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                acquired += 1;
            }
        }

        assert_eq!(acquired, 1);
    }

    #[tokio::test]
    async fn release_rearms_the_lease() {
        let lease = InMemoryLease::default();
        let subscription = Uuid::new_v4();

        let token = lease.acquire(subscription).await.unwrap().unwrap();
        assert!(lease.acquire(subscription).await.unwrap().is_none());

        lease.release(subscription, &token).await.unwrap();
        assert!(lease.acquire(subscription).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_token_release_is_a_noop() {
        let lease = InMemoryLease::default();
        let subscription = Uuid::new_v4();

        let _token = lease.acquire(subscription).await.unwrap().unwrap();
        lease.release(subscription, "stale-token").await.unwrap();

        // Still held by the original owner
        assert!(lease.acquire(subscription).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn independent_subscriptions_do_not_contend() {
        let lease = InMemoryLease::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(lease.acquire(a).await.unwrap().is_some());
        assert!(lease.acquire(b).await.unwrap().is_some());
    }
}
