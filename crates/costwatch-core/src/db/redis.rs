//! Redis connection, the evaluation lease and the dispatch queue

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use uuid::Uuid;

use crate::config::RedisConfig as AppRedisConfig;
use crate::engine::lease::SubscriptionLease;
use crate::error::{Error, Result};

/// Redis connection pool
#[derive(Clone)]
pub struct RedisPool {
    pool: Pool,
}

impl RedisPool {
    /// Create a new Redis connection pool
    pub async fn new(config: &AppRedisConfig) -> Result<Self> {
        let cfg = PoolConfig::from_url(&config.url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(Error::redis)?;

        Ok(Self { pool })
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(Error::redis)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Error::redis)?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

/// Lease-based per-subscription evaluation lock. The expiry lets future
/// ticks recover when a worker crashes while holding the lease; releases
/// are token-checked so an expired holder cannot delete a successor's
/// lease.
#[derive(Clone)]
pub struct RedisLease {
    pool: Pool,
    ttl_ms: u64,
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

impl RedisLease {
    /// Create a lease manager with the given lease lifetime
    pub fn new(pool: &RedisPool, ttl_seconds: u64) -> Self {
        Self {
            pool: pool.pool.clone(),
            ttl_ms: ttl_seconds * 1000,
        }
    }

    fn key(subscription_id: Uuid) -> String {
        format!("costwatch:lease:{subscription_id}")
    }
}

#[async_trait]
impl SubscriptionLease for RedisLease {
    async fn acquire(&self, subscription_id: Uuid) -> Result<Option<String>> {
        let mut conn = self.pool.get().await.map_err(Error::redis)?;
        let token = Uuid::new_v4().to_string();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(Self::key(subscription_id))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(Error::redis)?;

        Ok(acquired.map(|_| token))
    }

    async fn release(&self, subscription_id: Uuid, token: &str) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(Error::redis)?;

        let _released: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::key(subscription_id))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(Error::redis)?;

        Ok(())
    }
}

/// FIFO queue backing the notification dispatch boundary
#[derive(Clone)]
pub struct RedisQueue {
    pool: Pool,
    key: String,
}

impl RedisQueue {
    /// Create a queue on the given key
    pub fn new(pool: &RedisPool, key: impl Into<String>) -> Self {
        Self {
            pool: pool.pool.clone(),
            key: key.into(),
        }
    }

    /// Push a payload onto the queue
    pub async fn push(&self, payload: &str) -> Result<()> {
        let mut conn = self.pool.get().await.map_err(Error::redis)?;
        let _: () = conn
            .lpush(&self.key, payload)
            .await
            .map_err(Error::redis)?;
        Ok(())
    }

    /// Current queue depth
    pub async fn len(&self) -> Result<u64> {
        let mut conn = self.pool.get().await.map_err(Error::redis)?;
        let len: u64 = conn.llen(&self.key).await.map_err(Error::redis)?;
        Ok(len)
    }
}
