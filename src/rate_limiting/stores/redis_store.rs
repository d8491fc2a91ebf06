//! Redis-backed [`DistributedCache`].

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::distributed::DistributedCache;
use super::StoreResult;
use crate::rate_limiting::{RateLimitCounter, RateLimitError};

/// Bumps the JSON counter under KEYS[1] and keeps its remaining expiry, or
/// writes ARGV[2] with a PX of ARGV[1] when the key is absent or unreadable.
/// Returns the stored counter.
const INCREMENT_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if raw then
  local ok, counter = pcall(cjson.decode, raw)
  local ttl = redis.call('PTTL', KEYS[1])
  if ok and type(counter) == 'table' and tonumber(counter.count) and ttl > 0 then
    counter.count = tonumber(counter.count) + 1
    local encoded = cjson.encode(counter)
    redis.call('SET', KEYS[1], encoded, 'PX', ttl)
    return encoded
  end
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[1])
return ARGV[2]
"#;

fn default_key_prefix() -> String {
    "gateway:ratelimit:".to_string()
}

fn default_operation_timeout() -> Duration {
    Duration::from_millis(250)
}

/// Connection settings for the Redis cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisCacheConfig {
    /// e.g. `redis://127.0.0.1:6379/0`
    pub url: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on one cache round trip
    #[serde(with = "humantime_serde", default = "default_operation_timeout")]
    pub operation_timeout: Duration,
}

/// Cache over a multiplexed Redis connection
///
/// The connection is established on first use and retried on every call until
/// it succeeds; until then each operation returns an error. `ConnectionManager`
/// reconnects on its own afterwards and is cheap to clone, so every call works
/// on its own handle.
#[derive(Clone)]
pub struct RedisDistributedCache {
    client: redis::Client,
    connection: Arc<OnceCell<ConnectionManager>>,
    increment: Arc<Script>,
    key_prefix: String,
    operation_timeout: Duration,
}

impl RedisDistributedCache {
    /// Validate the URL without touching the network
    pub fn new(config: &RedisCacheConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            connection: Arc::new(OnceCell::new()),
            increment: Arc::new(Script::new(INCREMENT_SCRIPT)),
            key_prefix: config.key_prefix.clone(),
            operation_timeout: config.operation_timeout,
        })
    }

    /// Build the cache and try to connect once.
    ///
    /// Only an invalid URL is an error. An unreachable server is logged and the
    /// connection is retried on later calls.
    pub async fn connect(config: &RedisCacheConfig) -> StoreResult<Self> {
        let cache = Self::new(config)?;
        match cache.connection().await {
            Ok(_) => info!(prefix = %config.key_prefix, "Connected rate limit cache to Redis"),
            Err(err) => warn!(error = %err, "Redis unreachable, rate limit checks fail open until it connects"),
        }
        Ok(cache)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| {
                let client = self.client.clone();
                self.bounded(async move { ConnectionManager::new(client).await })
            })
            .await?;
        Ok(manager.clone())
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn bounded<T, F>(&self, operation: F) -> StoreResult<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RateLimitError::Timeout(self.operation_timeout)),
        }
    }
}

#[async_trait]
impl DistributedCache for RedisDistributedCache {
    async fn get_string(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        let key = self.key(key);
        self.bounded(async move { conn.get::<_, Option<String>>(key).await })
            .await
    }

    async fn set_string(&self, key: &str, value: String, absolute_expiration: Duration) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let key = self.key(key);
        // PX rejects zero, and a window that has already closed should not linger.
        let millis = absolute_expiration.as_millis().max(1) as u64;
        debug!(key = %key, ttl_ms = millis, "Writing rate limit counter");
        self.bounded(async move {
            redis::cmd("SET")
                .arg(&key)
                .arg(value)
                .arg("PX")
                .arg(millis)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let key = self.key(key);
        self.bounded(async move { conn.del::<_, ()>(key).await }).await
    }

    async fn increment_counter(&self, key: &str, period: Duration) -> StoreResult<Option<RateLimitCounter>> {
        let mut conn = self.connection().await?;
        let key = self.key(key);
        let fresh = serde_json::to_string(&RateLimitCounter::first(Utc::now()))?;
        let millis = period.as_millis().max(1) as u64;
        let script = self.increment.clone();

        let stored: String = self
            .bounded(async move {
                script
                    .key(&key)
                    .arg(millis)
                    .arg(fresh)
                    .invoke_async::<_, String>(&mut conn)
                    .await
            })
            .await?;
        Ok(Some(serde_json::from_str(&stored)?))
    }
}
