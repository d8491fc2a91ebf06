//! # Rate Limit Stores
//!
//! Storage backends for rate limit counters: an in-process store and a store
//! layered on any string-valued distributed cache (in-memory or Redis).

pub mod distributed;
pub mod memory;
pub mod redis_store;

pub use distributed::{CounterLookup, DistributedCache, DistributedCacheRateLimitStore, MemoryDistributedCache};
pub use memory::InMemoryRateLimitStore;
pub use redis_store::{RedisCacheConfig, RedisDistributedCache};

use async_trait::async_trait;
use std::time::Duration;

use super::{RateLimitCounter, RateLimitError};

pub type StoreResult<T> = Result<T, RateLimitError>;

/// Key-value store for rate limit counters
///
/// `ttl` is an absolute expiration measured from the call: after it elapses the
/// entry must read as absent. Callers never delete expired entries themselves.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn set(&self, key: &str, counter: RateLimitCounter, ttl: Duration) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<RateLimitCounter>>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Atomically count one request: start a fresh window `{1, now}` with ttl
    /// `period` when the key is absent or expired, otherwise bump the count and
    /// keep the expiry.
    ///
    /// Returns `Ok(None)` when the backend has no such primitive; the limiter
    /// then falls back to `get` + `set`.
    async fn increment(&self, _key: &str, _period: Duration) -> StoreResult<Option<RateLimitCounter>> {
        Ok(None)
    }
}
