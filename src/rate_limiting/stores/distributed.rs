//! # Distributed Cache Store
//!
//! Counters stored as JSON strings in a shared cache so several gateway
//! instances see the same quota. The cache only needs string get/set with an
//! absolute expiration, which Redis and the in-memory test cache both provide.

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use std::time::{Duration, Instant};
use tracing::warn;

use super::{RateLimitStore, StoreResult};
use crate::rate_limiting::RateLimitCounter;

/// String-valued cache shared between gateway instances
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get_string(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store `value`, expiring `absolute_expiration` after the call
    async fn set_string(&self, key: &str, value: String, absolute_expiration: Duration) -> StoreResult<()>;

    async fn remove(&self, key: &str) -> StoreResult<()>;

    /// Atomic increment-with-ttl over the JSON counter, when the backend has one.
    /// Same contract as [`RateLimitStore::increment`].
    async fn increment_counter(&self, _key: &str, _period: Duration) -> StoreResult<Option<RateLimitCounter>> {
        Ok(None)
    }
}

/// Outcome of reading a counter out of the cache
#[derive(Debug, Clone, PartialEq)]
pub enum CounterLookup {
    Found(RateLimitCounter),
    NotFound,
    /// The stored text is not a counter
    Malformed(String),
}

/// [`RateLimitStore`] over any [`DistributedCache`]
///
/// Counting is atomic only when the cache implements
/// [`DistributedCache::increment_counter`] (Redis does). Otherwise concurrent
/// requests for the same key may both read `n` and both write `n + 1`.
pub struct DistributedCacheRateLimitStore<C: DistributedCache> {
    cache: C,
}

impl<C: DistributedCache> DistributedCacheRateLimitStore<C> {
    pub fn new(cache: C) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Read a key, distinguishing a missing entry from one that fails to parse
    pub async fn lookup(&self, key: &str) -> StoreResult<CounterLookup> {
        let raw = match self.cache.get_string(key).await? {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Ok(CounterLookup::NotFound),
        };

        Ok(match serde_json::from_str::<RateLimitCounter>(&raw) {
            Ok(counter) => CounterLookup::Found(counter),
            Err(err) => CounterLookup::Malformed(err.to_string()),
        })
    }
}

#[async_trait]
impl<C: DistributedCache> RateLimitStore for DistributedCacheRateLimitStore<C> {
    async fn set(&self, key: &str, counter: RateLimitCounter, ttl: Duration) -> StoreResult<()> {
        let encoded = serde_json::to_string(&counter)?;
        self.cache.set_string(key, encoded, ttl).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<RateLimitCounter>> {
        match self.lookup(key).await? {
            CounterLookup::Found(counter) => Ok(Some(counter)),
            CounterLookup::NotFound => Ok(None),
            CounterLookup::Malformed(reason) => {
                warn!(key = %key, reason = %reason, "Ignoring malformed rate limit counter");
                counter!("gateway_rate_limit_malformed_counters_total").increment(1);
                Ok(None)
            }
        }
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self
            .cache
            .get_string(key)
            .await?
            .map(|raw| !raw.is_empty())
            .unwrap_or(false))
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.cache.remove(key).await
    }

    async fn increment(&self, key: &str, period: Duration) -> StoreResult<Option<RateLimitCounter>> {
        self.cache.increment_counter(key, period).await
    }
}

/// Process-local [`DistributedCache`], for single-instance deployments and tests
#[derive(Debug, Default)]
pub struct MemoryDistributedCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedCache for MemoryDistributedCache {
    async fn get_string(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        let entry = self
            .entries
            .get(key)
            .map(|entry| (entry.value().0.clone(), entry.value().1));

        match entry {
            Some((value, expires_at)) if expires_at > now => Ok(Some(value)),
            Some(_) => {
                self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_string(&self, key: &str, value: String, absolute_expiration: Duration) -> StoreResult<()> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + absolute_expiration));
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}
