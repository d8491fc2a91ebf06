//! # In-Memory Rate Limit Store
//!
//! Process-local counters in a `DashMap`. Expired entries read as absent and are
//! dropped lazily; `spawn_cleanup` sweeps the rest in the background.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{RateLimitStore, StoreResult};
use crate::rate_limiting::RateLimitCounter;

#[derive(Debug, Clone, Copy)]
struct StoredCounter {
    counter: RateLimitCounter,
    expires_at: Instant,
}

impl StoredCounter {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory store with an atomic increment
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    entries: DashMap<String, StoredCounter>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Periodically purge expired entries until the store is dropped
    pub fn spawn_cleanup(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, "Purged expired rate limit counters");
                }
            }
        })
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn set(&self, key: &str, counter: RateLimitCounter, ttl: Duration) -> StoreResult<()> {
        self.entries.insert(
            key.to_string(),
            StoredCounter {
                counter,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<RateLimitCounter>> {
        let now = Instant::now();
        let stored = self.entries.get(key).map(|entry| *entry.value());
        match stored {
            Some(stored) if stored.is_live(now) => Ok(Some(stored.counter)),
            Some(_) => {
                self.entries.remove_if(key, |_, stored| !stored.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, period: Duration) -> StoreResult<Option<RateLimitCounter>> {
        let now = Instant::now();
        let fresh = StoredCounter {
            counter: RateLimitCounter::first(Utc::now()),
            expires_at: now + period,
        };

        // The shard lock is held for the whole read-modify-write.
        let counter = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let stored = occupied.get_mut();
                if stored.is_live(now) {
                    stored.counter = stored.counter.increment();
                } else {
                    *stored = fresh;
                }
                stored.counter
            }
            Entry::Vacant(vacant) => vacant.insert(fresh).counter,
        };
        Ok(Some(counter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let store = InMemoryRateLimitStore::new();
        let counter = RateLimitCounter::first(Utc::now()).increment();

        store.set("orders:alice", counter, Duration::from_secs(5)).await.unwrap();

        assert_eq!(store.get("orders:alice").await.unwrap(), Some(counter));
        assert!(store.exists("orders:alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let store = InMemoryRateLimitStore::new();
        let counter = RateLimitCounter::first(Utc::now());

        store.set("orders:bob", counter, Duration::from_millis(50)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(store.get("orders:bob").await.unwrap(), None);
        assert!(!store.exists("orders:bob").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let store = InMemoryRateLimitStore::new();
        store
            .set("k", RateLimitCounter::first(Utc::now()), Duration::from_secs(5))
            .await
            .unwrap();
        store.remove("k").await.unwrap();
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_starts_and_continues_window() {
        let store = InMemoryRateLimitStore::new();
        let period = Duration::from_millis(100);

        let first = store.increment("k", period).await.unwrap().unwrap();
        let second = store.increment("k", period).await.unwrap().unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(second.count, 2);
        assert_eq!(first.timestamp, second.timestamp);

        tokio::time::sleep(Duration::from_millis(130)).await;
        let rolled = store.increment("k", period).await.unwrap().unwrap();
        assert_eq!(rolled.count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment("hot", Duration::from_secs(10)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.get("hot").await.unwrap().unwrap().count, 50);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryRateLimitStore::new();
        let now = Utc::now();
        store.set("short", RateLimitCounter::first(now), Duration::from_millis(10)).await.unwrap();
        store.set("long", RateLimitCounter::first(now), Duration::from_secs(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
