//! # Rate Limiting System
//!
//! Fixed-window, per-client request quotas backed by a pluggable counter store.
//!
//! ## Architecture
//! - [`RateLimitCounter`]: `{count, timestamp}` for one client on one route
//! - [`RateLimitStore`]: `set/get/exists/remove` with absolute TTL, plus an optional
//!   atomic increment that backends with such a primitive implement
//! - [`RateLimiter`]: the admission check run by the rate limiting stage
//!
//! Keys look like `{prefix}{route_id}:{client}`. The store alone expires entries;
//! the limiter never deletes anything.

pub mod counter;
pub mod limiter;
pub mod stores;

pub use counter::RateLimitCounter;
pub use limiter::{RateLimitDecision, RateLimiter};
pub use stores::{
    CounterLookup, DistributedCache, DistributedCacheRateLimitStore, InMemoryRateLimitStore,
    MemoryDistributedCache, RateLimitStore, RedisCacheConfig, RedisDistributedCache, StoreResult,
};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during rate limiting operations
#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("Redis connection error: {0}")]
    Redis(#[from] redis::RedisError),
}

fn default_period() -> Duration {
    Duration::from_secs(1)
}

fn default_limit() -> u64 {
    100
}

/// Per-route quota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Whether the route is limited at all
    #[serde(default)]
    pub enabled: bool,

    /// Client identities that are never limited
    #[serde(default)]
    pub client_whitelist: Vec<String>,

    /// Length of one fixed window
    #[serde(with = "humantime_serde", default = "default_period")]
    pub period: Duration,

    /// Maximum requests admitted per window
    #[serde(default = "default_limit")]
    pub limit: u64,
}

impl RateLimitRule {
    pub fn new(limit: u64, period: Duration) -> Self {
        Self {
            enabled: true,
            client_whitelist: Vec::new(),
            period,
            limit,
        }
    }

    pub fn is_whitelisted(&self, client: &str) -> bool {
        self.client_whitelist.iter().any(|c| c == client)
    }
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            enabled: false,
            client_whitelist: Vec::new(),
            period: default_period(),
            limit: default_limit(),
        }
    }
}

fn default_client_id_header() -> String {
    "ClientId".to_string()
}

fn default_status_code() -> u16 {
    429
}

/// Gateway-wide rate limiting options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitOptions {
    /// Header carrying the client identity
    #[serde(default = "default_client_id_header")]
    pub client_id_header: String,

    /// Body of rejected responses; defaults to a message naming the quota
    #[serde(default)]
    pub quota_exceeded_message: Option<String>,

    /// Status of rejected responses
    #[serde(default = "default_status_code")]
    pub http_status_code: u16,

    /// Suppress `X-Rate-Limit-*` headers on admitted responses
    #[serde(default)]
    pub disable_rate_limit_headers: bool,

    /// Prefix prepended to every counter key
    #[serde(default)]
    pub key_prefix: String,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            client_id_header: default_client_id_header(),
            quota_exceeded_message: None,
            http_status_code: default_status_code(),
            disable_rate_limit_headers: false,
            key_prefix: String::new(),
        }
    }
}

impl RateLimitOptions {
    /// Message returned with a rejection
    pub fn quota_message(&self, rule: &RateLimitRule) -> String {
        match &self.quota_exceeded_message {
            Some(message) => message.clone(),
            None => format!(
                "API calls quota exceeded! maximum admitted {} per {}.",
                rule.limit,
                humantime::format_duration(rule.period)
            ),
        }
    }
}
