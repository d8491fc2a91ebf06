//! # Fixed-Window Rate Limiter
//!
//! For each request the limiter counts one hit against `{prefix}{route}:{client}`:
//! - absent or expired counter: write `{1, now}` with ttl = period
//! - otherwise: write `{count + 1, timestamp}` with ttl = time left in the window
//!
//! The request is rejected once the count exceeds the limit. Rejected requests
//! still count. Store failures fail open: the request is admitted and the error
//! is logged and counted.

use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::stores::{RateLimitStore, StoreResult};
use super::{RateLimitCounter, RateLimitOptions, RateLimitRule};
use crate::core::types::IncomingRequest;

const DEFAULT_CLIENT_ID: &str = "client";

/// Result of a rate limit check
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitDecision {
    /// The route is not limited or the client is whitelisted
    Bypassed,
    /// Admitted within the quota
    Allowed {
        limit: u64,
        remaining: u64,
        reset_at: DateTime<Utc>,
    },
    /// Quota exhausted for the current window
    Exceeded {
        limit: u64,
        period: Duration,
        retry_after: Duration,
    },
    /// The store failed; the request is admitted anyway
    FailedOpen,
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Exceeded { .. })
    }
}

/// Admission check over a [`RateLimitStore`]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    options: RateLimitOptions,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, options: RateLimitOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &RateLimitOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    /// Identity the quota is tracked against; requests without the client id
    /// header share one bucket
    pub fn client_identity(&self, request: &IncomingRequest) -> String {
        request
            .header(&self.options.client_id_header)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_CLIENT_ID)
            .to_string()
    }

    pub fn counter_key(&self, route_id: &str, client: &str) -> String {
        format!("{}{}:{}", self.options.key_prefix, route_id, client)
    }

    /// Count one request from `client` on `route_id` and decide whether to admit it
    #[instrument(skip(self, rule), fields(limit = rule.limit, period = ?rule.period))]
    pub async fn check(&self, route_id: &str, client: &str, rule: &RateLimitRule) -> RateLimitDecision {
        if !rule.enabled {
            return RateLimitDecision::Bypassed;
        }
        if rule.is_whitelisted(client) {
            debug!("Client is whitelisted");
            return RateLimitDecision::Bypassed;
        }

        let key = self.counter_key(route_id, client);
        let counter = match self.count_request(&key, rule.period).await {
            Ok(counter) => counter,
            Err(err) => {
                warn!(key = %key, error = %err, "Rate limit store failed, admitting request");
                counter!("gateway_rate_limit_store_errors_total", "route" => route_id.to_string())
                    .increment(1);
                return RateLimitDecision::FailedOpen;
            }
        };

        let now = Utc::now();
        if counter.count > rule.limit {
            debug!(count = counter.count, "Quota exceeded");
            counter!("gateway_rate_limit_rejected_total", "route" => route_id.to_string()).increment(1);
            return RateLimitDecision::Exceeded {
                limit: rule.limit,
                period: rule.period,
                retry_after: counter.remaining_ttl(rule.period, now),
            };
        }

        counter!("gateway_rate_limit_allowed_total", "route" => route_id.to_string()).increment(1);
        RateLimitDecision::Allowed {
            limit: rule.limit,
            remaining: rule.limit - counter.count,
            reset_at: counter.window_end(rule.period),
        }
    }

    async fn count_request(&self, key: &str, period: Duration) -> StoreResult<RateLimitCounter> {
        if let Some(counter) = self.store.increment(key, period).await? {
            return Ok(counter);
        }

        let now = Utc::now();
        let (counter, ttl) = match self.store.get(key).await? {
            Some(existing) if !existing.is_expired(period, now) => {
                (existing.increment(), existing.remaining_ttl(period, now))
            }
            _ => (RateLimitCounter::first(now), period),
        };

        self.store.set(key, counter, ttl).await?;
        Ok(counter)
    }
}
