//! Fixed-window request counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Requests seen from one client on one route in the current window.
///
/// `timestamp` marks the start of the window. The JSON encoding
/// (`{"count":2,"timestamp":"2024-05-01T10:00:00Z"}`) is what distributed
/// stores persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitCounter {
    pub count: u64,
    pub timestamp: DateTime<Utc>,
}

impl RateLimitCounter {
    /// First request of a new window
    pub fn first(now: DateTime<Utc>) -> Self {
        Self { count: 1, timestamp: now }
    }

    /// Same window, one more request
    pub fn increment(self) -> Self {
        Self {
            count: self.count.saturating_add(1),
            timestamp: self.timestamp,
        }
    }

    /// When the window that started at `timestamp` closes
    pub fn window_end(&self, period: Duration) -> DateTime<Utc> {
        self.timestamp + window(period)
    }

    pub fn is_expired(&self, period: Duration, now: DateTime<Utc>) -> bool {
        now >= self.window_end(period)
    }

    /// Time left in the window, zero once it has closed
    pub fn remaining_ttl(&self, period: Duration, now: DateTime<Utc>) -> Duration {
        (self.window_end(period) - now).to_std().unwrap_or(Duration::ZERO)
    }
}

fn window(period: Duration) -> chrono::Duration {
    chrono::Duration::from_std(period).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}
