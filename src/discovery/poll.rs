//! # Active-Poll Provider
//!
//! A background task calls the wrapped provider every `interval` and swaps in
//! the result as a new snapshot. `resolve()` hands out the latest snapshot
//! without any I/O, so its latency does not depend on how slow the registry is.
//!
//! A failed refresh keeps the previous snapshot. The loop only ends when the
//! provider is stopped or dropped.

use async_trait::async_trait;
use metrics::counter;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ServiceDiscoveryProvider;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::Endpoint;

#[derive(Default)]
struct PollState {
    snapshot: RwLock<Arc<Vec<Endpoint>>>,
    refreshes: AtomicU64,
    failures: AtomicU64,
}

/// Provider serving a snapshot refreshed on a timer
pub struct PollingProvider {
    service: String,
    state: Arc<PollState>,
    cancel: CancellationToken,
}

impl PollingProvider {
    /// Start polling `inner` every `interval`; the first refresh happens immediately
    ///
    /// Must be called from inside a tokio runtime.
    pub fn start(
        service: impl Into<String>,
        inner: Arc<dyn ServiceDiscoveryProvider>,
        interval: Duration,
    ) -> GatewayResult<Arc<Self>> {
        if interval.is_zero() {
            return Err(GatewayError::config("polling interval must be greater than 0"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GatewayError::internal(format!("cannot start poller outside a runtime: {}", e)))?;

        let provider = Arc::new(Self {
            service: service.into(),
            state: Arc::new(PollState::default()),
            cancel: CancellationToken::new(),
        });

        runtime.spawn(refresh_loop(
            provider.service.clone(),
            provider.state.clone(),
            inner,
            interval,
            provider.cancel.clone(),
        ));
        info!(service = %provider.service, interval = ?interval, "Started registry poller");
        Ok(provider)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Latest good endpoint set, empty until the first successful refresh
    pub fn snapshot(&self) -> Arc<Vec<Endpoint>> {
        self.state.snapshot.read().clone()
    }

    /// Completed successful refreshes
    pub fn refresh_count(&self) -> u64 {
        self.state.refreshes.load(Ordering::Relaxed)
    }

    /// Refreshes that failed and left the snapshot untouched
    pub fn failure_count(&self) -> u64 {
        self.state.failures.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!(service = %self.service, "Stopping registry poller");
            self.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for PollingProvider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ServiceDiscoveryProvider for PollingProvider {
    async fn resolve(&self) -> GatewayResult<Vec<Endpoint>> {
        Ok(self.snapshot().as_ref().clone())
    }
}

async fn refresh_loop(
    service: String,
    state: Arc<PollState>,
    inner: Arc<dyn ServiceDiscoveryProvider>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // No lock is held while the registry call is in flight.
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = inner.resolve() => result,
        };

        match result {
            Ok(endpoints) => {
                debug!(service = %service, count = endpoints.len(), "Refreshed endpoint snapshot");
                *state.snapshot.write() = Arc::new(endpoints);
                state.refreshes.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                warn!(service = %service, error = %err, "Registry refresh failed, keeping previous snapshot");
                counter!("gateway_discovery_refresh_failures_total", "service" => service.clone()).increment(1);
                state.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    debug!(service = %service, "Registry poller exited");
}
