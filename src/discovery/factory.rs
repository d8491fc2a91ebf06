//! # Provider Factory
//!
//! Chooses the provider for a route and memoizes polling providers so each
//! service is polled by exactly one background task, however many requests
//! ask for it at once.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::poll::PollingProvider;
use super::registry::{RegistryClient, RegistryQuery};
use super::static_provider::{ConfigurationProvider, StaticProvider};
use super::{ProviderKind, ServiceDiscoveryProvider, ServiceProviderConfiguration};
use crate::core::error::GatewayResult;
use crate::core::types::DownstreamRoute;

/// Snapshot of the poller cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollerCacheStats {
    pub live_pollers: usize,
    /// Pollers ever constructed, including ones since deregistered
    pub constructions: u64,
}

/// At most one [`PollingProvider`] per service name
///
/// Owned by the composition root and shared by handle. Lookup and insertion
/// happen in the same critical section.
#[derive(Default)]
pub struct PollerCache {
    pollers: Mutex<HashMap<String, Arc<PollingProvider>>>,
    constructions: AtomicU64,
}

impl PollerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the poller for `service`, starting one around `inner` if none exists
    pub fn get_or_start(
        &self,
        service: &str,
        inner: Arc<dyn ServiceDiscoveryProvider>,
        interval: Duration,
    ) -> GatewayResult<Arc<PollingProvider>> {
        let mut pollers = self.pollers.lock();
        if let Some(existing) = pollers.get(service) {
            return Ok(existing.clone());
        }

        let poller = PollingProvider::start(service, inner, interval)?;
        self.constructions.fetch_add(1, Ordering::SeqCst);
        pollers.insert(service.to_string(), poller.clone());
        Ok(poller)
    }

    pub fn get(&self, service: &str) -> Option<Arc<PollingProvider>> {
        self.pollers.lock().get(service).cloned()
    }

    /// Stop and forget the poller of one service; returns whether one existed
    pub fn deregister(&self, service: &str) -> bool {
        let removed = self.pollers.lock().remove(service);
        match removed {
            Some(poller) => {
                poller.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every poller
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.pollers.lock().drain().map(|(_, poller)| poller).collect();
        let count = drained.len();
        for poller in drained {
            poller.stop();
        }
        info!(stopped = count, "Poller cache shut down");
    }

    pub fn stats(&self) -> PollerCacheStats {
        PollerCacheStats {
            live_pollers: self.pollers.lock().len(),
            constructions: self.constructions.load(Ordering::SeqCst),
        }
    }
}

/// Builds the discovery provider for a route
pub struct ProviderFactory {
    registry: Arc<dyn RegistryClient>,
    pollers: Arc<PollerCache>,
}

impl ProviderFactory {
    pub fn new(registry: Arc<dyn RegistryClient>, pollers: Arc<PollerCache>) -> Self {
        Self { registry, pollers }
    }

    pub fn pollers(&self) -> &Arc<PollerCache> {
        &self.pollers
    }

    /// Provider for `route` under `config`
    ///
    /// Routes without a service name are served from their configured hosts.
    /// Otherwise the type tag decides: an unknown tag fails with
    /// `UnsupportedProviderKind` before anything is built.
    pub fn get_provider(
        &self,
        config: &ServiceProviderConfiguration,
        route: &DownstreamRoute,
    ) -> GatewayResult<Arc<dyn ServiceDiscoveryProvider>> {
        let Some(service) = route.service_name.as_deref() else {
            return Ok(Arc::new(ConfigurationProvider::new(route.downstream_hosts.clone())));
        };

        let kind = config.kind()?;
        let static_provider = Arc::new(StaticProvider::new(
            self.registry.clone(),
            RegistryQuery::new(config, service),
            config.request_timeout,
        ));

        match kind {
            ProviderKind::Static => {
                debug!(service, "Using static registry provider");
                Ok(static_provider)
            }
            ProviderKind::ActivePoll => {
                let poller = self
                    .pollers
                    .get_or_start(service, static_provider, config.polling_interval)?;
                Ok(poller)
            }
        }
    }
}
