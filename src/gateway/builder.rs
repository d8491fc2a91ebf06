//! # Gateway Composition Root
//!
//! [`GatewayBuilder`] turns a validated [`GatewayConfig`] into a running
//! [`Gateway`]: it builds the rate limit store, the registry client, the poller
//! cache, the route table and the authenticators, wires them into the default
//! stage chain and applies any overrides and branches.
//!
//! The poller cache is owned here. Call [`Gateway::shutdown`] to stop every
//! background refresh loop.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::core::config::{GatewayConfig, RateLimitStoreConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest};
use crate::discovery::{InMemoryRegistry, PollerCache, ProviderFactory, RegistryClient};
use crate::middleware::{
    Authenticator, AuthenticatorRegistry, BranchPredicate, DownstreamClient, GatewayServices,
    HttpDownstreamClient, Pipeline, PipelineBuilder, Stage, StageSlot,
};
use crate::rate_limiting::{
    DistributedCacheRateLimitStore, InMemoryRateLimitStore, RateLimitStore, RateLimiter, RedisDistributedCache,
};
use crate::routing::{MatchitRouteTable, RouteTable};

/// Collects configuration, collaborators and pipeline customizations
pub struct GatewayBuilder {
    config: GatewayConfig,
    registry: Option<Arc<dyn RegistryClient>>,
    client: Option<Arc<dyn DownstreamClient>>,
    routes: Option<Arc<dyn RouteTable>>,
    store: Option<Arc<dyn RateLimitStore>>,
    authenticators: Vec<(String, Arc<dyn Authenticator>)>,
    overrides: Vec<(StageSlot, Arc<dyn Stage>)>,
    branches: Vec<(BranchPredicate, Pipeline)>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            registry: None,
            client: None,
            routes: None,
            store: None,
            authenticators: Vec::new(),
            overrides: Vec::new(),
            branches: Vec::new(),
        }
    }

    /// Registry backend; defaults to an [`InMemoryRegistry`] seeded from `registry`
    pub fn registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Downstream client; defaults to [`HttpDownstreamClient`]
    pub fn downstream_client(mut self, client: Arc<dyn DownstreamClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Route table; defaults to a matchit table built from `routes`
    pub fn route_table(mut self, routes: Arc<dyn RouteTable>) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Counter store; defaults to the store named in `rate_limiting.store`
    pub fn rate_limit_store(mut self, store: Arc<dyn RateLimitStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register an authenticator next to the configured API key providers
    pub fn authenticator(mut self, provider_key: impl Into<String>, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticators.push((provider_key.into(), authenticator));
        self
    }

    pub fn override_stage(mut self, slot: StageSlot, stage: Arc<dyn Stage>) -> Self {
        self.overrides.push((slot, stage));
        self
    }

    pub fn branch<P>(mut self, predicate: P, pipeline: Pipeline) -> Self
    where
        P: Fn(&IncomingRequest) -> bool + Send + Sync + 'static,
    {
        self.branches.push((Arc::new(predicate), pipeline));
        self
    }

    async fn build_store(&self) -> GatewayResult<(Arc<dyn RateLimitStore>, Option<JoinHandle<()>>)> {
        if let Some(store) = &self.store {
            return Ok((store.clone(), None));
        }

        match &self.config.rate_limiting.store {
            RateLimitStoreConfig::Memory { cleanup_interval } => {
                let store = Arc::new(InMemoryRateLimitStore::new());
                let cleanup = store.spawn_cleanup(*cleanup_interval);
                info!(cleanup_interval = ?cleanup_interval, "Using in-memory rate limit store");
                Ok((store, Some(cleanup)))
            }
            RateLimitStoreConfig::Redis(redis) => {
                // An unreachable server is not fatal; the limiter fails open until it connects.
                let cache = RedisDistributedCache::connect(redis)
                    .await
                    .map_err(|e| GatewayError::config(format!("Invalid rate limit store settings: {}", e)))?;
                info!(connected = cache.is_connected(), "Using Redis rate limit store");
                Ok((Arc::new(DistributedCacheRateLimitStore::new(cache)), None))
            }
        }
    }

    fn build_registry(&self) -> Arc<dyn RegistryClient> {
        if let Some(registry) = &self.registry {
            return registry.clone();
        }
        let registry = InMemoryRegistry::new();
        for (service, endpoints) in &self.config.registry {
            registry.set_endpoints(service, endpoints.clone());
        }
        Arc::new(registry)
    }

    /// Validate the configuration and assemble the gateway
    pub async fn build(self) -> GatewayResult<Gateway> {
        self.config.validate()?;

        let (store, cleanup) = self.build_store().await?;
        let registry = self.build_registry();
        let pollers = Arc::new(PollerCache::new());

        let routes: Arc<dyn RouteTable> = match &self.routes {
            Some(routes) => routes.clone(),
            None => Arc::new(MatchitRouteTable::from_routes(&self.config.routes)?),
        };

        let mut authenticators = AuthenticatorRegistry::from_config(&self.config.authentication);
        for (provider_key, authenticator) in self.authenticators {
            authenticators.register(provider_key, authenticator);
        }

        let client: Arc<dyn DownstreamClient> = match self.client {
            Some(client) => client,
            None => Arc::new(HttpDownstreamClient::new(self.config.server.request_timeout)?),
        };

        let services = GatewayServices {
            routes,
            rate_limiter: Arc::new(RateLimiter::new(store, self.config.rate_limiting.options.clone())),
            authenticators: Arc::new(authenticators),
            providers: Arc::new(ProviderFactory::new(registry, pollers.clone())),
            discovery: Arc::new(self.config.service_discovery.clone()),
            client,
            request_timeout: self.config.server.request_timeout,
        };

        let mut builder = PipelineBuilder::new(&services);
        for (slot, stage) in self.overrides {
            info!(slot = %slot, stage = stage.name(), "Overriding stage");
            builder = builder.override_stage(slot, stage);
        }
        for (predicate, pipeline) in self.branches {
            builder = builder.branch(move |request| predicate(request), pipeline);
        }
        let pipeline = builder.build()?;

        info!(
            routes = self.config.routes.len(),
            stages = ?pipeline.stage_names(),
            "Gateway assembled"
        );

        Ok(Gateway {
            config: Arc::new(self.config),
            services,
            pipeline,
            pollers,
            cleanup,
        })
    }
}

/// An assembled gateway: the frozen pipeline and the services behind it
pub struct Gateway {
    config: Arc<GatewayConfig>,
    services: GatewayServices,
    pipeline: Pipeline,
    pollers: Arc<PollerCache>,
    cleanup: Option<JoinHandle<()>>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn services(&self) -> &GatewayServices {
        &self.services
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn pollers(&self) -> &Arc<PollerCache> {
        &self.pollers
    }

    pub async fn execute(&self, request: IncomingRequest) -> GatewayResponse {
        self.pipeline.execute(request).await
    }

    /// Stop every poller and the store cleanup task
    pub fn shutdown(&self) {
        self.pollers.shutdown();
        if let Some(cleanup) = &self.cleanup {
            cleanup.abort();
        }
        info!("Gateway background tasks stopped");
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.abort();
        }
    }
}
