//! Providers that do their work at `resolve()` time.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use super::registry::{RegistryClient, RegistryQuery};
use super::ServiceDiscoveryProvider;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::Endpoint;

/// Queries the registry backend on every call, bounded by a timeout
pub struct StaticProvider {
    client: Arc<dyn RegistryClient>,
    query: RegistryQuery,
    timeout: Duration,
}

impl StaticProvider {
    pub fn new(client: Arc<dyn RegistryClient>, query: RegistryQuery, timeout: Duration) -> Self {
        Self { client, query, timeout }
    }

    pub fn service_name(&self) -> &str {
        &self.query.service_name
    }
}

#[async_trait]
impl ServiceDiscoveryProvider for StaticProvider {
    #[instrument(skip(self), fields(service = %self.query.service_name))]
    async fn resolve(&self) -> GatewayResult<Vec<Endpoint>> {
        match tokio::time::timeout(self.timeout, self.client.resolve(&self.query)).await {
            Ok(Ok(endpoints)) => {
                debug!(count = endpoints.len(), "Registry returned endpoints");
                Ok(endpoints)
            }
            Ok(Err(err @ GatewayError::ResolutionFailure { .. })) => Err(err),
            Ok(Err(err)) => Err(GatewayError::resolution(&self.query.service_name, err.to_string())),
            Err(_) => Err(GatewayError::resolution(
                &self.query.service_name,
                format!("registry call timed out after {:?}", self.timeout),
            )),
        }
    }
}

/// Endpoints listed directly on a route
pub struct ConfigurationProvider {
    endpoints: Vec<Endpoint>,
}

impl ConfigurationProvider {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl ServiceDiscoveryProvider for ConfigurationProvider {
    async fn resolve(&self) -> GatewayResult<Vec<Endpoint>> {
        Ok(self.endpoints.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{InMemoryRegistry, ServiceProviderConfiguration};

    struct SlowRegistry;

    #[async_trait]
    impl RegistryClient for SlowRegistry {
        async fn resolve(&self, _query: &RegistryQuery) -> GatewayResult<Vec<Endpoint>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![Endpoint::new("late", 80)])
        }
    }

    struct BrokenRegistry;

    #[async_trait]
    impl RegistryClient for BrokenRegistry {
        async fn resolve(&self, _query: &RegistryQuery) -> GatewayResult<Vec<Endpoint>> {
            Err(GatewayError::internal("connection reset"))
        }
    }

    fn query() -> RegistryQuery {
        RegistryQuery::new(&ServiceProviderConfiguration::default(), "orders")
    }

    #[tokio::test]
    async fn test_resolves_through_registry() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register("orders", Endpoint::new("10.0.0.1", 8080));
        let provider = StaticProvider::new(registry.clone(), query(), Duration::from_secs(1));

        assert_eq!(provider.resolve().await.unwrap(), vec![Endpoint::new("10.0.0.1", 8080)]);

        registry.register("orders", Endpoint::new("10.0.0.2", 8080));
        assert_eq!(provider.resolve().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_becomes_resolution_failure() {
        let provider = StaticProvider::new(Arc::new(SlowRegistry), query(), Duration::from_millis(20));
        match provider.resolve().await {
            Err(GatewayError::ResolutionFailure { service, reason }) => {
                assert_eq!(service, "orders");
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backend_errors_are_wrapped() {
        let provider = StaticProvider::new(Arc::new(BrokenRegistry), query(), Duration::from_secs(1));
        assert!(matches!(
            provider.resolve().await,
            Err(GatewayError::ResolutionFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_configuration_provider_returns_hosts() {
        let provider = ConfigurationProvider::new(vec![Endpoint::new("backend", 9000)]);
        assert_eq!(provider.resolve().await.unwrap(), vec![Endpoint::new("backend", 9000)]);
    }
}
