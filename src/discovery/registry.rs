//! Registry backend abstraction and the built-in in-memory registry.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::ServiceProviderConfiguration;
use crate::core::error::GatewayResult;
use crate::core::types::Endpoint;

/// Everything a registry backend needs to look up one service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryQuery {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub service_name: String,
    pub token: Option<String>,
}

impl RegistryQuery {
    pub fn new(config: &ServiceProviderConfiguration, service_name: impl Into<String>) -> Self {
        Self {
            scheme: config.scheme.clone(),
            host: config.host.clone(),
            port: config.port,
            service_name: service_name.into(),
            token: config.token.clone(),
        }
    }

    /// Base URL of the registry
    pub fn registry_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Registry backend (Consul, Eureka, a service mesh control plane...)
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn resolve(&self, query: &RegistryQuery) -> GatewayResult<Vec<Endpoint>>;
}

/// Registry held in process memory, seeded from configuration or by tests
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    services: DashMap<String, Vec<Endpoint>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one endpoint to a service
    pub fn register(&self, service: &str, endpoint: Endpoint) {
        let mut endpoints = self.services.entry(service.to_string()).or_default();
        if !endpoints.contains(&endpoint) {
            endpoints.push(endpoint);
        }
    }

    /// Replace every endpoint of a service
    pub fn set_endpoints(&self, service: &str, endpoints: Vec<Endpoint>) {
        self.services.insert(service.to_string(), endpoints);
    }

    pub fn deregister(&self, service: &str, endpoint: &Endpoint) {
        if let Some(mut endpoints) = self.services.get_mut(service) {
            endpoints.retain(|e| e != endpoint);
        }
    }

    pub fn remove_service(&self, service: &str) {
        self.services.remove(service);
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn resolve(&self, query: &RegistryQuery) -> GatewayResult<Vec<Endpoint>> {
        let endpoints = self
            .services
            .get(&query.service_name)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        debug!(service = %query.service_name, count = endpoints.len(), "Resolved from in-memory registry");
        Ok(endpoints)
    }
}
