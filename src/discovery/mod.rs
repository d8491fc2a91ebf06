//! # Service Discovery Module
//!
//! Resolves a route's logical service name to the endpoints currently serving it.
//!
//! ## Providers
//! - [`StaticProvider`]: asks the registry backend on every `resolve()`
//! - [`PollingProvider`]: refreshes a cached snapshot on a background timer;
//!   `resolve()` only reads the snapshot
//! - [`ConfigurationProvider`]: fixed hosts listed on the route itself
//!
//! [`ProviderFactory`] picks the provider for a route and keeps at most one
//! [`PollingProvider`] per service name in its [`PollerCache`].

pub mod factory;
pub mod poll;
pub mod registry;
pub mod static_provider;

pub use factory::{PollerCache, PollerCacheStats, ProviderFactory};
pub use poll::PollingProvider;
pub use registry::{InMemoryRegistry, RegistryClient, RegistryQuery};
pub use static_provider::{ConfigurationProvider, StaticProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::Endpoint;

/// Resolves one service to its live endpoints
#[async_trait]
pub trait ServiceDiscoveryProvider: Send + Sync {
    async fn resolve(&self) -> GatewayResult<Vec<Endpoint>>;
}

/// Provider variant selected by the configuration's type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Query the registry on every request
    Static,
    /// Serve a snapshot refreshed in the background
    ActivePoll,
}

impl ProviderKind {
    /// Parse a type tag, ignoring case: `Registry` or empty select
    /// [`ProviderKind::Static`], `PollRegistry` selects [`ProviderKind::ActivePoll`]
    pub fn parse(tag: &str) -> GatewayResult<Self> {
        let trimmed = tag.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("registry") {
            Ok(Self::Static)
        } else if trimmed.eq_ignore_ascii_case("pollregistry") {
            Ok(Self::ActivePoll)
        } else {
            Err(GatewayError::UnsupportedProviderKind { tag: tag.to_string() })
        }
    }
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    8500
}

fn default_polling_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Where the registry lives and how to talk to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProviderConfiguration {
    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Access token forwarded to the registry
    #[serde(default)]
    pub token: Option<String>,

    /// Provider type tag, see [`ProviderKind::parse`]
    #[serde(default, rename = "type")]
    pub provider_type: String,

    /// Refresh period of polling providers
    #[serde(with = "humantime_serde", default = "default_polling_interval")]
    pub polling_interval: Duration,

    /// Upper bound on one registry call
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

impl ServiceProviderConfiguration {
    pub fn kind(&self) -> GatewayResult<ProviderKind> {
        ProviderKind::parse(&self.provider_type)
    }
}

impl Default for ServiceProviderConfiguration {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            host: default_host(),
            port: default_port(),
            token: None,
            provider_type: String::new(),
            polling_interval: default_polling_interval(),
            request_timeout: default_request_timeout(),
        }
    }
}
