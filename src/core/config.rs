//! # Configuration Module
//!
//! This module provides the configuration structures and loading mechanisms.
//!
//! ## Key Features
//! - YAML/JSON configuration parsing with serde
//! - Environment variable override support (`GATEWAY_<SECTION>_<FIELD>`)
//! - Validation that reports every problem at once

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{DownstreamRoute, Endpoint};
use crate::discovery::{ProviderKind, ServiceProviderConfiguration};
use crate::middleware::auth::ApiKeyCredential;
use crate::rate_limiting::stores::RedisCacheConfig;
use crate::rate_limiting::RateLimitOptions;

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener and request limits
    #[serde(default)]
    pub server: ServerConfig,

    /// Registry provider settings shared by every route
    #[serde(default)]
    pub service_discovery: ServiceProviderConfiguration,

    /// Endpoints seeded into the built-in registry, keyed by service name
    #[serde(default)]
    pub registry: HashMap<String, Vec<Endpoint>>,

    /// Global rate limiting options and counter store
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Credentials for the built-in API key authenticators
    #[serde(default)]
    pub authentication: AuthenticationConfig,

    /// Route definitions
    #[serde(default)]
    pub routes: Vec<DownstreamRoute>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Load configuration from a file, picking the parser from its extension
    /// (`.json` for JSON, anything else for YAML)
    pub async fn load<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let is_json = path
            .as_ref()
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if is_json {
            Self::load_from_json(path).await
        } else {
            Self::load_from_file(path).await
        }
    }

    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_yaml::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from JSON
    pub async fn load_from_json<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        let mut config: GatewayConfig = serde_json::from_str(&content)
            .map_err(|e| GatewayError::config(format!("Failed to parse JSON config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>
    /// For example: GATEWAY_DISCOVERY_POLLING_INTERVAL=500ms
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup` instead of the process environment
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> GatewayResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Some(timeout) = lookup("GATEWAY_SERVER_REQUEST_TIMEOUT") {
            self.server.request_timeout = parse_duration("GATEWAY_SERVER_REQUEST_TIMEOUT", &timeout)?;
        }

        if let Some(size) = lookup("GATEWAY_SERVER_MAX_BODY_SIZE") {
            self.server.max_body_size = size
                .parse()
                .map_err(|e| crate::config_error!("Invalid GATEWAY_SERVER_MAX_BODY_SIZE: {}", e))?;
        }

        if let Some(addr) = lookup("GATEWAY_METRICS_ADDRESS") {
            self.server.metrics_address = Some(addr);
        }

        // Service discovery overrides
        if let Some(host) = lookup("GATEWAY_DISCOVERY_HOST") {
            self.service_discovery.host = host;
        }

        if let Some(port) = lookup("GATEWAY_DISCOVERY_PORT") {
            self.service_discovery.port = port
                .parse()
                .map_err(|e| crate::config_error!("Invalid GATEWAY_DISCOVERY_PORT: {}", e))?;
        }

        if let Some(token) = lookup("GATEWAY_DISCOVERY_TOKEN") {
            self.service_discovery.token = Some(token);
        }

        if let Some(kind) = lookup("GATEWAY_DISCOVERY_TYPE") {
            self.service_discovery.provider_type = kind;
        }

        if let Some(interval) = lookup("GATEWAY_DISCOVERY_POLLING_INTERVAL") {
            self.service_discovery.polling_interval =
                parse_duration("GATEWAY_DISCOVERY_POLLING_INTERVAL", &interval)?;
        }

        if let Some(url) = lookup("GATEWAY_RATE_LIMIT_REDIS_URL") {
            self.rate_limiting.store = match std::mem::take(&mut self.rate_limiting.store) {
                RateLimitStoreConfig::Redis(mut redis) => {
                    redis.url = url;
                    RateLimitStoreConfig::Redis(redis)
                }
                RateLimitStoreConfig::Memory { .. } => RateLimitStoreConfig::Redis(
                    serde_json::from_value(serde_json::json!({ "url": url }))?,
                ),
            };
        }

        // Logging configuration overrides
        if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Some(format) = lookup("GATEWAY_LOG_FORMAT") {
            self.logging.format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => return Err(crate::config_error!("Invalid GATEWAY_LOG_FORMAT: {}", other)),
            };
        }

        Ok(())
    }

    /// Configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(format!("bind_address '{}' is not a socket address", self.server.bind_address));
        }

        if let Some(ref addr) = self.server.metrics_address {
            if addr.parse::<SocketAddr>().is_err() {
                errors.push(format!("metrics_address '{}' is not a socket address", addr));
            }
        }

        if self.server.request_timeout.is_zero() {
            errors.push("request_timeout must be greater than 0".to_string());
        }

        if self.server.max_body_size == 0 {
            errors.push("max_body_size must be greater than 0".to_string());
        }

        match self.service_discovery.kind() {
            Ok(ProviderKind::ActivePoll) if self.service_discovery.polling_interval.is_zero() => {
                errors.push("polling_interval must be greater than 0".to_string());
            }
            Ok(_) => {}
            Err(err) => errors.push(err.to_string()),
        }

        if self.service_discovery.request_timeout.is_zero() {
            errors.push("service_discovery.request_timeout must be greater than 0".to_string());
        }

        if !(100..=599).contains(&self.rate_limiting.options.http_status_code) {
            errors.push(format!(
                "rate_limiting.http_status_code {} is not an HTTP status",
                self.rate_limiting.options.http_status_code
            ));
        }

        if self.rate_limiting.options.client_id_header.is_empty() {
            errors.push("rate_limiting.client_id_header cannot be empty".to_string());
        }

        let mut seen_ids = HashSet::new();
        for route in &self.routes {
            if route.id.is_empty() {
                errors.push("Route id cannot be empty".to_string());
            } else if !seen_ids.insert(route.id.as_str()) {
                errors.push(format!("Duplicate route id '{}'", route.id));
            }

            if !route.upstream_path_template.starts_with('/') {
                errors.push(format!("Route '{}': upstream_path_template must start with '/'", route.id));
            }

            if !route.downstream_path_template.starts_with('/') {
                errors.push(format!("Route '{}': downstream_path_template must start with '/'", route.id));
            }

            if route.service_name.is_none() && route.downstream_hosts.is_empty() {
                errors.push(format!(
                    "Route '{}' needs a service_name or at least one downstream host",
                    route.id
                ));
            }

            if route.rate_limit.enabled && route.rate_limit.period.is_zero() {
                errors.push(format!("Route '{}': rate limit period must be greater than 0", route.id));
            }

            if let Some(ref auth) = route.authentication {
                if auth.provider_key.is_empty() {
                    errors.push(format!("Route '{}': authentication provider_key cannot be empty", route.id));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::config(errors.join("; ")))
        }
    }
}

fn parse_duration(name: &str, value: &str) -> GatewayResult<Duration> {
    humantime::parse_duration(value).map_err(|e| crate::config_error!("Invalid {}: {}", name, e))
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024 // 10MB
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listener address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Deadline for one request through the whole stage chain
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Maximum request body size
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Prometheus scrape listener; metrics are not exported when unset
    #[serde(default)]
    pub metrics_address: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            request_timeout: default_request_timeout(),
            max_body_size: default_max_body_size(),
            metrics_address: None,
        }
    }
}

/// Rate limiting section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(flatten)]
    pub options: RateLimitOptions,

    #[serde(default)]
    pub store: RateLimitStoreConfig,
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(60)
}

/// Where rate limit counters live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateLimitStoreConfig {
    /// Process-local counters
    Memory {
        #[serde(with = "humantime_serde", default = "default_cleanup_interval")]
        cleanup_interval: Duration,
    },
    /// Counters shared through Redis
    Redis(RedisCacheConfig),
}

impl Default for RateLimitStoreConfig {
    fn default() -> Self {
        Self::Memory {
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

/// API key credentials grouped by authentication provider key
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    #[serde(default)]
    pub api_keys: HashMap<String, Vec<ApiKeyCredential>>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  bind_address: "127.0.0.1:9000"
  request_timeout: 5s
service_discovery:
  host: registry.local
  port: 8500
  type: PollRegistry
  polling_interval: 250ms
rate_limiting:
  client_id_header: X-Client
  store:
    type: memory
routes:
  - id: orders
    upstream_path_template: /orders/:id
    downstream_path_template: /api/orders/{id}
    service_name: orders
    rate_limit:
      enabled: true
      period: 1s
      limit: 3
"#;

    #[test]
    fn test_parse_sample_config() {
        let config: GatewayConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.request_timeout, Duration::from_secs(5));
        assert_eq!(config.service_discovery.polling_interval, Duration::from_millis(250));
        assert_eq!(config.service_discovery.kind().unwrap(), ProviderKind::ActivePoll);
        assert_eq!(config.rate_limiting.options.client_id_header, "X-Client");
        assert_eq!(config.rate_limiting.options.http_status_code, 429);
        assert_eq!(config.routes[0].rate_limit.limit, 3);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_validate_reports_unknown_provider_and_bad_routes() {
        let mut config: GatewayConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.service_discovery.provider_type = "Eureka".to_string();
        let mut dup = config.routes[0].clone();
        dup.service_name = None;
        config.routes.push(dup);

        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("Eureka"));
        assert!(message.contains("Duplicate route id 'orders'"));
        assert!(message.contains("needs a service_name"));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let mut config = GatewayConfig::default();
        let vars: HashMap<&str, &str> = [
            ("GATEWAY_SERVER_REQUEST_TIMEOUT", "2s"),
            ("GATEWAY_DISCOVERY_TYPE", "pollregistry"),
            ("GATEWAY_DISCOVERY_POLLING_INTERVAL", "100ms"),
            ("GATEWAY_LOG_FORMAT", "JSON"),
            ("GATEWAY_RATE_LIMIT_REDIS_URL", "redis://cache:6379"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides_from(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.request_timeout, Duration::from_secs(2));
        assert_eq!(config.service_discovery.kind().unwrap(), ProviderKind::ActivePoll);
        assert_eq!(config.service_discovery.polling_interval, Duration::from_millis(100));
        assert_eq!(config.logging.format, LogFormat::Json);
        match config.rate_limiting.store {
            RateLimitStoreConfig::Redis(redis) => assert_eq!(redis.url, "redis://cache:6379"),
            other => panic!("unexpected store {:?}", other),
        }
    }

    #[test]
    fn test_invalid_override_is_configuration_error() {
        let mut config = GatewayConfig::default();
        let err = config
            .apply_overrides_from(|name| (name == "GATEWAY_DISCOVERY_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }

    #[test]
    fn test_default_config_is_valid() {
        GatewayConfig::default().validate().unwrap();
    }
}
