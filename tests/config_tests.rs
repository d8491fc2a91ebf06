//! # Configuration Loading Tests

use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

use dispatch_gateway::core::config::{LogFormat, RateLimitStoreConfig};
use dispatch_gateway::discovery::ProviderKind;
use dispatch_gateway::{GatewayConfig, GatewayError};

const YAML: &str = r#"
server:
  bind_address: "127.0.0.1:8181"
  request_timeout: 3s
service_discovery:
  type: pollregistry
  polling_interval: 250ms
registry:
  orders:
    - host: 10.0.0.1
      port: 9000
rate_limiting:
  client_id_header: X-Client
  key_prefix: "gw:"
  store:
    type: memory
    cleanup_interval: 30s
routes:
  - id: orders
    upstream_path_template: /orders/:id
    downstream_path_template: /v2/orders/{id}
    service_name: orders
    rate_limit:
      enabled: true
      period: 10s
      limit: 5
logging:
  level: debug
  format: json
"#;

fn write_temp(content: &str, suffix: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_load_yaml_file() {
    let file = write_temp(YAML, ".yaml");
    let config = GatewayConfig::load(file.path()).await.unwrap();

    assert_eq!(config.server.bind_address, "127.0.0.1:8181");
    assert_eq!(config.server.request_timeout, Duration::from_secs(3));
    assert_eq!(config.service_discovery.kind().unwrap(), ProviderKind::ActivePoll);
    assert_eq!(config.service_discovery.polling_interval, Duration::from_millis(250));
    assert_eq!(config.registry["orders"][0].port, 9000);
    assert_eq!(config.rate_limiting.options.client_id_header, "X-Client");
    assert!(matches!(
        config.rate_limiting.store,
        RateLimitStoreConfig::Memory { cleanup_interval } if cleanup_interval == Duration::from_secs(30)
    ));

    let route = &config.routes[0];
    assert!(route.rate_limit.enabled);
    assert_eq!(route.rate_limit.limit, 5);
    assert_eq!(route.rate_limit.period, Duration::from_secs(10));
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[tokio::test]
async fn test_load_json_file() {
    let json = r#"{
        "server": { "bind_address": "127.0.0.1:8282" },
        "routes": [{
            "id": "status",
            "upstream_path_template": "/status",
            "downstream_path_template": "/status",
            "downstream_hosts": [{ "host": "127.0.0.1", "port": 9100 }]
        }]
    }"#;
    let file = write_temp(json, ".json");
    let config = GatewayConfig::load(file.path()).await.unwrap();

    assert_eq!(config.server.bind_address, "127.0.0.1:8282");
    assert!(config.routes[0].service_name.is_none());
    assert_eq!(config.routes[0].downstream_hosts.len(), 1);
    assert_eq!(config.service_discovery.kind().unwrap(), ProviderKind::Static);
}

#[tokio::test]
async fn test_invalid_files_are_configuration_errors() {
    let broken = write_temp("server: [unclosed", ".yaml");
    assert!(matches!(
        GatewayConfig::load(broken.path()).await,
        Err(GatewayError::Configuration { .. })
    ));

    let unknown_tag = write_temp("service_discovery:\n  type: Eureka\n", ".yaml");
    assert!(matches!(
        GatewayConfig::load(unknown_tag.path()).await,
        Err(GatewayError::Configuration { .. })
    ));

    assert!(GatewayConfig::load("/definitely/not/here.yaml").await.is_err());
}
