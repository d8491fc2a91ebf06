//! # Metrics
//!
//! Counters and histograms are recorded through the `metrics` facade wherever
//! they happen (rate limiter, pollers, dispatch). This module holds the
//! request-level helpers and installs the Prometheus exporter in the binary.
//! Without an installed recorder every call is a no-op.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::core::error::{GatewayError, GatewayResult};

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Install the Prometheus recorder with a scrape listener on `addr`
pub fn install_prometheus(addr: SocketAddr) -> GatewayResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), LATENCY_BUCKETS)
        .map_err(|e| GatewayError::config(format!("Failed to set histogram buckets: {}", e)))?
        .install()
        .map_err(|e| GatewayError::config(format!("Failed to install Prometheus exporter: {}", e)))?;

    info!(address = %addr, "Prometheus exporter listening");
    Ok(())
}

/// Record one request that went through the stage chain
pub fn record_request(method: &str, route: &str, status_code: u16, duration: Duration) {
    let method = method.to_string();
    let route = route.to_string();
    let status = status_code.to_string();

    metrics::counter!("gateway_requests_total", "method" => method.clone(), "route" => route.clone(), "status_code" => status.clone())
        .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "method" => method.clone(), "route" => route.clone())
        .record(duration.as_secs_f64());

    if status_code >= 500 {
        metrics::counter!("gateway_errors_total", "method" => method, "route" => route, "status_code" => status)
            .increment(1);
    }
}

/// Record one call to a downstream service
pub fn record_upstream_request(service: &str, status_code: Option<u16>, duration: Duration) {
    let service = service.to_string();
    let status = status_code.map(|s| s.to_string()).unwrap_or_else(|| "error".to_string());

    metrics::counter!("gateway_upstream_requests_total", "service" => service.clone(), "status_code" => status)
        .increment(1);
    metrics::histogram!("gateway_upstream_request_duration_seconds", "service" => service)
        .record(duration.as_secs_f64());
}
