// Structured logging
pub mod logging;

// Metrics recording and the Prometheus exporter
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{install_prometheus, record_request, record_upstream_request};
