//! # Structured Logging
//!
//! Installs the global `tracing` subscriber: an `EnvFilter` (from `RUST_LOG`,
//! falling back to the configured level) and a JSON or human-readable `fmt` layer.

use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::{LogFormat, LoggingConfig};
use crate::core::error::{GatewayError, GatewayResult};

/// Build the filter for `config`; `RUST_LOG` takes precedence
pub fn build_filter(config: &LoggingConfig) -> GatewayResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| GatewayError::config(format!("Invalid log level '{}': {}", config.level, e))),
    }
}

/// Initialize the tracing subscriber
///
/// Calling it twice is harmless: the second subscriber is discarded with a warning.
pub fn init_logging(config: &LoggingConfig) -> GatewayResult<()> {
    let env_filter = build_filter(config)?;

    let initialized = match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    if initialized.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return Ok(());
    }

    info!(level = %config.level, format = ?config.format, "Structured logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_configuration_error() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "info,gateway=notalevel".to_string(),
            format: LogFormat::Pretty,
        };
        assert!(matches!(build_filter(&config), Err(GatewayError::Configuration { .. })));
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig::default();
        init_logging(&config).unwrap();
        init_logging(&config).unwrap();
    }
}
