//! # Error Handling Module
//!
//! This module provides the error type for the gateway using the `thiserror` crate.
//! It defines every failure that can happen while building the gateway or while a
//! request travels through the stage chain, and maps each of them to an HTTP status
//! code and a client-safe message.
//!
//! Errors raised by stages never reach the client directly: they propagate to the
//! error responder stage, which turns them into a response with [`GatewayError::to_response`].
//! Internal details (registry addresses, store failures) stay in the logs.

use axum::http::StatusCode;
use serde_json::json;
use thiserror::Error;

use crate::core::types::GatewayResponse;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Error types for the gateway
///
/// The `#[error("...")]` attribute from `thiserror` implements `Display`
/// with the specified message. These messages are meant for logs; clients get
/// [`GatewayError::client_message`] instead.
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Configuration-related errors (invalid config, bad override target, etc.)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The provider type tag has no registered builder
    #[error("Unsupported service discovery provider type: '{tag}'")]
    UnsupportedProviderKind { tag: String },

    /// No route matches the incoming request
    #[error("No route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    /// Authentication failures (missing or invalid credentials)
    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    /// Authorization failures (claims do not satisfy the route requirements)
    #[error("Authorization failed: {reason}")]
    Authorization { reason: String },

    /// The registry backend could not resolve the service
    #[error("Failed to resolve service '{service}': {reason}")]
    ResolutionFailure { service: String, reason: String },

    /// The request deadline elapsed before the chain completed
    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The request was cancelled by the caller
    #[error("Request cancelled")]
    Cancelled,

    /// Downstream service call failed
    #[error("Downstream request failed: {message}")]
    Downstream { message: String },

    /// A pipeline stage failed
    #[error("Stage error ({stage}): {message}")]
    Stage { stage: String, message: String },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, sockets, etc.)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an authentication error with a custom reason
    pub fn auth<S: Into<String>>(reason: S) -> Self {
        Self::Authentication {
            reason: reason.into(),
        }
    }

    /// Create an authorization error with a custom reason
    pub fn authz<S: Into<String>>(reason: S) -> Self {
        Self::Authorization {
            reason: reason.into(),
        }
    }

    /// Create a resolution failure for a service
    pub fn resolution<S: Into<String>, R: Into<String>>(service: S, reason: R) -> Self {
        Self::ResolutionFailure {
            service: service.into(),
            reason: reason.into(),
        }
    }

    /// Create a stage error
    pub fn stage<S: Into<String>, M: Into<String>>(stage: S, message: M) -> Self {
        Self::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the HTTP status code returned to clients for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::ResolutionFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::Downstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            // Client closed request
            Self::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. }
            | Self::UnsupportedProviderKind { .. }
            | Self::Stage { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a string representation of the error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::UnsupportedProviderKind { .. } => "unsupported_provider_kind",
            Self::RouteNotFound { .. } => "route_not_found",
            Self::Authentication { .. } => "authentication_error",
            Self::Authorization { .. } => "authorization_error",
            Self::ResolutionFailure { .. } => "resolution_failure",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "request_cancelled",
            Self::Downstream { .. } => "downstream_error",
            Self::Stage { .. } => "stage_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
        }
    }

    /// Message safe to hand to clients.
    ///
    /// Only errors caused by the request itself echo their details; everything
    /// else gets a generic text so registry hosts, store addresses and stage
    /// internals are not leaked.
    pub fn client_message(&self) -> String {
        match self {
            Self::Authentication { .. } => "Authentication required".to_string(),
            Self::Authorization { .. } => "Access to this resource is forbidden".to_string(),
            Self::RouteNotFound { method, path } => format!("No route matches {} {}", method, path),
            Self::ResolutionFailure { .. } | Self::Downstream { .. } => {
                "The downstream service is unavailable".to_string()
            }
            Self::Timeout { .. } => "The request timed out".to_string(),
            Self::Cancelled => "The request was cancelled".to_string(),
            Self::Json { .. } => "Malformed request payload".to_string(),
            _ => "Internal gateway error".to_string(),
        }
    }

    /// Build the client-facing response for this error
    pub fn to_response(&self) -> GatewayResponse {
        let status = self.status_code();
        let body = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.client_message(),
                "type": self.error_type(),
            }
        });
        GatewayResponse::json(status, &body)
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Downstream {
                message: format!("timed out: {}", err),
            };
        }
        Self::Downstream {
            message: err.to_string(),
        }
    }
}

/// Convenience macro for creating configuration errors
///
/// Usage: `config_error!("Invalid polling interval: {:?}", interval)`
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::core::error::GatewayError::config(format!($($arg)*))
    };
}
