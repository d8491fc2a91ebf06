//! # Core Types Module
//!
//! This module defines the data structures that flow through the stage chain:
//! the inbound request, the response, the per-request context, downstream routes
//! and resolved endpoints.

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::error::{GatewayError, GatewayResult};
use crate::rate_limiting::RateLimitRule;

/// Inbound request as seen by the stage chain
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Unique identifier for this request (for tracing and logging)
    pub id: String,

    /// HTTP method
    pub method: Method,

    /// Request URI including path and query parameters
    pub uri: Uri,

    /// HTTP version
    pub version: Version,

    /// Request headers
    pub headers: HeaderMap,

    /// Request body; `Bytes` keeps clones cheap
    pub body: Bytes,

    /// Client's remote address
    pub remote_addr: SocketAddr,

    /// Timestamp when the request was received
    pub received_at: Instant,
}

impl IncomingRequest {
    /// Create a new incoming request with a generated ID
    pub fn new(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            uri,
            version,
            headers,
            body,
            remote_addr,
            received_at: Instant::now(),
        }
    }

    /// Get the request path without query parameters
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Get query parameters as a string
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Get a header value by name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Response produced by the stage chain
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// HTTP status code
    pub status: StatusCode,

    /// Response headers
    pub headers: HeaderMap,

    /// Response body
    pub body: Bytes,
}

impl GatewayResponse {
    /// Create a new response
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// Create a simple text response
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        Self::new(status, headers, text.into())
    }

    /// Create a JSON response from an already-built value
    pub fn json(status: StatusCode, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self::new(status, headers, value.to_string())
    }

    /// Response with a status and no body
    pub fn empty(status: StatusCode) -> Self {
        Self::new(status, HeaderMap::new(), Bytes::new())
    }
}

/// Resolved network location of one live backend instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Authentication requirements of a route
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticationOptions {
    /// Key of the authenticator that must accept the request
    pub provider_key: String,

    /// Scopes the authenticated principal must carry (any of)
    #[serde(default)]
    pub allowed_scopes: Vec<String>,
}

fn default_scheme() -> String {
    "http".to_string()
}

/// Client-facing route bound to one downstream service
///
/// A route either names a `service_name` (endpoints come from service discovery)
/// or lists `downstream_hosts` directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamRoute {
    /// Stable identifier, also used as the rate limit key namespace
    pub id: String,

    /// Pattern matched against the inbound path (matchit syntax, e.g. `/orders/:id`)
    pub upstream_path_template: String,

    /// Allowed methods; empty means any
    #[serde(default)]
    pub upstream_methods: Vec<String>,

    /// Path sent downstream; `{param}` placeholders are filled from the matched path
    pub downstream_path_template: String,

    #[serde(default = "default_scheme")]
    pub downstream_scheme: String,

    /// Logical service name resolved through service discovery
    #[serde(default)]
    pub service_name: Option<String>,

    /// Fixed endpoints used when no service name is configured
    #[serde(default)]
    pub downstream_hosts: Vec<Endpoint>,

    #[serde(default)]
    pub rate_limit: RateLimitRule,

    #[serde(default)]
    pub authentication: Option<AuthenticationOptions>,

    /// Claim values the principal must carry (claim -> required value)
    #[serde(default)]
    pub route_claims_requirement: HashMap<String, String>,

    /// Downstream header name -> claim name
    #[serde(default)]
    pub add_headers_to_request: HashMap<String, String>,

    /// Downstream query parameter -> claim name
    #[serde(default)]
    pub add_queries_to_request: HashMap<String, String>,
}

impl DownstreamRoute {
    /// Minimal route forwarding `upstream` to the same path on `service_name`
    pub fn new(id: impl Into<String>, upstream: impl Into<String>, service_name: impl Into<String>) -> Self {
        let upstream = upstream.into();
        Self {
            id: id.into(),
            downstream_path_template: upstream.clone(),
            upstream_path_template: upstream,
            upstream_methods: Vec::new(),
            downstream_scheme: default_scheme(),
            service_name: Some(service_name.into()),
            downstream_hosts: Vec::new(),
            rate_limit: RateLimitRule::default(),
            authentication: None,
            route_claims_requirement: HashMap::new(),
            add_headers_to_request: HashMap::new(),
            add_queries_to_request: HashMap::new(),
        }
    }

    /// Name used as the discovery key; falls back to the route id for host-list routes
    pub fn service_key(&self) -> &str {
        self.service_name.as_deref().unwrap_or(&self.id)
    }

    pub fn matches_method(&self, method: &Method) -> bool {
        self.upstream_methods.is_empty()
            || self
                .upstream_methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }
}

/// Principal established by the authentication stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthContext {
    /// Subject identifier
    pub subject: String,

    /// Flattened claims
    pub claims: HashMap<String, String>,

    /// Granted scopes
    pub scopes: Vec<String>,
}

impl AuthContext {
    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).map(String::as_str)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Request context that flows through the stage chain
///
/// Stages communicate only through this context: the route lookup fills `route`,
/// authentication fills `auth`, endpoint resolution fills `endpoint`, and stages
/// that want to add response headers write to `response_headers`.
#[derive(Debug)]
pub struct RequestContext {
    /// The inbound request
    pub request: IncomingRequest,

    /// Matched route
    pub route: Option<Arc<DownstreamRoute>>,

    /// Parameters extracted from the upstream path template
    pub route_params: HashMap<String, String>,

    /// Authenticated principal
    pub auth: Option<AuthContext>,

    /// Endpoint selected for this request
    pub endpoint: Option<Endpoint>,

    /// Extra headers for the downstream request
    pub downstream_headers: HeaderMap,

    /// Extra query parameters for the downstream request
    pub downstream_query: Vec<(String, String)>,

    /// Headers the responder appends to the final response
    pub response_headers: HeaderMap,

    /// Cancelled when the caller goes away
    pub cancellation: CancellationToken,

    /// Request start time for latency measurement
    pub start_time: Instant,

    /// Free-form data for custom stages
    pub data: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    /// Create a new request context
    pub fn new(request: IncomingRequest) -> Self {
        Self {
            request,
            route: None,
            route_params: HashMap::new(),
            auth: None,
            endpoint: None,
            downstream_headers: HeaderMap::new(),
            downstream_query: Vec::new(),
            response_headers: HeaderMap::new(),
            cancellation: CancellationToken::new(),
            start_time: Instant::now(),
            data: HashMap::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request.id
    }

    /// Get elapsed time since request started
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// The matched route, or an error when called before route lookup
    pub fn require_route(&self) -> GatewayResult<Arc<DownstreamRoute>> {
        self.route
            .clone()
            .ok_or_else(|| GatewayError::internal("stage requires a matched route"))
    }
}
