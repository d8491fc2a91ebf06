//! # Built-in Stages
//!
//! The default occupants of every non-hook slot, and the services they need.

use async_trait::async_trait;
use axum::http::header::{HeaderName, HeaderValue};
use dashmap::DashMap;
use metrics::counter;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::auth::{AuthenticationStage, AuthenticatorRegistry, AuthorizationStage};
use super::dispatch::{DispatchStage, DownstreamClient};
use super::pipeline::{Next, Stage, StageSlot};
use super::rate_limiting::RateLimitingStage;
use super::timeout::DeadlineStage;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{AuthContext, GatewayResponse, RequestContext};
use crate::discovery::{ProviderFactory, ServiceProviderConfiguration};
use crate::rate_limiting::RateLimiter;
use crate::routing::RouteTable;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Headers that describe one connection and are never forwarded
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Everything the built-in stages depend on
#[derive(Clone)]
pub struct GatewayServices {
    pub routes: Arc<dyn RouteTable>,
    pub rate_limiter: Arc<RateLimiter>,
    pub authenticators: Arc<AuthenticatorRegistry>,
    pub providers: Arc<ProviderFactory>,
    pub discovery: Arc<ServiceProviderConfiguration>,
    pub client: Arc<dyn DownstreamClient>,
    pub request_timeout: Duration,
}

fn stage<S: Stage + 'static>(stage: S) -> Arc<dyn Stage> {
    Arc::new(stage)
}

/// Built-in stage for every slot that has one
pub fn default_stages(services: &GatewayServices) -> Vec<(StageSlot, Arc<dyn Stage>)> {
    vec![
        (StageSlot::ErrorResponder, stage(ErrorResponderStage::new())),
        (StageSlot::Responder, stage(ResponderStage::new())),
        (StageSlot::RouteLookup, stage(RouteLookupStage::new(services.routes.clone()))),
        (StageSlot::Deadline, stage(DeadlineStage::new(services.request_timeout))),
        (
            StageSlot::RateLimiting,
            stage(RateLimitingStage::new(services.rate_limiter.clone())),
        ),
        (
            StageSlot::Authentication,
            stage(AuthenticationStage::new(services.authenticators.clone())),
        ),
        (StageSlot::Authorization, stage(AuthorizationStage::new())),
        (StageSlot::ClaimsToHeaders, stage(ClaimsToHeadersStage::new())),
        (StageSlot::ClaimsToQuery, stage(ClaimsToQueryStage::new())),
        (
            StageSlot::EndpointResolution,
            stage(EndpointResolutionStage::new(
                services.providers.clone(),
                services.discovery.clone(),
            )),
        ),
        (StageSlot::Dispatch, stage(DispatchStage::new(services.client.clone()))),
    ]
}

fn request_id_value(ctx: &RequestContext) -> Option<HeaderValue> {
    HeaderValue::from_str(&ctx.request.id).ok()
}

/// Turns any error from the rest of the chain into a client-safe response
#[derive(Debug, Default)]
pub struct ErrorResponderStage;

impl ErrorResponderStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for ErrorResponderStage {
    fn name(&self) -> &str {
        "error_responder"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
        let err = match next.run(ctx).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        let status = err.status_code();
        if status.is_server_error() {
            error!(request_id = %ctx.request.id, error = %err, status = status.as_u16(), "Request failed");
        } else {
            debug!(request_id = %ctx.request.id, error = %err, status = status.as_u16(), "Request rejected");
        }
        counter!("gateway_stage_errors_total", "type" => err.error_type()).increment(1);

        let mut response = err.to_response();
        if let Some(id) = request_id_value(ctx) {
            response.headers.insert(REQUEST_ID_HEADER, id);
        }
        Ok(response)
    }
}

/// Shapes the successful response handed back to the client
#[derive(Debug, Default)]
pub struct ResponderStage;

impl ResponderStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for ResponderStage {
    fn name(&self) -> &str {
        "responder"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
        let mut response = next.run(ctx).await?;

        for name in HOP_BY_HOP_HEADERS {
            response.headers.remove(name);
        }
        for (name, value) in ctx.response_headers.iter() {
            response.headers.insert(name.clone(), value.clone());
        }
        if let Some(id) = request_id_value(ctx) {
            response.headers.insert(REQUEST_ID_HEADER, id);
        }
        Ok(response)
    }
}

/// Finds the route for the request
pub struct RouteLookupStage {
    routes: Arc<dyn RouteTable>,
}

impl RouteLookupStage {
    pub fn new(routes: Arc<dyn RouteTable>) -> Self {
        Self { routes }
    }
}

#[async_trait]
impl Stage for RouteLookupStage {
    fn name(&self) -> &str {
        "route_lookup"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
        let found = self
            .routes
            .find(&ctx.request.method, ctx.request.path())
            .ok_or_else(|| GatewayError::RouteNotFound {
                method: ctx.request.method.to_string(),
                path: ctx.request.path().to_string(),
            })?;

        debug!(route = %found.route.id, "Matched route");
        ctx.route = Some(found.route);
        ctx.route_params = found.params;
        next.run(ctx).await
    }
}

fn principal<'a>(ctx: &'a RequestContext, purpose: &str) -> GatewayResult<&'a AuthContext> {
    ctx.auth
        .as_ref()
        .ok_or_else(|| GatewayError::authz(format!("{} requires an authenticated principal", purpose)))
}

fn claim_value<'a>(auth: &'a AuthContext, claim: &str) -> GatewayResult<&'a str> {
    auth.claim(claim)
        .ok_or_else(|| GatewayError::authz(format!("claim '{}' not found", claim)))
}

/// Copies claims of the principal into downstream request headers
#[derive(Debug, Default)]
pub struct ClaimsToHeadersStage;

impl ClaimsToHeadersStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for ClaimsToHeadersStage {
    fn name(&self) -> &str {
        "claims_to_headers"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
        let route = ctx.require_route()?;
        if !route.add_headers_to_request.is_empty() {
            let auth = principal(ctx, "claims to headers")?;
            let mut headers = Vec::with_capacity(route.add_headers_to_request.len());
            for (header, claim) in &route.add_headers_to_request {
                let name = HeaderName::from_bytes(header.as_bytes())
                    .map_err(|e| GatewayError::stage(self.name(), format!("invalid header '{}': {}", header, e)))?;
                let value = HeaderValue::from_str(claim_value(auth, claim)?)
                    .map_err(|e| GatewayError::stage(self.name(), format!("claim '{}' is not a header value: {}", claim, e)))?;
                headers.push((name, value));
            }
            for (name, value) in headers {
                ctx.downstream_headers.insert(name, value);
            }
        }
        next.run(ctx).await
    }
}

/// Copies claims of the principal into downstream query parameters
#[derive(Debug, Default)]
pub struct ClaimsToQueryStage;

impl ClaimsToQueryStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for ClaimsToQueryStage {
    fn name(&self) -> &str {
        "claims_to_query"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
        let route = ctx.require_route()?;
        if !route.add_queries_to_request.is_empty() {
            let auth = principal(ctx, "claims to query")?;
            let mut pairs = Vec::with_capacity(route.add_queries_to_request.len());
            for (param, claim) in &route.add_queries_to_request {
                pairs.push((param.clone(), claim_value(auth, claim)?.to_string()));
            }
            for (param, value) in pairs {
                ctx.downstream_query.retain(|(existing, _)| *existing != param);
                ctx.downstream_query.push((param, value));
            }
        }
        next.run(ctx).await
    }
}

/// Resolves the route's service and picks one endpoint round-robin
pub struct EndpointResolutionStage {
    providers: Arc<ProviderFactory>,
    discovery: Arc<ServiceProviderConfiguration>,
    cursors: DashMap<String, AtomicUsize>,
}

impl EndpointResolutionStage {
    pub fn new(providers: Arc<ProviderFactory>, discovery: Arc<ServiceProviderConfiguration>) -> Self {
        Self {
            providers,
            discovery,
            cursors: DashMap::new(),
        }
    }

    fn next_index(&self, route_id: &str, len: usize) -> usize {
        let position = match self.cursors.get(route_id) {
            Some(cursor) => cursor.fetch_add(1, Ordering::Relaxed),
            None => self
                .cursors
                .entry(route_id.to_string())
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed),
        };
        position % len
    }
}

#[async_trait]
impl Stage for EndpointResolutionStage {
    fn name(&self) -> &str {
        "endpoint_resolution"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
        let route = ctx.require_route()?;
        let provider = self.providers.get_provider(&self.discovery, &route)?;
        let endpoints = provider.resolve().await?;

        if endpoints.is_empty() {
            warn!(route = %route.id, service = %route.service_key(), "No endpoints available");
            return Err(GatewayError::resolution(route.service_key(), "no endpoints available"));
        }

        let endpoint = endpoints[self.next_index(&route.id, endpoints.len())].clone();
        debug!(route = %route.id, endpoint = %endpoint, "Selected endpoint");
        ctx.endpoint = Some(endpoint);
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DownstreamRoute, Endpoint, IncomingRequest};
    use crate::discovery::{InMemoryRegistry, PollerCache};
    use crate::middleware::pipeline::PipelineBuilder;
    use axum::http::{HeaderMap, Method, StatusCode, Version};
    use bytes::Bytes;
    use std::collections::HashMap;

    /// Echoes what the earlier stages put into the context
    struct Capture;

    #[async_trait]
    impl Stage for Capture {
        fn name(&self) -> &str {
            "capture"
        }

        async fn handle(&self, ctx: &mut RequestContext, _next: Next<'_>) -> GatewayResult<GatewayResponse> {
            let body = serde_json::json!({
                "endpoint": ctx.endpoint.as_ref().map(|e| e.to_string()),
                "tenant_header": ctx.downstream_headers.get("x-tenant").and_then(|v| v.to_str().ok()),
                "query": ctx.downstream_query,
            });
            Ok(GatewayResponse::json(StatusCode::OK, &body))
        }
    }

    /// Installs a fixed route and principal, standing in for lookup and authentication
    struct Seed {
        route: Arc<DownstreamRoute>,
        auth: Option<AuthContext>,
    }

    #[async_trait]
    impl Stage for Seed {
        fn name(&self) -> &str {
            "seed"
        }

        async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
            ctx.route = Some(self.route.clone());
            ctx.auth = self.auth.clone();
            next.run(ctx).await
        }
    }

    fn request() -> IncomingRequest {
        IncomingRequest::new(
            Method::GET,
            "/orders".parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:4000".parse().unwrap(),
        )
    }

    fn principal_with_tenant() -> AuthContext {
        AuthContext {
            subject: "alice".to_string(),
            claims: [("tenant".to_string(), "acme".to_string())].into_iter().collect(),
            scopes: vec![],
        }
    }

    fn resolution_stage(registry: Arc<InMemoryRegistry>) -> EndpointResolutionStage {
        EndpointResolutionStage::new(
            Arc::new(ProviderFactory::new(registry, Arc::new(PollerCache::new()))),
            Arc::new(ServiceProviderConfiguration::default()),
        )
    }

    async fn run(route: DownstreamRoute, auth: Option<AuthContext>, registry: Arc<InMemoryRegistry>) -> GatewayResponse {
        PipelineBuilder::bare()
            .then(Arc::new(Seed {
                route: Arc::new(route),
                auth,
            }))
            .then(Arc::new(ClaimsToHeadersStage::new()))
            .then(Arc::new(ClaimsToQueryStage::new()))
            .then(Arc::new(resolution_stage(registry)))
            .then(Arc::new(Capture))
            .build()
            .unwrap()
            .execute(request())
            .await
    }

    fn json(response: &GatewayResponse) -> serde_json::Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[tokio::test]
    async fn test_claims_are_copied_downstream() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register("orders", Endpoint::new("10.0.0.1", 80));

        let mut route = DownstreamRoute::new("orders", "/orders", "orders");
        route.add_headers_to_request = HashMap::from([("x-tenant".to_string(), "tenant".to_string())]);
        route.add_queries_to_request = HashMap::from([("tenant".to_string(), "tenant".to_string())]);

        let response = run(route, Some(principal_with_tenant()), registry).await;
        assert_eq!(response.status, StatusCode::OK);
        let body = json(&response);
        assert_eq!(body["tenant_header"], "acme");
        assert_eq!(body["query"][0][1], "acme");
        assert_eq!(body["endpoint"], "10.0.0.1:80");
        assert!(response.headers.contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn test_missing_claim_is_forbidden() {
        let registry = Arc::new(InMemoryRegistry::new());
        let mut route = DownstreamRoute::new("orders", "/orders", "orders");
        route.add_headers_to_request = HashMap::from([("x-region".to_string(), "region".to_string())]);

        let response = run(route, Some(principal_with_tenant()), registry).await;
        assert_eq!(response.status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_no_endpoints_is_bad_gateway() {
        let response = run(
            DownstreamRoute::new("orders", "/orders", "orders"),
            None,
            Arc::new(InMemoryRegistry::new()),
        )
        .await;
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert_eq!(json(&response)["error"]["type"], "resolution_failure");
    }

    #[tokio::test]
    async fn test_round_robin_over_endpoints() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.register("orders", Endpoint::new("10.0.0.1", 80));
        registry.register("orders", Endpoint::new("10.0.0.2", 80));
        let stage = resolution_stage(registry);

        let picks: Vec<usize> = (0..4).map(|_| stage.next_index("orders", 2)).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }

    #[tokio::test]
    async fn test_responder_strips_hop_by_hop_and_adds_context_headers() {
        struct Downstream;

        #[async_trait]
        impl Stage for Downstream {
            fn name(&self) -> &str {
                "downstream"
            }

            async fn handle(&self, ctx: &mut RequestContext, _next: Next<'_>) -> GatewayResult<GatewayResponse> {
                ctx.response_headers
                    .insert("x-rate-limit-remaining", HeaderValue::from_static("2"));
                let mut response = GatewayResponse::text(StatusCode::OK, "hi");
                response.headers.insert("connection", HeaderValue::from_static("close"));
                Ok(response)
            }
        }

        let response = PipelineBuilder::bare()
            .then(Arc::new(Downstream))
            .build()
            .unwrap()
            .execute(request())
            .await;

        assert!(!response.headers.contains_key("connection"));
        assert_eq!(response.headers["x-rate-limit-remaining"], "2");
    }
}
