//! # Downstream Dispatch
//!
//! The last stage of the default chain. It builds the downstream URL from the
//! matched route and the selected endpoint, forwards the request through a
//! [`DownstreamClient`] and hands the downstream response back up the chain.

use async_trait::async_trait;
use axum::http::header::{HeaderName, HeaderValue, HOST};
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::builtin::{HOP_BY_HOP_HEADERS, REQUEST_ID_HEADER};
use super::pipeline::{Next, Stage};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, RequestContext};
use crate::observability::record_upstream_request;
use crate::routing::{encode_query, parse_query, render_downstream_path};

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// A fully built request for one downstream endpoint
#[derive(Debug, Clone)]
pub struct DownstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends requests to downstream services
#[async_trait]
pub trait DownstreamClient: Send + Sync {
    async fn send(&self, request: DownstreamRequest) -> GatewayResult<GatewayResponse>;
}

/// [`DownstreamClient`] backed by a pooled `reqwest` client
#[derive(Clone)]
pub struct HttpDownstreamClient {
    client: reqwest::Client,
}

impl HttpDownstreamClient {
    pub fn new(timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DownstreamClient for HttpDownstreamClient {
    async fn send(&self, request: DownstreamRequest) -> GatewayResult<GatewayResponse> {
        // reqwest carries its own copy of the http types
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| GatewayError::internal(format!("Unsupported method: {}", e)))?;

        let mut headers = reqwest::header::HeaderMap::with_capacity(request.headers.len());
        for (name, value) in request.headers.iter() {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        let response = self
            .client
            .request(method, &request.url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Downstream {
                        message: "downstream request timed out".to_string(),
                    }
                } else {
                    GatewayError::Downstream {
                        message: e.to_string(),
                    }
                }
            })?;

        let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut response_headers = HeaderMap::with_capacity(response.headers().len());
        for (name, value) in response.headers().iter() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.append(name, value);
            }
        }

        let body = response.bytes().await.map_err(|e| GatewayError::Downstream {
            message: format!("Failed to read downstream body: {}", e),
        })?;

        Ok(GatewayResponse::new(status, response_headers, body))
    }
}

/// Forwards the request to the endpoint chosen by endpoint resolution
pub struct DispatchStage {
    client: Arc<dyn DownstreamClient>,
}

impl DispatchStage {
    pub fn new(client: Arc<dyn DownstreamClient>) -> Self {
        Self { client }
    }

    fn build_request(ctx: &RequestContext) -> GatewayResult<DownstreamRequest> {
        let route = ctx.require_route()?;
        let endpoint = ctx
            .endpoint
            .as_ref()
            .ok_or_else(|| GatewayError::internal("dispatch requires a resolved endpoint"))?;

        let path = render_downstream_path(&route.downstream_path_template, &ctx.route_params);

        let mut query = ctx.request.query().map(parse_query).unwrap_or_default();
        for (name, value) in &ctx.downstream_query {
            query.retain(|(existing, _)| existing != name);
            query.push((name.clone(), value.clone()));
        }

        let mut url = format!("{}://{}{}", route.downstream_scheme, endpoint, path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&encode_query(&query));
        }
        url::Url::parse(&url)
            .map_err(|e| GatewayError::stage("dispatch", format!("invalid downstream url '{}': {}", url, e)))?;

        let mut headers = ctx.request.headers.clone();
        headers.remove(HOST);
        for name in HOP_BY_HOP_HEADERS {
            headers.remove(name);
        }
        for (name, value) in ctx.downstream_headers.iter() {
            headers.insert(name.clone(), value.clone());
        }

        let client_ip = ctx.request.remote_addr.ip().to_string();
        let forwarded = match ctx.request.header(FORWARDED_FOR_HEADER) {
            Some(existing) => format!("{}, {}", existing, client_ip),
            None => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded) {
            headers.insert(FORWARDED_FOR_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(&ctx.request.id) {
            headers.insert(REQUEST_ID_HEADER, value);
        }

        Ok(DownstreamRequest {
            method: ctx.request.method.clone(),
            url,
            headers,
            body: ctx.request.body.clone(),
        })
    }
}

#[async_trait]
impl Stage for DispatchStage {
    fn name(&self) -> &str {
        "dispatch"
    }

    async fn handle(&self, ctx: &mut RequestContext, _next: Next<'_>) -> GatewayResult<GatewayResponse> {
        let request = Self::build_request(ctx)?;
        let route = ctx.require_route()?;
        let service = route.service_key();

        debug!(method = %request.method, url = %request.url, "Dispatching downstream");
        let started = Instant::now();
        let result = self.client.send(request).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(response) => record_upstream_request(service, Some(response.status.as_u16()), elapsed),
            Err(err) => {
                warn!(service = %service, error = %err, "Downstream request failed");
                record_upstream_request(service, None, elapsed);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DownstreamRoute, Endpoint, IncomingRequest};
    use axum::http::Version;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<DownstreamRequest>>,
    }

    #[async_trait]
    impl DownstreamClient for Recording {
        async fn send(&self, request: DownstreamRequest) -> GatewayResult<GatewayResponse> {
            self.sent.lock().push(request);
            Ok(GatewayResponse::text(StatusCode::OK, "from downstream"))
        }
    }

    fn context(uri: &str, headers: HeaderMap) -> RequestContext {
        let request = IncomingRequest::new(
            Method::POST,
            uri.parse().unwrap(),
            Version::HTTP_11,
            headers,
            Bytes::from_static(b"payload"),
            "192.168.1.20:5000".parse().unwrap(),
        );
        let mut route = DownstreamRoute::new("orders", "/api/orders/:id", "orders");
        route.downstream_path_template = "/orders/{id}".to_string();

        let mut ctx = RequestContext::new(request);
        ctx.route = Some(Arc::new(route));
        ctx.route_params = HashMap::from([("id".to_string(), "42".to_string())]);
        ctx.endpoint = Some(Endpoint::new("10.0.0.5", 9000));
        ctx
    }

    #[test]
    fn test_build_request_url_and_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("gateway.local"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        headers.insert(FORWARDED_FOR_HEADER, HeaderValue::from_static("203.0.113.9"));

        let mut ctx = context("/api/orders/42?expand=items&tenant=spoofed", headers);
        ctx.downstream_query.push(("tenant".to_string(), "acme".to_string()));
        ctx.downstream_headers
            .insert("x-tenant", HeaderValue::from_static("acme"));

        let request = DispatchStage::build_request(&ctx).unwrap();
        assert_eq!(request.url, "http://10.0.0.5:9000/orders/42?expand=items&tenant=acme");
        assert!(!request.headers.contains_key(HOST));
        assert!(!request.headers.contains_key("connection"));
        assert_eq!(request.headers["x-trace"], "abc");
        assert_eq!(request.headers["x-tenant"], "acme");
        assert_eq!(request.headers[FORWARDED_FOR_HEADER], "203.0.113.9, 192.168.1.20");
        assert_eq!(request.headers[REQUEST_ID_HEADER], ctx.request.id.as_str());
        assert_eq!(&request.body[..], b"payload");
    }

    #[test]
    fn test_build_request_requires_endpoint() {
        let mut ctx = context("/api/orders/42", HeaderMap::new());
        ctx.endpoint = None;
        assert!(matches!(
            DispatchStage::build_request(&ctx),
            Err(GatewayError::Internal { .. })
        ));
    }

    #[test]
    fn test_build_request_rejects_unusable_url() {
        let mut ctx = context("/api/orders/42", HeaderMap::new());
        let mut route = (**ctx.route.as_ref().unwrap()).clone();
        route.downstream_scheme = "not a scheme".to_string();
        ctx.route = Some(Arc::new(route));

        assert!(matches!(
            DispatchStage::build_request(&ctx),
            Err(GatewayError::Stage { .. })
        ));
    }

    #[tokio::test]
    async fn test_dispatch_forwards_through_client() {
        let client = Arc::new(Recording::default());
        let stage = DispatchStage::new(client.clone());
        let mut ctx = context("/api/orders/42", HeaderMap::new());

        let response = stage.handle(&mut ctx, Next::new(&[])).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);

        let sent = client.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, Method::POST);
        assert_eq!(sent[0].url, "http://10.0.0.5:9000/orders/42");
    }
}
