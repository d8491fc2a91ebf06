//! # HTTP Server Module
//!
//! Accepts HTTP requests with axum, converts them into [`IncomingRequest`]s and
//! runs them through the gateway pipeline. Every request other than the health
//! check goes to the pipeline; each produces exactly one response.
//!
//! The pipeline runs on its own task. When the client goes away axum drops the
//! handler, which cancels the request's token and lets the deadline stage stop
//! the downstream call.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router as AxumRouter,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::builder::Gateway;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest};

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub gateway: Arc<Gateway>,
}

/// HTTP front end of a [`Gateway`]
pub struct GatewayServer {
    state: ServerState,
}

impl GatewayServer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            state: ServerState { gateway },
        }
    }

    /// The axum application: a health check plus a catch-all into the pipeline
    pub fn router(&self) -> AxumRouter {
        AxumRouter::new()
            .route("/health", get(health_check))
            .fallback(handle_request)
            .with_state(self.state.clone())
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bind_address = self.state.gateway.config().server.bind_address.clone();
        let listener = TcpListener::bind(&bind_address)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to bind {}: {}", bind_address, e)))?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> GatewayResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!("Gateway listening on {}", local_addr);

        axum::serve(
            listener,
            self.router().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| GatewayError::internal(format!("Server error: {}", e)))
    }
}

/// Catch-all handler that feeds the pipeline
pub async fn handle_request(State(state): State<ServerState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));

    let max_body_size = state.gateway.config().server.max_body_size;
    let body = match axum::body::to_bytes(body, max_body_size).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, limit = max_body_size, "Failed to read request body");
            return into_axum_response(GatewayResponse::text(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large or unreadable",
            ));
        }
    };

    let incoming = IncomingRequest::new(parts.method, parts.uri, parts.version, parts.headers, body, remote_addr);

    let token = CancellationToken::new();
    let _cancel_on_drop = token.clone().drop_guard();
    let gateway = state.gateway.clone();
    let task = tokio::spawn(async move { gateway.pipeline().execute_with_cancellation(incoming, token).await });

    match task.await {
        Ok(response) => into_axum_response(response),
        Err(e) => {
            error!(error = %e, "Pipeline task failed");
            into_axum_response(GatewayError::internal("pipeline task failed").to_response())
        }
    }
}

fn into_axum_response(response: GatewayResponse) -> Response {
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}

/// Gateway health check handler
pub async fn health_check(State(state): State<ServerState>) -> impl IntoResponse {
    let pollers = state.gateway.pollers().stats();
    let health_info = serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "pollers": pollers.live_pollers,
    });

    (StatusCode::OK, axum::Json(health_info))
}
