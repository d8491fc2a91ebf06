//! Request deadline and cancellation.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::pipeline::{Next, Stage};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, RequestContext};

/// Bounds the rest of the chain by a deadline and stops it when the request's
/// cancellation token fires
pub struct DeadlineStage {
    timeout: Duration,
}

impl DeadlineStage {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl Stage for DeadlineStage {
    fn name(&self) -> &str {
        "deadline"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
        let cancellation = ctx.cancellation.clone();

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                debug!("Request cancelled by caller");
                Err(GatewayError::Cancelled)
            }
            result = tokio::time::timeout(self.timeout, next.run(ctx)) => match result {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout {
                    timeout_ms: self.timeout.as_millis() as u64,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::IncomingRequest;
    use crate::middleware::pipeline::PipelineBuilder;
    use axum::http::{HeaderMap, Method, StatusCode, Version};
    use bytes::Bytes;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct Sleep(Duration);

    #[async_trait]
    impl Stage for Sleep {
        fn name(&self) -> &str {
            "sleep"
        }

        async fn handle(&self, _ctx: &mut RequestContext, _next: Next<'_>) -> GatewayResult<GatewayResponse> {
            tokio::time::sleep(self.0).await;
            Ok(GatewayResponse::text(StatusCode::OK, "done"))
        }
    }

    fn request() -> IncomingRequest {
        IncomingRequest::new(
            Method::GET,
            "/".parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:4000".parse().unwrap(),
        )
    }

    fn pipeline(timeout: Duration, work: Duration) -> crate::middleware::Pipeline {
        PipelineBuilder::bare()
            .then(Arc::new(DeadlineStage::new(timeout)))
            .then(Arc::new(Sleep(work)))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fast_requests_complete() {
        let response = pipeline(Duration::from_millis(200), Duration::from_millis(5))
            .execute(request())
            .await;
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_slow_requests_time_out() {
        let response = pipeline(Duration::from_millis(20), Duration::from_secs(5))
            .execute(request())
            .await;
        assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_chain() {
        let token = CancellationToken::new();
        let pipeline = pipeline(Duration::from_secs(5), Duration::from_secs(5));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let response = pipeline.execute_with_cancellation(request(), token).await;
        assert_eq!(response.status.as_u16(), 499);
    }
}
