//! Rate limiting stage: admits or rejects a request before endpoint resolution.

use async_trait::async_trait;
use axum::http::header::{HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use std::sync::Arc;
use std::time::Duration;

use super::pipeline::{Next, Stage};
use crate::core::error::GatewayResult;
use crate::core::types::{GatewayResponse, RequestContext};
use crate::rate_limiting::{RateLimitDecision, RateLimiter};

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-rate-limit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-rate-limit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-rate-limit-reset";

/// Whole seconds a client should wait, rounded up
fn retry_after_seconds(retry_after: Duration) -> u64 {
    let seconds = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        seconds + 1
    } else {
        seconds
    }
}

pub struct RateLimitingStage {
    limiter: Arc<RateLimiter>,
}

impl RateLimitingStage {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Stage for RateLimitingStage {
    fn name(&self) -> &str {
        "rate_limiting"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
        let route = ctx.require_route()?;
        let client = self.limiter.client_identity(&ctx.request);
        let options = self.limiter.options();

        match self.limiter.check(&route.id, &client, &route.rate_limit).await {
            RateLimitDecision::Exceeded { retry_after, .. } => {
                let status =
                    StatusCode::from_u16(options.http_status_code).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
                let mut response = GatewayResponse::text(status, options.quota_message(&route.rate_limit));
                response
                    .headers
                    .insert(RETRY_AFTER, HeaderValue::from(retry_after_seconds(retry_after)));
                Ok(response)
            }
            RateLimitDecision::Allowed {
                remaining, reset_at, ..
            } => {
                if !options.disable_rate_limit_headers {
                    let period = humantime::format_duration(route.rate_limit.period).to_string();
                    if let Ok(value) = HeaderValue::from_str(&period) {
                        ctx.response_headers.insert(RATE_LIMIT_LIMIT_HEADER, value);
                    }
                    ctx.response_headers
                        .insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(remaining));
                    if let Ok(value) = HeaderValue::from_str(&reset_at.to_rfc3339()) {
                        ctx.response_headers.insert(RATE_LIMIT_RESET_HEADER, value);
                    }
                }
                next.run(ctx).await
            }
            RateLimitDecision::Bypassed | RateLimitDecision::FailedOpen => next.run(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DownstreamRoute, IncomingRequest};
    use crate::middleware::pipeline::PipelineBuilder;
    use crate::rate_limiting::{InMemoryRateLimitStore, RateLimitOptions, RateLimitRule};
    use axum::http::{HeaderMap, Method, Version};
    use bytes::Bytes;

    struct Seed(Arc<DownstreamRoute>);

    #[async_trait]
    impl Stage for Seed {
        fn name(&self) -> &str {
            "seed"
        }

        async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
            ctx.route = Some(self.0.clone());
            next.run(ctx).await
        }
    }

    struct Ok200;

    #[async_trait]
    impl Stage for Ok200 {
        fn name(&self) -> &str {
            "ok"
        }

        async fn handle(&self, _ctx: &mut RequestContext, _next: Next<'_>) -> GatewayResult<GatewayResponse> {
            Ok(GatewayResponse::text(StatusCode::OK, "ok"))
        }
    }

    fn request(client: &str) -> IncomingRequest {
        let mut headers = HeaderMap::new();
        headers.insert("clientid", HeaderValue::from_str(client).unwrap());
        IncomingRequest::new(
            Method::GET,
            "/orders".parse().unwrap(),
            Version::HTTP_11,
            headers,
            Bytes::new(),
            "127.0.0.1:4000".parse().unwrap(),
        )
    }

    fn pipeline(options: RateLimitOptions, limit: u64) -> crate::middleware::Pipeline {
        let mut route = DownstreamRoute::new("orders", "/orders", "orders");
        route.rate_limit = RateLimitRule::new(limit, Duration::from_secs(60));
        let limiter = Arc::new(RateLimiter::new(Arc::new(InMemoryRateLimitStore::new()), options));

        PipelineBuilder::bare()
            .then(Arc::new(Seed(Arc::new(route))))
            .then(Arc::new(RateLimitingStage::new(limiter)))
            .then(Arc::new(Ok200))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_rejection_carries_message_and_retry_after() {
        let pipeline = pipeline(RateLimitOptions::default(), 1);

        let first = pipeline.execute(request("alice")).await;
        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(first.headers[RATE_LIMIT_REMAINING_HEADER], "0");
        assert_eq!(first.headers[RATE_LIMIT_LIMIT_HEADER], "1m");
        assert!(first.headers.contains_key(RATE_LIMIT_RESET_HEADER));

        let second = pipeline.execute(request("alice")).await;
        assert_eq!(second.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            &second.body[..],
            b"API calls quota exceeded! maximum admitted 1 per 1m."
        );
        let retry: u64 = second.headers[RETRY_AFTER].to_str().unwrap().parse().unwrap();
        assert!(retry > 0 && retry <= 60);
    }

    #[tokio::test]
    async fn test_custom_status_message_and_no_headers() {
        let options = RateLimitOptions {
            quota_exceeded_message: Some("slow down".to_string()),
            http_status_code: 503,
            disable_rate_limit_headers: true,
            ..RateLimitOptions::default()
        };
        let pipeline = pipeline(options, 1);

        let first = pipeline.execute(request("bob")).await;
        assert!(!first.headers.contains_key(RATE_LIMIT_REMAINING_HEADER));

        let second = pipeline.execute(request("bob")).await;
        assert_eq!(second.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(&second.body[..], b"slow down");
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_seconds(Duration::from_millis(300)), 1);
        assert_eq!(retry_after_seconds(Duration::from_secs(2)), 2);
        assert_eq!(retry_after_seconds(Duration::ZERO), 0);
    }
}
