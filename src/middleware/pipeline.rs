//! # Stage Pipeline
//!
//! Every request runs through an ordered chain of [`Stage`]s. A stage gets the
//! request context and a [`Next`] continuation: awaiting `next.run(ctx)` runs the
//! rest of the chain, returning without calling it short-circuits. `Next` is
//! consumed on use, so the remainder of the chain runs at most once.
//!
//! ## Slots
//! The chain is a fixed sequence of [`StageSlot`]s. Some slots can be overridden,
//! which replaces the built-in stage; hook slots are empty unless set and run
//! just before the built-in stage they precede. Branch predicates are checked
//! in registration order before the chain starts and divert the whole request
//! to their own pipeline.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest, RequestContext};
use crate::observability::metrics::record_request;

/// One step of request handling
#[async_trait]
pub trait Stage: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse>;
}

/// Continuation over the rest of the chain
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(stages: &'a [Arc<dyn Stage>]) -> Self {
        Self { stages }
    }

    /// Run the remaining stages
    ///
    /// Running past the last stage is an internal error: the dispatch stage is
    /// expected to produce the response.
    pub async fn run(self, ctx: &mut RequestContext) -> GatewayResult<GatewayResponse> {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                debug!(stage = stage.name(), request_id = %ctx.request.id, "Entering stage");
                stage.handle(ctx, Next { stages: rest }).await
            }
            None => Err(GatewayError::internal("stage chain ended without producing a response")),
        }
    }

    /// Stages still ahead
    pub fn remaining(&self) -> usize {
        self.stages.len()
    }
}

/// Positions in the stage chain, outermost first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageSlot {
    ErrorResponder,
    PreErrorResponder,
    Responder,
    RouteLookup,
    Deadline,
    RateLimiting,
    PreAuthentication,
    Authentication,
    PreAuthorization,
    Authorization,
    ClaimsToHeaders,
    PreQueryString,
    ClaimsToQuery,
    EndpointResolution,
    Dispatch,
}

impl StageSlot {
    /// Every slot in execution order
    pub const ORDER: [StageSlot; 15] = [
        StageSlot::ErrorResponder,
        StageSlot::PreErrorResponder,
        StageSlot::Responder,
        StageSlot::RouteLookup,
        StageSlot::Deadline,
        StageSlot::RateLimiting,
        StageSlot::PreAuthentication,
        StageSlot::Authentication,
        StageSlot::PreAuthorization,
        StageSlot::Authorization,
        StageSlot::ClaimsToHeaders,
        StageSlot::PreQueryString,
        StageSlot::ClaimsToQuery,
        StageSlot::EndpointResolution,
        StageSlot::Dispatch,
    ];

    /// Hook slots have no built-in stage
    pub fn is_hook(self) -> bool {
        matches!(
            self,
            Self::PreErrorResponder | Self::PreAuthentication | Self::PreAuthorization | Self::PreQueryString
        )
    }

    /// Whether callers may put their own stage in this slot
    pub fn is_overridable(self) -> bool {
        self.is_hook()
            || matches!(
                self,
                Self::ErrorResponder
                    | Self::Responder
                    | Self::Authentication
                    | Self::Authorization
                    | Self::ClaimsToHeaders
            )
    }
}

impl fmt::Display for StageSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Decides whether a request is diverted to a branch pipeline
pub type BranchPredicate = Arc<dyn Fn(&IncomingRequest) -> bool + Send + Sync>;

struct Branch {
    predicate: BranchPredicate,
    pipeline: Pipeline,
}

struct PipelineInner {
    stages: Vec<Arc<dyn Stage>>,
    branches: Vec<Branch>,
}

/// A frozen stage chain plus its branches; cheap to clone
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Names of the stages of the default chain, outermost first
    pub fn stage_names(&self) -> Vec<String> {
        self.inner.stages.iter().map(|stage| stage.name().to_string()).collect()
    }

    pub fn branch_count(&self) -> usize {
        self.inner.branches.len()
    }

    /// The pipeline that handles `request` after following matching branches
    fn select(&self, request: &IncomingRequest) -> &Pipeline {
        let mut current = self;
        while let Some(branch) = current.inner.branches.iter().find(|b| (b.predicate)(request)) {
            current = &branch.pipeline;
        }
        current
    }

    /// Run one request to completion; never fails
    pub async fn execute(&self, request: IncomingRequest) -> GatewayResponse {
        self.execute_with_cancellation(request, CancellationToken::new()).await
    }

    /// Run one request, observing `cancellation` for caller disconnects
    #[instrument(skip_all, fields(request_id = %request.id, method = %request.method, path = %request.path()))]
    pub async fn execute_with_cancellation(
        &self,
        request: IncomingRequest,
        cancellation: CancellationToken,
    ) -> GatewayResponse {
        let pipeline = self.select(&request);
        let method = request.method.to_string();
        let mut ctx = RequestContext::new(request);
        ctx.cancellation = cancellation;

        let response = match Next::new(&pipeline.inner.stages).run(&mut ctx).await {
            Ok(response) => response,
            Err(err) => {
                // Only reachable when the error responder itself was replaced by
                // a stage that lets errors through.
                error!(error = %err, "Unhandled error escaped the stage chain");
                err.to_response()
            }
        };

        let route = ctx
            .route
            .as_ref()
            .map(|route| route.id.clone())
            .unwrap_or_else(|| "unmatched".to_string());
        record_request(&method, &route, response.status.as_u16(), ctx.elapsed());
        debug!(status = response.status.as_u16(), elapsed = ?ctx.elapsed(), "Request completed");
        response
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("branches", &self.inner.branches.len())
            .finish()
    }
}

/// Composes a [`Pipeline`] from built-in stages, overrides and branches
pub struct PipelineBuilder {
    builtins: HashMap<StageSlot, Arc<dyn Stage>>,
    overrides: HashMap<StageSlot, Arc<dyn Stage>>,
    appended: Vec<Arc<dyn Stage>>,
    branches: Vec<Branch>,
    invalid: Vec<StageSlot>,
}

impl PipelineBuilder {
    /// Builder over the full default chain of `services`
    pub fn new(services: &super::builtin::GatewayServices) -> Self {
        let mut builder = Self::empty();
        for (slot, stage) in super::builtin::default_stages(services) {
            builder.builtins.insert(slot, stage);
        }
        builder
    }

    /// Builder with only the error responder and responder, for branch
    /// pipelines made of custom stages added with [`PipelineBuilder::then`]
    pub fn bare() -> Self {
        let mut builder = Self::empty();
        builder.builtins.insert(
            StageSlot::ErrorResponder,
            Arc::new(super::builtin::ErrorResponderStage::new()),
        );
        builder
            .builtins
            .insert(StageSlot::Responder, Arc::new(super::builtin::ResponderStage::new()));
        builder
    }

    fn empty() -> Self {
        Self {
            builtins: HashMap::new(),
            overrides: HashMap::new(),
            appended: Vec::new(),
            branches: Vec::new(),
            invalid: Vec::new(),
        }
    }

    /// Replace the stage in `slot`, or fill a hook slot
    ///
    /// Slots that are not overridable are reported by [`PipelineBuilder::build`].
    pub fn override_stage(mut self, slot: StageSlot, stage: Arc<dyn Stage>) -> Self {
        if slot.is_overridable() {
            self.overrides.insert(slot, stage);
        } else {
            self.invalid.push(slot);
        }
        self
    }

    /// Append a stage after every slot
    pub fn then(mut self, stage: Arc<dyn Stage>) -> Self {
        self.appended.push(stage);
        self
    }

    /// Divert requests matching `predicate` to `pipeline`
    pub fn branch<P>(mut self, predicate: P, pipeline: Pipeline) -> Self
    where
        P: Fn(&IncomingRequest) -> bool + Send + Sync + 'static,
    {
        self.branches.push(Branch {
            predicate: Arc::new(predicate),
            pipeline,
        });
        self
    }

    /// Replace a built-in stage regardless of overridability
    #[cfg(test)]
    pub(crate) fn with_builtin(mut self, slot: StageSlot, stage: Arc<dyn Stage>) -> Self {
        self.builtins.insert(slot, stage);
        self
    }

    /// Freeze the chain
    pub fn build(mut self) -> GatewayResult<Pipeline> {
        if let Some(slot) = self.invalid.first() {
            return Err(GatewayError::config(format!(
                "stage slot {} cannot be overridden",
                slot
            )));
        }

        let mut stages: Vec<Arc<dyn Stage>> = Vec::with_capacity(StageSlot::ORDER.len());
        for slot in StageSlot::ORDER {
            if let Some(stage) = self.overrides.remove(&slot).or_else(|| self.builtins.remove(&slot)) {
                stages.push(stage);
            }
        }
        stages.append(&mut self.appended);

        Ok(Pipeline {
            inner: Arc::new(PipelineInner {
                stages,
                branches: self.branches,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, Method, StatusCode, Version};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(path: &str) -> IncomingRequest {
        IncomingRequest::new(
            Method::GET,
            path.parse().unwrap(),
            Version::HTTP_11,
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:4000".parse().unwrap(),
        )
    }

    /// Responds with a fixed body
    struct Respond(&'static str);

    #[async_trait]
    impl Stage for Respond {
        fn name(&self) -> &str {
            "respond"
        }

        async fn handle(&self, _ctx: &mut RequestContext, _next: Next<'_>) -> GatewayResult<GatewayResponse> {
            Ok(GatewayResponse::text(StatusCode::OK, self.0))
        }
    }

    /// Counts invocations, then continues
    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl Stage for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.run(ctx).await
        }
    }

    /// Records the order stages run in
    struct Trace {
        label: &'static str,
        log: Arc<parking_lot::Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Stage for Trace {
        fn name(&self) -> &str {
            self.label
        }

        async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
            self.log.lock().push(self.label);
            next.run(ctx).await
        }
    }

    struct Fail;

    #[async_trait]
    impl Stage for Fail {
        fn name(&self) -> &str {
            "fail"
        }

        async fn handle(&self, _ctx: &mut RequestContext, _next: Next<'_>) -> GatewayResult<GatewayResponse> {
            Err(GatewayError::auth("no credentials"))
        }
    }

    fn body(response: &GatewayResponse) -> String {
        String::from_utf8(response.body.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_override_replaces_builtin() {
        let builtin = Arc::new(Counting::default());
        let replacement = Arc::new(Counting::default());

        let pipeline = PipelineBuilder::bare()
            .with_builtin(StageSlot::Authentication, builtin.clone())
            .override_stage(StageSlot::Authentication, replacement.clone())
            .then(Arc::new(Respond("ok")))
            .build()
            .unwrap();

        for _ in 0..3 {
            let response = pipeline.execute(request("/")).await;
            assert_eq!(response.status, StatusCode::OK);
        }
        assert_eq!(builtin.0.load(Ordering::SeqCst), 0);
        assert_eq!(replacement.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_hooks_run_before_their_builtin() {
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let trace = |label| Arc::new(Trace { label, log: log.clone() });

        let pipeline = PipelineBuilder::bare()
            .with_builtin(StageSlot::Authentication, trace("authentication"))
            .with_builtin(StageSlot::Authorization, trace("authorization"))
            .override_stage(StageSlot::PreAuthorization, trace("pre-authorization"))
            .override_stage(StageSlot::PreAuthentication, trace("pre-authentication"))
            .then(Arc::new(Respond("ok")))
            .build()
            .unwrap();

        pipeline.execute(request("/")).await;
        assert_eq!(
            *log.lock(),
            vec!["pre-authentication", "authentication", "pre-authorization", "authorization"]
        );
    }

    #[tokio::test]
    async fn test_non_overridable_slot_fails_build() {
        let result = PipelineBuilder::bare()
            .override_stage(StageSlot::RateLimiting, Arc::new(Respond("nope")))
            .build();
        match result {
            Err(GatewayError::Configuration { message }) => assert!(message.contains("RateLimiting")),
            other => panic!("unexpected result {:?}", other.map(|p| p.stage_names())),
        }
    }

    #[tokio::test]
    async fn test_errors_reach_error_responder() {
        let pipeline = PipelineBuilder::bare().then(Arc::new(Fail)).build().unwrap();
        let response = pipeline.execute(request("/")).await;
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_chain_without_terminal_stage_is_internal_error() {
        let pipeline = PipelineBuilder::bare().build().unwrap();
        let response = pipeline.execute(request("/")).await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_first_matching_branch_wins() {
        let default_stage = Arc::new(Counting::default());
        let p1 = PipelineBuilder::bare().then(Arc::new(Respond("p1"))).build().unwrap();
        let p2 = PipelineBuilder::bare().then(Arc::new(Respond("p2"))).build().unwrap();

        let pipeline = PipelineBuilder::bare()
            .branch(|_| true, p1)
            .branch(|_| false, p2)
            .then(default_stage.clone())
            .then(Arc::new(Respond("default")))
            .build()
            .unwrap();

        for path in ["/a", "/b", "/c"] {
            assert_eq!(body(&pipeline.execute(request(path)).await), "p1");
        }
        assert_eq!(default_stage.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unmatched_branches_fall_through() {
        let admin = PipelineBuilder::bare().then(Arc::new(Respond("admin"))).build().unwrap();
        let pipeline = PipelineBuilder::bare()
            .branch(|req| req.path().starts_with("/admin"), admin)
            .then(Arc::new(Respond("default")))
            .build()
            .unwrap();

        assert_eq!(body(&pipeline.execute(request("/admin/users")).await), "admin");
        assert_eq!(body(&pipeline.execute(request("/orders")).await), "default");
        assert_eq!(pipeline.branch_count(), 1);
    }

    #[test]
    fn test_slot_classification() {
        assert!(StageSlot::PreQueryString.is_hook());
        assert!(StageSlot::ClaimsToHeaders.is_overridable());
        assert!(!StageSlot::ClaimsToQuery.is_overridable());
        assert!(!StageSlot::Dispatch.is_overridable());
        assert_eq!(StageSlot::ORDER[0], StageSlot::ErrorResponder);
        assert_eq!(StageSlot::ORDER[14], StageSlot::Dispatch);
    }
}
