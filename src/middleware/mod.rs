pub mod auth;
pub mod builtin;
pub mod dispatch;
pub mod pipeline;
pub mod rate_limiting;
pub mod timeout;

pub use auth::{
    ApiKeyAuthenticator, ApiKeyCredential, AuthenticationStage, Authenticator, AuthenticatorRegistry,
    AuthorizationStage,
};
pub use builtin::{default_stages, GatewayServices};
pub use dispatch::{DispatchStage, DownstreamClient, DownstreamRequest, HttpDownstreamClient};
pub use pipeline::{BranchPredicate, Next, Pipeline, PipelineBuilder, Stage, StageSlot};
pub use rate_limiting::RateLimitingStage;
pub use timeout::DeadlineStage;
