//! # Dispatch Gateway - Core Library Crate
//!
//! An API gateway core: every request runs through an overridable stage chain
//! that looks up the route, enforces per-client quotas, authenticates and
//! authorizes, resolves a live endpoint through service discovery and forwards
//! the request downstream.
//!
//! Start with [`Gateway::builder`] and serve it with [`GatewayServer`].

/// Error types, configuration and the data structures shared by every module
pub mod core;

/// Composition root and HTTP server
pub mod gateway;

/// The stage chain and the built-in stages
pub mod middleware;

/// Service discovery: static and actively polled registry providers
pub mod discovery;

/// Route lookup with path parameter extraction
pub mod routing;

/// Fixed-window rate limiting and its counter stores
pub mod rate_limiting;

/// Logging and metrics setup
pub mod observability;

pub use core::config::GatewayConfig;
pub use core::error::{GatewayError, GatewayResult};
pub use core::types::{GatewayResponse, IncomingRequest, RequestContext};
pub use gateway::{Gateway, GatewayBuilder, GatewayServer};
pub use middleware::{Next, Pipeline, PipelineBuilder, Stage, StageSlot};
