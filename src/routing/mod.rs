//! Route lookup: maps an inbound method and path to a configured route.

pub mod router;

pub use router::{encode_query, parse_query, render_downstream_path, MatchitRouteTable};

use axum::http::Method;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::types::DownstreamRoute;

/// A matched route plus the parameters captured from the path
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub route: Arc<DownstreamRoute>,
    pub params: HashMap<String, String>,
}

/// Route lookup used by the route lookup stage
pub trait RouteTable: Send + Sync {
    fn find(&self, method: &Method, path: &str) -> Option<RouteMatch>;
}
