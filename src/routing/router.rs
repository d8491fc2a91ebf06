//! # Router Module
//!
//! Route lookup over a `matchit` radix tree. Several routes may share one
//! upstream template as long as their methods differ; the first route whose
//! method list accepts the request wins.

use axum::http::Method;
use matchit::{Match, Router as RadixRouter};
use std::collections::HashMap;
use std::sync::Arc;

use super::{RouteMatch, RouteTable};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::DownstreamRoute;

/// [`RouteTable`] built once from configuration
pub struct MatchitRouteTable {
    router: RadixRouter<Vec<Arc<DownstreamRoute>>>,
    len: usize,
}

impl MatchitRouteTable {
    /// Build the table; fails on templates `matchit` rejects
    pub fn from_routes(routes: &[DownstreamRoute]) -> GatewayResult<Self> {
        let mut grouped: Vec<(String, Vec<Arc<DownstreamRoute>>)> = Vec::new();
        for route in routes {
            let route = Arc::new(route.clone());
            match grouped
                .iter_mut()
                .find(|(template, _)| *template == route.upstream_path_template)
            {
                Some((_, group)) => group.push(route),
                None => grouped.push((route.upstream_path_template.clone(), vec![route])),
            }
        }

        let mut router = RadixRouter::new();
        for (template, group) in grouped {
            router.insert(template.as_str(), group).map_err(|e| {
                GatewayError::config(format!("Failed to add route '{}': {}", template, e))
            })?;
        }

        Ok(Self {
            router,
            len: routes.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl RouteTable for MatchitRouteTable {
    fn find(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let Match { value: group, params } = self.router.at(path).ok()?;
        let route = group.iter().find(|route| route.matches_method(method))?;

        let params = params
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();

        Some(RouteMatch {
            route: route.clone(),
            params,
        })
    }
}

/// Fill `{name}` placeholders of a downstream template from matched parameters
///
/// Unknown placeholders are left as written.
pub fn render_downstream_path(template: &str, params: &HashMap<String, String>) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        let name = &rest[open + 1..open + close];
        rendered.push_str(&rest[..open]);
        match params.get(name) {
            Some(value) => rendered.push_str(value),
            None => rendered.push_str(&rest[open..=open + close]),
        }
        rest = &rest[open + close + 1..];
    }

    rendered.push_str(rest);
    rendered
}

/// Decode a query string into ordered key/value pairs
pub fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(&key.replace('+', " ")).ok()?.into_owned();
            let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

/// Encode key/value pairs as a query string
pub fn encode_query(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}
