//! # Authentication and Authorization Stages
//!
//! Authentication resolves a principal through the [`Authenticator`] registered
//! under the route's provider key. Authorization then checks the route's allowed
//! scopes and claim requirements against that principal.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::pipeline::{Next, Stage};
use crate::core::config::AuthenticationConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{AuthContext, GatewayResponse, IncomingRequest, RequestContext};

/// Establishes who sent a request
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &IncomingRequest) -> GatewayResult<AuthContext>;
}

/// Authenticators keyed by provider key
#[derive(Default)]
pub struct AuthenticatorRegistry {
    providers: HashMap<String, Arc<dyn Authenticator>>,
}

impl AuthenticatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`ApiKeyAuthenticator`] per provider key in the configuration
    pub fn from_config(config: &AuthenticationConfig) -> Self {
        let mut registry = Self::new();
        for (provider_key, credentials) in &config.api_keys {
            registry.register(provider_key.clone(), Arc::new(ApiKeyAuthenticator::new(credentials.clone())));
            info!(provider = %provider_key, keys = credentials.len(), "Registered API key authenticator");
        }
        registry
    }

    pub fn register(&mut self, provider_key: impl Into<String>, authenticator: Arc<dyn Authenticator>) {
        self.providers.insert(provider_key.into(), authenticator);
    }

    pub fn get(&self, provider_key: &str) -> Option<Arc<dyn Authenticator>> {
        self.providers.get(provider_key).cloned()
    }

    pub fn contains(&self, provider_key: &str) -> bool {
        self.providers.contains_key(provider_key)
    }
}

pub const API_KEY_HEADER: &str = "x-api-key";

/// One accepted API key and the principal it stands for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyCredential {
    pub key: String,
    pub subject: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub claims: HashMap<String, String>,
}

/// Accepts requests carrying a known key in the `x-api-key` header
pub struct ApiKeyAuthenticator {
    keys: HashMap<String, ApiKeyCredential>,
}

impl ApiKeyAuthenticator {
    pub fn new(credentials: Vec<ApiKeyCredential>) -> Self {
        Self {
            keys: credentials.into_iter().map(|c| (c.key.clone(), c)).collect(),
        }
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self, request: &IncomingRequest) -> GatewayResult<AuthContext> {
        let key = request
            .header(API_KEY_HEADER)
            .ok_or_else(|| GatewayError::auth("missing API key"))?;
        let credential = self
            .keys
            .get(key)
            .ok_or_else(|| GatewayError::auth("unknown API key"))?;

        let mut claims = credential.claims.clone();
        claims.entry("sub".to_string()).or_insert_with(|| credential.subject.clone());
        Ok(AuthContext {
            subject: credential.subject.clone(),
            claims,
            scopes: credential.scopes.clone(),
        })
    }
}

/// Runs the route's authenticator, if it names one
pub struct AuthenticationStage {
    authenticators: Arc<AuthenticatorRegistry>,
}

impl AuthenticationStage {
    pub fn new(authenticators: Arc<AuthenticatorRegistry>) -> Self {
        Self { authenticators }
    }
}

#[async_trait]
impl Stage for AuthenticationStage {
    fn name(&self) -> &str {
        "authentication"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
        let route = ctx.require_route()?;
        if let Some(options) = &route.authentication {
            let authenticator = self.authenticators.get(&options.provider_key).ok_or_else(|| {
                GatewayError::auth(format!("no authenticator registered for '{}'", options.provider_key))
            })?;
            let principal = authenticator.authenticate(&ctx.request).await?;
            debug!(subject = %principal.subject, provider = %options.provider_key, "Authenticated request");
            ctx.auth = Some(principal);
        }
        next.run(ctx).await
    }
}

/// Enforces allowed scopes and required claim values
#[derive(Debug, Default)]
pub struct AuthorizationStage;

impl AuthorizationStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for AuthorizationStage {
    fn name(&self) -> &str {
        "authorization"
    }

    async fn handle(&self, ctx: &mut RequestContext, next: Next<'_>) -> GatewayResult<GatewayResponse> {
        let route = ctx.require_route()?;
        let scopes = route
            .authentication
            .as_ref()
            .map(|options| options.allowed_scopes.as_slice())
            .unwrap_or_default();

        if !scopes.is_empty() || !route.route_claims_requirement.is_empty() {
            let auth = ctx
                .auth
                .as_ref()
                .ok_or_else(|| GatewayError::auth("route requires an authenticated principal"))?;

            if !scopes.is_empty() && !scopes.iter().any(|scope| auth.has_scope(scope)) {
                return Err(GatewayError::authz(format!(
                    "none of the allowed scopes {:?} were granted",
                    scopes
                )));
            }

            for (claim, required) in &route.route_claims_requirement {
                match auth.claim(claim) {
                    Some(value) if value == required => {}
                    Some(_) => {
                        return Err(GatewayError::authz(format!("claim '{}' does not have the required value", claim)))
                    }
                    None => return Err(GatewayError::authz(format!("claim '{}' not found", claim))),
                }
            }
        }
        next.run(ctx).await
    }
}
