//! Request authorization.
//!
//! A [`PolicyEvaluator`] answers one question: may this caller make this
//! request? Two strategies exist and the gateway does not care which one is
//! configured:
//!
//! - [`RegoPolicy`] evaluates a Rego module (package `knative.dev`, rule
//!   `allow`) against the full [`PolicyInput`].
//! - [`WhitelistPolicy`] looks the caller's identity up in a static JSON map.
//!
//! Both are fail-closed: any evaluation problem is a deny.

pub mod rego;
pub mod whitelist;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::PolicyConfig;

pub use rego::RegoPolicy;
pub use whitelist::WhitelistPolicy;

/// Authorization decision for one request.
pub trait PolicyEvaluator: Send + Sync {
    /// `true` only when the policy positively allows the request.
    fn is_allowed(&self, source: &Source, request: &RequestContext) -> bool;

    /// Start background policy refresh.
    fn start(&self, cancel: CancellationToken);

    /// Which strategy this is.
    fn kind(&self) -> PolicyKind;
}

/// Policy strategy selected by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Rego module evaluation.
    #[default]
    Rego,
    /// Static identity whitelist.
    Whitelist,
}

impl PolicyKind {
    /// Refresh interval used when the configuration does not set one.
    #[must_use]
    pub fn default_refresh_interval(self) -> std::time::Duration {
        match self {
            Self::Rego => std::time::Duration::from_secs(30),
            Self::Whitelist => std::time::Duration::from_secs(15),
        }
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rego => f.write_str("rego"),
            Self::Whitelist => f.write_str("whitelist"),
        }
    }
}

impl std::str::FromStr for PolicyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rego" | "opa" => Ok(Self::Rego),
            "whitelist" => Ok(Self::Whitelist),
            other => Err(format!("unknown policy engine: {other}")),
        }
    }
}

/// Policy failure. Never reaches the caller; logged and treated as deny.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The policy source did not compile or parse.
    #[error("Policy compile error: {0}")]
    Compile(String),

    /// Evaluation raised an error.
    #[error("Policy evaluation error: {0}")]
    Evaluation(String),

    /// The request could not be rendered as policy input.
    #[error("Policy input error: {0}")]
    Input(String),
}

/// Caller identity, taken from verified claims.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Token issuer.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub issuer: String,
    /// First audience of the token.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub audience: String,
    /// Token subject.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub identity: String,
}

impl Source {
    /// Build from a verified claim set. Empty claims give an anonymous source.
    #[must_use]
    pub fn from_claims(claims: &crate::authn::Claims) -> Self {
        Self {
            issuer: claims.issuer().unwrap_or_default().to_string(),
            audience: claims.first_audience().unwrap_or_default().to_string(),
            identity: claims.subject().unwrap_or_default().to_string(),
        }
    }
}

/// Request metadata visible to policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// HTTP method.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    /// `Host` header, or the URI authority.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    /// Path and query as received.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Lowercase header name to values, in arrival order.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Vec<String>>,
    /// Declared or buffered body length.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<u64>,
    /// Peer socket address.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
    /// Parsed JSON body, only in payload-aware mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Document handed to the Rego module as `input`.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInput<'a> {
    /// Who is calling.
    pub source: &'a Source,
    /// What they are asking for.
    pub request: &'a RequestContext,
}

/// Build the configured policy evaluator and perform its first load.
///
/// # Errors
///
/// Returns [`crate::Error::Config`] if the policy file cannot be loaded.
pub fn load(config: &PolicyConfig) -> Result<Arc<dyn PolicyEvaluator>> {
    let interval = config
        .refresh_interval
        .unwrap_or_else(|| config.engine.default_refresh_interval());

    let evaluator: Arc<dyn PolicyEvaluator> = match config.engine {
        PolicyKind::Rego => Arc::new(RegoPolicy::new(config.path.clone(), interval)?),
        PolicyKind::Whitelist => Arc::new(WhitelistPolicy::new(config.path.clone(), interval)?),
    };
    Ok(evaluator)
}
