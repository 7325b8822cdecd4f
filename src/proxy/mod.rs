//! Inbound and outbound request gateways.
//!
//! The sidecar listens on two ports:
//!
//! - **inbound**: callers reach the shielded workload through here. Tokens are
//!   verified, policy is evaluated, and allowed requests are forwarded to the
//!   workload on `127.0.0.1:{service_port}`.
//! - **outbound**: the workload's own calls leave through here and get a
//!   credential attached for their destination.

pub mod forward;
pub mod inbound;
pub mod outbound;
pub mod server;

use axum::{
    Json,
    http::{HeaderName, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;

pub use forward::{ForwardBody, ForwardError, Forwarder};
pub use inbound::InboundGateway;
pub use outbound::OutboundGateway;
pub use server::Proxy;

/// Credential header set by callers and by the outbound gateway.
pub const AUTHORIZATION_HEADER: HeaderName = HeaderName::from_static("knative-proxy-authorization");

/// Identity asserted by an upstream hop; preferred over
/// [`AUTHORIZATION_HEADER`] when both are present.
pub const FORWARDED_FOR_HEADER: HeaderName = HeaderName::from_static("knative-proxy-forwarded-for");

/// Reserved for identity hints on responses. Never set.
pub const IDENTITY_HINT_HEADER: HeaderName = HeaderName::from_static("knative-proxy-identity-hint");

/// Plain JSON error body with the given status.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
