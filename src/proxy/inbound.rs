//! Inbound gateway: authenticate, authorize, forward to the workload.
//!
//! Per request:
//!
//! 1. Take the credential from [`FORWARDED_FOR_HEADER`], falling back to
//!    [`AUTHORIZATION_HEADER`].
//! 2. In payload-aware mode, buffer the body (capped at `max_body_size`).
//! 3. Verify the credential if one was presented. A missing credential is an
//!    anonymous caller, not an error.
//! 4. Build the policy input and evaluate it.
//! 5. Strip both credential headers and forward to the workload.
//! 6. With identity reply on, stamp successful non-empty responses with the
//!    unscoped credential.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::{Map, Value};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{
    AUTHORIZATION_HEADER, FORWARDED_FOR_HEADER, ForwardBody, ForwardError, Forwarder,
    error_response,
};
use crate::authn::{Claims, KeysetStore, VerificationError};
use crate::authz::{PolicyEvaluator, RequestContext, Source};
use crate::config::InboundConfig;
use crate::credentials::CredentialStore;

/// Inbound request pipeline.
pub struct InboundGateway {
    keys: Arc<KeysetStore>,
    policy: Arc<dyn PolicyEvaluator>,
    credentials: Arc<CredentialStore>,
    forwarder: Forwarder,
    upstream: String,
    settings: InboundConfig,
}

impl InboundGateway {
    /// `upstream` is the workload's base URL, e.g. `http://127.0.0.1:8080`.
    pub fn new(
        keys: Arc<KeysetStore>,
        policy: Arc<dyn PolicyEvaluator>,
        credentials: Arc<CredentialStore>,
        forwarder: Forwarder,
        upstream: impl Into<String>,
        settings: InboundConfig,
    ) -> Self {
        Self {
            keys,
            policy,
            credentials,
            forwarder,
            upstream: upstream.into().trim_end_matches('/').to_string(),
            settings,
        }
    }

    /// Axum router serving every path through this gateway.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(inbound_handler)
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Run the pipeline for one request.
    pub async fn handle(&self, request: Request) -> Response {
        let (mut parts, body) = request.into_parts();
        let span = info_span!("inbound", method = %parts.method, path = %parts.uri.path());

        async move {
            let credential = extract_credential(&parts.headers);

            let body = if self.settings.apply_policy_on_payload {
                match axum::body::to_bytes(body, self.settings.max_body_size).await {
                    Ok(bytes) => ForwardBody::Buffered(bytes),
                    Err(e) => {
                        warn!(error = %e, "Failed to buffer request body");
                        return ForwardError::BodyRead(e.to_string()).into_response();
                    }
                }
            } else {
                ForwardBody::Streaming(body)
            };

            let claims = match credential {
                Some(raw) => match self.keys.verify(&raw) {
                    Ok(claims) => claims,
                    Err(e) => {
                        info!(error = %e, "Rejecting request: credential not verified");
                        return unauthorized_response(&e);
                    }
                },
                None => Claims::default(),
            };

            let source = Source::from_claims(&claims);
            let context = request_context(&parts, body.as_buffered());
            if !self.policy.is_allowed(&source, &context) {
                info!(identity = %source.identity, issuer = %source.issuer, "Request denied by policy");
                return error_response(StatusCode::FORBIDDEN, "Forbidden");
            }
            debug!(identity = %source.identity, "Request allowed");

            parts.headers.remove(&AUTHORIZATION_HEADER);
            parts.headers.remove(&FORWARDED_FOR_HEADER);

            let path = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
            let url = format!("{}{path}", self.upstream);

            match self.forwarder.send(parts.method, &url, parts.headers, body).await {
                Ok(mut response) => {
                    if self.settings.reply_with_identity {
                        self.stamp_identity(&mut response);
                    }
                    response
                }
                Err(e) => {
                    error!(error = %e, upstream = %self.upstream, "Failed to reach workload");
                    e.into_response()
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Attach the unscoped credential to successful responses with a body.
    fn stamp_identity(&self, response: &mut Response) {
        if response.status().as_u16() >= 400 || content_length(response.headers()).unwrap_or(0) == 0 {
            return;
        }
        let Some(token) = self.credentials.unscoped_token() else {
            return;
        };
        match HeaderValue::from_str(&token) {
            Ok(value) => {
                response.headers_mut().insert(FORWARDED_FOR_HEADER, value);
            }
            Err(e) => warn!(error = %e, "Unscoped credential is not a valid header value"),
        }
    }
}

impl std::fmt::Debug for InboundGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundGateway")
            .field("upstream", &self.upstream)
            .field("policy", &self.policy.kind())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

async fn inbound_handler(State(gateway): State<Arc<InboundGateway>>, request: Request) -> Response {
    gateway.handle(request).await
}

/// Credential from the forwarded header, else the direct one. An optional
/// `Bearer ` prefix is dropped.
fn extract_credential(headers: &HeaderMap) -> Option<String> {
    [&FORWARDED_FOR_HEADER, &AUTHORIZATION_HEADER]
        .into_iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .map(|value| {
            let value = value.trim();
            value
                .get(..7)
                .filter(|prefix| prefix.eq_ignore_ascii_case("bearer "))
                .map_or(value, |_| value[7..].trim_start())
        })
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

fn request_context(parts: &Parts, buffered: Option<&Bytes>) -> RequestContext {
    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in &parts.headers {
        if name == AUTHORIZATION_HEADER || name == FORWARDED_FOR_HEADER {
            continue;
        }
        if let Ok(value) = value.to_str() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(ToString::to_string))
        .unwrap_or_default();

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    RequestContext {
        method: parts.method.to_string(),
        host,
        path: parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), ToString::to_string),
        headers,
        content_length: content_length(&parts.headers)
            .or_else(|| buffered.and_then(|bytes| u64::try_from(bytes.len()).ok())),
        remote_addr,
        body: buffered.and_then(|bytes| parse_body(bytes)),
    }
}

/// JSON object body, or `None` when absent or unparseable.
fn parse_body(bytes: &Bytes) -> Option<Value> {
    if bytes.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Map<String, Value>>(bytes) {
        Ok(body) => Some(Value::Object(body)),
        Err(e) => {
            warn!(error = %e, "Request payload is not a JSON object, evaluating without body");
            None
        }
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn unauthorized_response(err: &VerificationError) -> Response {
    let mut response = error_response(StatusCode::UNAUTHORIZED, &err.to_string());
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    response
}
