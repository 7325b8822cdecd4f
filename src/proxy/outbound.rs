//! Outbound gateway: attach a credential to the workload's calls.
//!
//! The destination comes from an absolute request URI (proxy-style) or,
//! for transparently redirected traffic, from the `Host` header with an
//! `http` scheme. A request with neither is rejected.
//!
//! Credential attachment is fail-open: with no matching audience the call
//! goes out anonymously.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::{HeaderValue, header, request::Parts, uri::Authority},
    response::{IntoResponse, Response},
};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{Instrument, debug, error, info_span, warn};

use super::{AUTHORIZATION_HEADER, ForwardBody, ForwardError, Forwarder};
use crate::credentials::CredentialStore;

/// Where an outbound call is going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Full URL to send to.
    pub url: String,
    /// Host name used for credential lookup (no port).
    pub host: String,
}

/// Outbound request pipeline.
#[derive(Debug)]
pub struct OutboundGateway {
    credentials: Arc<CredentialStore>,
    forwarder: Forwarder,
}

impl OutboundGateway {
    /// Gateway attaching credentials from `credentials`.
    pub fn new(credentials: Arc<CredentialStore>, forwarder: Forwarder) -> Self {
        Self {
            credentials,
            forwarder,
        }
    }

    /// Axum router serving every path through this gateway.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(outbound_handler)
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }

    /// Run the pipeline for one request.
    pub async fn handle(&self, request: Request) -> Response {
        let (mut parts, body) = request.into_parts();
        let span = info_span!("outbound", method = %parts.method, uri = %parts.uri);

        async move {
            let target = match resolve_target(&parts) {
                Ok(target) => target,
                Err(e) => {
                    warn!(error = %e, "Rejecting outbound request");
                    return e.into_response();
                }
            };

            let has_credential = parts
                .headers
                .get(&AUTHORIZATION_HEADER)
                .is_some_and(|value| !value.is_empty());
            if has_credential {
                debug!(host = %target.host, "Keeping workload-provided credential");
            } else {
                self.attach_credential(&mut parts, &target.host);
            }

            parts.headers.remove(header::HOST);
            debug!(url = %target.url, "Forwarding outbound request");

            match self
                .forwarder
                .send(parts.method, &target.url, parts.headers, ForwardBody::Streaming(body))
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    error!(error = %e, url = %target.url, "Outbound request failed");
                    e.into_response()
                }
            }
        }
        .instrument(span)
        .await
    }

    fn attach_credential(&self, parts: &mut Parts, host: &str) {
        let Some(token) = self.credentials.find_token(host) else {
            warn!(host = %host, "No credential found for destination, sending request anonymously");
            return;
        };
        match HeaderValue::from_str(&token) {
            Ok(value) => {
                parts.headers.insert(AUTHORIZATION_HEADER, value);
            }
            Err(e) => warn!(
                host = %host,
                error = %e,
                "Credential is not a valid header value, sending request anonymously"
            ),
        }
    }
}

async fn outbound_handler(
    State(gateway): State<Arc<OutboundGateway>>,
    request: Request,
) -> Response {
    gateway.handle(request).await
}

/// Work out the destination of an outbound call.
///
/// # Errors
///
/// [`ForwardError::RelativeTarget`] when neither the URI nor a `Host` header
/// names a destination; [`ForwardError::InvalidTarget`] when the `Host`
/// header is not a valid authority.
pub fn resolve_target(parts: &Parts) -> Result<Target, ForwardError> {
    let uri = &parts.uri;
    if let (Some(_), Some(authority)) = (uri.scheme(), uri.authority()) {
        return Ok(Target {
            url: uri.to_string(),
            host: authority.host().to_string(),
        });
    }

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ForwardError::RelativeTarget)?;
    let authority: Authority = host
        .parse()
        .map_err(|e| ForwardError::InvalidTarget(format!("{host}: {e}")))?;
    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());

    Ok(Target {
        url: format!("http://{authority}{path}"),
        host: authority.host().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Request as HttpRequest, StatusCode};
    use pretty_assertions::assert_eq;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn absolute_uri_is_used_as_is() {
        let parts = parts(HttpRequest::builder().uri("http://billing.example.com:8080/v1/charge?x=1"));

        let target = resolve_target(&parts).unwrap();

        assert_eq!(
            target,
            Target {
                url: "http://billing.example.com:8080/v1/charge?x=1".to_string(),
                host: "billing.example.com".to_string(),
            }
        );
    }

    #[test]
    fn host_header_completes_origin_form() {
        let parts = parts(
            HttpRequest::builder()
                .uri("/v1/charge")
                .header(header::HOST, "billing.ns2.svc.cluster.local"),
        );

        let target = resolve_target(&parts).unwrap();

        assert_eq!(target.url, "http://billing.ns2.svc.cluster.local/v1/charge");
        assert_eq!(target.host, "billing.ns2.svc.cluster.local");
    }

    #[test]
    fn relative_target_without_host_is_rejected() {
        let parts = parts(HttpRequest::builder().uri("/v1/charge"));

        let err = resolve_target(&parts).unwrap_err();

        assert!(matches!(err, ForwardError::RelativeTarget));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn malformed_host_header_is_rejected() {
        let parts = parts(
            HttpRequest::builder()
                .uri("/")
                .header(header::HOST, "bad host"),
        );

        assert!(matches!(
            resolve_target(&parts),
            Err(ForwardError::InvalidTarget(_))
        ));
    }
}
