//! Request forwarding.
//!
//! One shared `reqwest` client carries both directions. Redirects are not
//! followed, the system proxy is ignored and bodies are never decompressed,
//! so the callee's response reaches the caller as sent.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::debug;

use super::error_response;
use crate::{Error, Result};

/// Forwarding failure, mapped to a response status.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Outbound request carried no destination.
    #[error("Only absolute URLs are supported")]
    RelativeTarget,

    /// Destination could not be turned into a URL.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// The request body could not be buffered.
    #[error("Failed to read request body: {0}")]
    BodyRead(String),

    /// Dial, timeout or connection failure talking to the callee.
    #[error("Upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl ForwardError {
    /// HTTP status reported to the caller.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RelativeTarget | Self::InvalidTarget(_) | Self::BodyRead(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for ForwardError {
    fn into_response(self) -> Response {
        error_response(self.status(), &self.to_string())
    }
}

/// Body handed to [`Forwarder::send`].
#[derive(Debug)]
pub enum ForwardBody {
    /// Already read into memory (payload-aware policy).
    Buffered(Bytes),
    /// Streamed through untouched.
    Streaming(Body),
}

impl ForwardBody {
    /// Buffered bytes, if any.
    #[must_use]
    pub fn as_buffered(&self) -> Option<&Bytes> {
        match self {
            Self::Buffered(bytes) => Some(bytes),
            Self::Streaming(_) => None,
        }
    }
}

/// Connection-scoped headers that must not cross the proxy.
const HOP_BY_HOP: [header::HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Remove hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in listed {
        headers.remove(name.as_str());
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers.remove("proxy-connection");
}

/// Shared HTTP client for both gateways.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the TLS backend cannot be initialised.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Wrap a preconfigured client, e.g. one with static host resolution.
    #[must_use]
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Send one request and stream the response back.
    ///
    /// `headers` are sent as given apart from hop-by-hop headers; a `Host`
    /// header present in them is kept.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        mut headers: HeaderMap,
        body: ForwardBody,
    ) -> std::result::Result<Response, ForwardError> {
        strip_hop_by_hop(&mut headers);

        let body = match body {
            ForwardBody::Buffered(bytes) => {
                // The client frames buffered bodies itself.
                headers.remove(header::CONTENT_LENGTH);
                reqwest::Body::from(bytes)
            }
            ForwardBody::Streaming(body) => reqwest::Body::wrap_stream(body.into_data_stream()),
        };

        debug!(method = %method, url = %url, "Forwarding request");
        let upstream = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    ForwardError::InvalidTarget(e.to_string())
                } else {
                    ForwardError::Transport(e)
                }
            })?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}
