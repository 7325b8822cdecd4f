//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    Router,
    body::Bytes,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

pub const ISSUER: &str = "https://issuer.example";
pub const CALLER: &str = "system:serviceaccount:ns1:curler";

pub const SECRET: &[u8] = b"trust-sidecar-test-signing-secret";
pub const SECRET_B64: &str = "dHJ1c3Qtc2lkZWNhci10ZXN0LXNpZ25pbmctc2VjcmV0";
pub const OTHER_SECRET: &[u8] = b"trust-sidecar-other-signing-key!!";
pub const ROTATED_SECRET: &[u8] = b"trust-sidecar-rotated-signing-key";
pub const ROTATED_SECRET_B64: &str = "dHJ1c3Qtc2lkZWNhci1yb3RhdGVkLXNpZ25pbmcta2V5";

pub const UNSCOPED_TOKEN: &str = "unscoped-credential";

/// Rego module used by most inbound tests.
pub const POLICY: &str = r#"
package knative.dev

import rego.v1

default allow := false

allow if input.source.identity == "system:serviceaccount:ns1:curler"

allow if input.request.path == "/public"

allow if input.request.body.amount < 100

allow if {
    input.request.path == "/nobody"
    not input.request.body
}
"#;

/// Keyset document trusting `secret_b64` under kid `k1` for [`ISSUER`].
pub fn keyset(secret_b64: &str) -> Value {
    json!({
        ISSUER: [{ "kty": "oct", "kid": "k1", "alg": "HS256", "k": secret_b64 }]
    })
}

/// On-disk trust sources in a temp dir.
pub struct Fixture {
    pub dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let fixture = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        fixture.write_keyset(&keyset(SECRET_B64));
        fixture.write_policy(POLICY);
        std::fs::create_dir(fixture.tokens_root()).unwrap();
        fixture.write_token("unscoped", UNSCOPED_TOKEN);
        fixture
    }

    pub fn keyset_path(&self) -> PathBuf {
        self.dir.path().join("jwks.json")
    }

    pub fn policy_path(&self) -> PathBuf {
        self.dir.path().join("policy.rego")
    }

    pub fn tokens_root(&self) -> PathBuf {
        self.dir.path().join("tokens")
    }

    pub fn write_keyset(&self, doc: &Value) {
        std::fs::write(self.keyset_path(), serde_json::to_vec(doc).unwrap()).unwrap();
    }

    pub fn write_policy(&self, source: &str) {
        std::fs::write(self.policy_path(), source).unwrap();
    }

    pub fn write_token(&self, audience: &str, token: &str) {
        write_file(&self.tokens_root().join(audience), token);
    }
}

fn write_file(path: &Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
}

pub fn now_secs() -> i64 {
    i64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs(),
    )
    .unwrap()
}

/// HS256 token with kid `k1`.
pub fn mint(claims: &Value, secret: &[u8]) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some("k1".to_string());
    jsonwebtoken::encode(&header, claims, &EncodingKey::from_secret(secret)).unwrap()
}

/// Valid token for `subject`, expiring in ten minutes.
pub fn token_for(subject: &str) -> String {
    mint(
        &json!({
            "iss": ISSUER,
            "sub": subject,
            "aud": ["ns1"],
            "exp": now_secs() + 600
        }),
        SECRET,
    )
}

/// A request as seen by the stand-in workload.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub type Recorder = Arc<Mutex<Vec<Recorded>>>;

/// Local HTTP server that records every request.
///
/// `/empty` answers 200 with no body, `/fail` answers 500, everything else
/// answers 200 with a short text body.
pub async fn spawn_recorder() -> (SocketAddr, Recorder) {
    let recorder: Recorder = Arc::default();
    let app = Router::new()
        .fallback(record)
        .with_state(Arc::clone(&recorder));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, recorder)
}

async fn record(State(recorder): State<Recorder>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    let path = parts
        .uri
        .path_and_query()
        .map_or_else(|| "/".to_string(), ToString::to_string);

    recorder.lock().push(Recorded {
        method: parts.method.to_string(),
        path: path.clone(),
        headers: parts.headers,
        body,
    });

    match parts.uri.path() {
        "/empty" => StatusCode::OK.into_response(),
        "/fail" => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        _ => (StatusCode::OK, "hello from workload").into_response(),
    }
}

/// A loopback port with nothing listening on it.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Refresh interval long enough that nothing reloads during a test.
pub const IDLE_REFRESH: Duration = Duration::from_secs(3600);
