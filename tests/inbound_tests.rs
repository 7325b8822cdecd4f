//! Inbound gateway tests
//!
//! Requests are driven through the gateway router against a local workload
//! that records what it receives.

mod common;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{
    CALLER, Fixture, IDLE_REFRESH, ISSUER, OTHER_SECRET, Recorder, SECRET, UNSCOPED_TOKEN,
    closed_port, mint, now_secs, spawn_recorder, token_for,
};
use trust_sidecar::{
    authn::KeysetStore,
    authz::{self, PolicyKind},
    config::{InboundConfig, PolicyConfig},
    credentials::CredentialStore,
    proxy::{AUTHORIZATION_HEADER, FORWARDED_FOR_HEADER, Forwarder, InboundGateway},
};

fn gateway(
    fixture: &Fixture,
    policy: PolicyConfig,
    upstream: SocketAddr,
    settings: InboundConfig,
) -> Router {
    let keys = Arc::new(KeysetStore::new(fixture.keyset_path(), IDLE_REFRESH).unwrap());
    let policy = authz::load(&policy).unwrap();
    let credentials = Arc::new(CredentialStore::new(fixture.tokens_root(), IDLE_REFRESH).unwrap());
    let forwarder = Forwarder::new(Duration::from_secs(5)).unwrap();

    Arc::new(InboundGateway::new(
        keys,
        policy,
        credentials,
        forwarder,
        format!("http://{upstream}"),
        settings,
    ))
    .router()
}

fn rego(fixture: &Fixture) -> PolicyConfig {
    PolicyConfig {
        engine: PolicyKind::Rego,
        path: fixture.policy_path(),
        refresh_interval: Some(IDLE_REFRESH),
    }
}

async fn rego_gateway(settings: InboundConfig) -> (Fixture, Router, Recorder) {
    let fixture = Fixture::new();
    let (addr, recorder) = spawn_recorder().await;
    let router = gateway(&fixture, rego(&fixture), addr, settings);
    (fixture, router, recorder)
}

fn payload_mode() -> InboundConfig {
    InboundConfig {
        apply_policy_on_payload: true,
        ..InboundConfig::default()
    }
}

async fn body_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Test that an anonymous caller reaches the workload when policy allows it
#[tokio::test]
async fn test_anonymous_request_allowed_by_policy() {
    let (_fixture, router, recorder) = rego_gateway(InboundConfig::default()).await;

    let response = router
        .oneshot(Request::builder().uri("/public?page=2").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"hello from workload");

    let seen = recorder.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path, "/public?page=2");
}

/// Test that an anonymous caller is refused where policy requires an identity
#[tokio::test]
async fn test_anonymous_request_denied_by_policy() {
    let (_fixture, router, recorder) = rego_gateway(InboundConfig::default()).await;

    let response = router
        .oneshot(Request::builder().uri("/private").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(recorder.lock().is_empty());
}

/// Test that a verified caller is forwarded with both credential headers removed
#[tokio::test]
async fn test_verified_caller_forwarded_without_credentials() {
    let (_fixture, router, recorder) = rego_gateway(InboundConfig::default()).await;

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/orders")
                .header(AUTHORIZATION_HEADER, format!("Bearer {}", token_for(CALLER)))
                .header("x-request-id", "r-1")
                .body(Body::from("order"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let seen = recorder.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "POST");
    assert_eq!(&seen[0].body[..], b"order");
    assert_eq!(seen[0].headers.get("x-request-id").unwrap(), "r-1");
    assert!(seen[0].headers.get(&AUTHORIZATION_HEADER).is_none());
    assert!(seen[0].headers.get(&FORWARDED_FOR_HEADER).is_none());
}

/// Test that a verified caller outside the policy is refused
#[tokio::test]
async fn test_verified_caller_denied_by_policy() {
    let (_fixture, router, recorder) = rego_gateway(InboundConfig::default()).await;

    let response = router
        .oneshot(
            Request::builder()
                .uri("/private")
                .header(AUTHORIZATION_HEADER, token_for("system:serviceaccount:ns1:intruder"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(recorder.lock().is_empty());
}

/// Test that an expired token is rejected before the workload is invoked
#[tokio::test]
async fn test_expired_token_rejected() {
    let (_fixture, router, recorder) = rego_gateway(InboundConfig::default()).await;
    let expired = mint(
        &json!({ "iss": ISSUER, "sub": CALLER, "exp": now_secs() - 60 }),
        SECRET,
    );

    let response = router
        .oneshot(
            Request::builder()
                .uri("/public")
                .header(AUTHORIZATION_HEADER, expired)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.headers().get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");
    let body = body_json(response.into_body()).await;
    assert!(body["error"].as_str().unwrap().contains("expired"));
    assert!(recorder.lock().is_empty());
}

/// Test that a token from an untrusted issuer is rejected
#[tokio::test]
async fn test_unknown_issuer_rejected() {
    let (_fixture, router, recorder) = rego_gateway(InboundConfig::default()).await;
    let foreign = mint(
        &json!({ "iss": "https://elsewhere.example", "sub": CALLER, "exp": now_secs() + 600 }),
        SECRET,
    );

    let response = router
        .oneshot(
            Request::builder()
                .uri("/public")
                .header(AUTHORIZATION_HEADER, foreign)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(recorder.lock().is_empty());
}

/// Test that the forwarded credential is the one verified when both are sent
#[tokio::test]
async fn test_forwarded_credential_takes_precedence() {
    let (_fixture, router, recorder) = rego_gateway(InboundConfig::default()).await;
    let forged = mint(
        &json!({ "iss": ISSUER, "sub": CALLER, "exp": now_secs() + 600 }),
        OTHER_SECRET,
    );

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/private")
                .header(FORWARDED_FOR_HEADER, forged)
                .header(AUTHORIZATION_HEADER, token_for(CALLER))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/private")
                .header(FORWARDED_FOR_HEADER, token_for(CALLER))
                .header(AUTHORIZATION_HEADER, "not-a-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(recorder.lock().len(), 1);
}

/// Test that payload-aware policy sees JSON bodies and the workload still gets them
#[tokio::test]
async fn test_payload_policy_reads_json_body() {
    let (_fixture, router, recorder) = rego_gateway(payload_mode()).await;

    let small = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/charge")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"amount": 5}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(small.status(), StatusCode::OK);

    let large = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/charge")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"amount": 500}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(large.status(), StatusCode::FORBIDDEN);

    let seen = recorder.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(&seen[0].body[..], br#"{"amount": 5}"#);
}

/// Test that a malformed JSON body is evaluated without a body and forwarded intact
#[tokio::test]
async fn test_payload_policy_with_malformed_body() {
    let (_fixture, router, recorder) = rego_gateway(payload_mode()).await;

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/nobody")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let seen = recorder.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(&seen[0].body[..], b"{not json");
}

/// Test that a body over the buffering limit is rejected
#[tokio::test]
async fn test_payload_over_limit_rejected() {
    let (_fixture, router, recorder) = rego_gateway(InboundConfig {
        max_body_size: 16,
        ..payload_mode()
    })
    .await;

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/public")
                .body(Body::from(vec![b'x'; 64]))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(recorder.lock().is_empty());
}

/// Test that identity reply stamps only successful responses with a body
#[tokio::test]
async fn test_identity_reply_on_successful_responses() {
    let (_fixture, router, _recorder) = rego_gateway(InboundConfig {
        reply_with_identity: true,
        ..InboundConfig::default()
    })
    .await;

    let request = |path: &str| {
        Request::builder()
            .uri(path)
            .header(AUTHORIZATION_HEADER, token_for(CALLER))
            .body(Body::empty())
            .unwrap()
    };

    let ok = router.clone().oneshot(request("/hello")).await.unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    assert_eq!(ok.headers().get(&FORWARDED_FOR_HEADER).unwrap(), UNSCOPED_TOKEN);

    let empty = router.clone().oneshot(request("/empty")).await.unwrap();
    assert_eq!(empty.status(), StatusCode::OK);
    assert!(empty.headers().get(&FORWARDED_FOR_HEADER).is_none());

    let failed = router.oneshot(request("/fail")).await.unwrap();
    assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(failed.headers().get(&FORWARDED_FOR_HEADER).is_none());
    let body = axum::body::to_bytes(failed.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"boom");
}

/// Test that identity reply is off by default
#[tokio::test]
async fn test_identity_reply_disabled_by_default() {
    let (_fixture, router, _recorder) = rego_gateway(InboundConfig::default()).await;

    let response = router
        .oneshot(Request::builder().uri("/public").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(&FORWARDED_FOR_HEADER).is_none());
}

/// Test that an unreachable workload yields a bad gateway
#[tokio::test]
async fn test_workload_down_is_bad_gateway() {
    let fixture = Fixture::new();
    let upstream = SocketAddr::from(([127, 0, 0, 1], closed_port()));
    let router = gateway(&fixture, rego(&fixture), upstream, InboundConfig::default());

    let response = router
        .oneshot(Request::builder().uri("/public").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

/// Test the whitelist engine end to end
#[tokio::test]
async fn test_whitelist_policy_gateway() {
    let fixture = Fixture::new();
    let whitelist: PathBuf = fixture.dir.path().join("whitelist.json");
    std::fs::write(
        &whitelist,
        serde_json::to_vec(&json!({
            CALLER: true,
            "system:serviceaccount:ns1:blocked": false
        }))
        .unwrap(),
    )
    .unwrap();
    let (addr, recorder) = spawn_recorder().await;
    let policy = PolicyConfig {
        engine: PolicyKind::Whitelist,
        path: whitelist,
        refresh_interval: None,
    };
    let router = gateway(&fixture, policy, addr, InboundConfig::default());

    let call = |subject: Option<&str>| {
        let mut builder = Request::builder().uri("/public");
        if let Some(subject) = subject {
            builder = builder.header(AUTHORIZATION_HEADER, token_for(subject));
        }
        builder.body(Body::empty()).unwrap()
    };

    let allowed = router.clone().oneshot(call(Some(CALLER))).await.unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    let blocked = router
        .clone()
        .oneshot(call(Some("system:serviceaccount:ns1:blocked")))
        .await
        .unwrap();
    assert_eq!(blocked.status(), StatusCode::FORBIDDEN);

    // Whitelist ignores the path, so anonymous is denied even on /public.
    let anonymous = router.oneshot(call(None)).await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);

    assert_eq!(recorder.lock().len(), 1);
}
