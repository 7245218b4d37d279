#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use chrono::Duration;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use delegation_auth::engine::{Engine, EngineConfig};
use delegation_auth::http::{self, AuthState, ResourceState};
use delegation_auth::idp::DisabledIdp;
use delegation_auth::rate_limit::RateLimiter;
use delegation_auth::signer::Signer;
use delegation_auth::store::Store;

pub const JWT_SECRET: &str = "test-secret-at-least-32-bytes-long!!";

/// Build a fresh in-memory authorization service state, isolated per
/// test (every test gets its own `Store`).
pub fn test_auth_state() -> AuthState {
    let store = Arc::new(Store::new());
    let signer = Arc::new(Signer::new(JWT_SECRET.as_bytes()));
    let engine = Arc::new(Engine::new(
        Arc::clone(&store),
        signer,
        EngineConfig {
            issuer: "http://localhost:8080".into(),
            delegation_ttl: Duration::minutes(10),
            access_ttl: Duration::minutes(5),
        },
    ));
    AuthState {
        engine,
        store,
        idp: Arc::new(DisabledIdp),
        pending: Arc::new(Mutex::new(HashMap::new())),
        rate_limiter: Arc::new(RateLimiter::new(10_000)),
        config: Arc::new(test_config()),
    }
}

pub fn test_config() -> delegation_auth::config::Config {
    delegation_auth::config::Config {
        jwt_secret: JWT_SECRET.into(),
        jwt_algorithm: "HS256".into(),
        access_token_ttl_minutes: 5,
        delegation_token_ttl_minutes: 10,
        auth_bind: "127.0.0.1:0".parse().unwrap(),
        resource_bind: "127.0.0.1:0".parse().unwrap(),
        management_bind: "127.0.0.1:0".parse().unwrap(),
        auth_server_url: "http://localhost:8080".into(),
        cors_origins: vec![],
        rate_limit_per_minute: 10_000,
        dpop_required: false,
        oidc_issuer_url: None,
        oidc_realm: None,
        oidc_client_id: None,
        oidc_client_secret: None,
        oidc_redirect_uri: None,
        log_level: "info".into(),
    }
}

pub fn auth_test_router(state: AuthState) -> Router {
    http::auth_router().merge(http::management_router()).with_state(state)
}

/// Resource-endpoint router wired against a stub introspection URL. Tests
/// that exercise `/data` spin up a real auth router on a loopback
/// listener first (see `resource_endpoint.rs`) and pass its address here.
pub fn resource_test_router(introspect_url: String, dpop_required: bool) -> Router {
    let state = ResourceState {
        http_client: reqwest::Client::new(),
        introspect_url,
        dpop_verifier: Arc::new(delegation_auth::dpop::DpopVerifier::new()),
        dpop_required,
    };
    http::resource_router().with_state(state)
}

pub async fn get_json(app: &Router, path: &str) -> (StatusCode, Value) {
    let req = Request::builder().method("GET").uri(path).body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

pub async fn get_json_bearer(app: &Router, path: &str, token: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .header("Authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

pub async fn post_json(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let mut req = Request::builder()
        .method("POST")
        .uri(path)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap();
    // `/token` keys its rate limiter off `ConnectInfo`, which `axum::serve`
    // only populates via `into_make_service_with_connect_info`; stand in
    // for that here since `oneshot` calls the router directly.
    req.extensions_mut().insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 0))));
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

pub async fn delete_json(app: &Router, path: &str) -> (StatusCode, Value) {
    let req = Request::builder().method("DELETE").uri(path).body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

async fn body_json(resp: axum::http::Response<Body>) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}
