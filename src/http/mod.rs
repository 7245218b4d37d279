pub mod auth;
pub mod management;
pub mod resource;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::http::Method;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::engine::Engine;
use crate::idp::{IdentityProvider, PendingAuthorization};
use crate::rate_limit::RateLimiter;
use crate::store::Store;

/// Shared state for the Authorization Endpoint and the Management API.
/// Both listen from the same process (`authd`) and share one `Store`.
#[derive(Clone)]
pub struct AuthState {
    pub engine: Arc<Engine>,
    pub store: Arc<Store>,
    pub idp: Arc<dyn IdentityProvider>,
    pub pending: Arc<Mutex<HashMap<String, PendingAuthorization>>>,
    pub rate_limiter: Arc<RateLimiter>,
    pub config: Arc<Config>,
}

/// State for the Resource Endpoint (`resourced`), a separate process that
/// only knows how to verify bearer tokens against the Authorization
/// Endpoint's `/introspect` and (optionally) enforce DPoP.
#[derive(Clone)]
pub struct ResourceState {
    pub http_client: reqwest::Client,
    pub introspect_url: String,
    pub dpop_verifier: Arc<crate::dpop::DpopVerifier>,
    pub dpop_required: bool,
}

pub fn auth_router() -> Router<AuthState> {
    auth::router()
}

pub fn management_router() -> Router<AuthState> {
    management::router()
}

pub fn resource_router() -> Router<ResourceState> {
    resource::router()
}

/// CORS layer shared by both listeners, built from the configured origin
/// allowlist. An empty list permits any origin (useful for local dev),
/// mirroring the teacher's default-open CORS in the absence of explicit
/// configuration.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::PATCH])
        .allow_headers(tower_http::cors::Any);
    if origins.is_empty() {
        layer.allow_origin(tower_http::cors::Any)
    } else {
        let allowed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        layer.allow_origin(AllowOrigin::list(allowed))
    }
}

pub fn trace_layer() -> TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>> {
    TraceLayer::new_for_http()
}
