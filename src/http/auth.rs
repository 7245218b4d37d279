use std::net::SocketAddr;

use axum::Router;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;
use crate::idp::PendingAuthorization;
use crate::store::{NewAgent, PkceMethod};
use crate::validation;

use super::AuthState;

pub fn router() -> Router<AuthState> {
    Router::new()
        .route("/register", post(register_agent))
        .route("/register_user", post(register_user))
        .route("/authorize", get(authorize))
        .route("/callback", get(callback))
        .route("/token", post(exchange))
        .route("/revoke", post(revoke))
        .route("/introspect", post(introspect))
        .route("/health", get(health))
}

// ---------------------------------------------------------------------------
// Request / response bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterAgentRequest {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub scopes: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct RegisterAgentResponse {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    pub username: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    pub user: Option<String>,
    pub client_id: String,
    pub scope: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    pub delegation_token: String,
    pub code_verifier: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub status: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct IntrospectRequest {
    pub token: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[tracing::instrument(skip(state, body), err)]
async fn register_agent(
    State(state): State<AuthState>,
    Json(body): Json<RegisterAgentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validation::require_non_empty("name", &body.name)?;
    let scopes = validation::parse_scopes(body.scopes.as_ref())?;
    let agent = state
        .store
        .create_agent(NewAgent { id: body.id, name: body.name, description: body.description, scopes })
        .map_err(map_conflict)?;
    Ok((StatusCode::CREATED, Json(RegisterAgentResponse { id: agent.id, name: agent.name })))
}

#[tracing::instrument(skip(state, body), err)]
async fn register_user(
    State(state): State<AuthState>,
    Json(body): Json<RegisterUserRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validation::require_non_empty("username", &body.username)?;
    validation::require_min_len("secret", &body.secret, 8)?;
    let hash = crate::secret::hash(&body.secret)?;
    state.store.create_user(body.username.clone(), hash).map_err(map_conflict)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "username": body.username }))))
}

/// Direct (non-IdP) path mints and auto-approves a delegation in one
/// round trip, since this surface has no separately reachable approve
/// step (see the `/authorize` synchronicity decision in DESIGN.md). When
/// an identity provider is enabled and no `user` is given, redirects to
/// it instead, parking PKCE/scope under the opaque `state` for
/// `/callback` to pick back up.
#[tracing::instrument(skip(state), fields(client_id = %params.client_id))]
async fn authorize(State(state): State<AuthState>, Query(params): Query<AuthorizeParams>) -> Result<axum::response::Response, ApiError> {
    if !state.rate_limiter.check(&params.client_id) {
        return Err(ApiError::RateLimited);
    }
    let scopes = validation::parse_scopes(params.scope.as_ref().map(|s| Value::String(s.clone())).as_ref())?;
    let pkce_method = params
        .code_challenge_method
        .as_deref()
        .map(|m| m.parse::<PkceMethod>().map_err(|()| ApiError::Validation("unsupported code_challenge_method".into())))
        .transpose()?;

    if let Some(user) = params.user {
        let delegation = state.engine.create_delegation(&params.client_id, &user, scopes, params.code_challenge, pkce_method)?;
        let delegation = state.engine.approve(&delegation.id)?;
        return Ok(delegation_token_body(&delegation).into_response());
    }

    if !state.idp.enabled() {
        return Err(ApiError::AuthUnknownUser);
    }
    let request_state = format!("{}-{}", uuid::Uuid::new_v4().simple(), &params.client_id);
    state.pending.lock().unwrap().insert(
        request_state.clone(),
        PendingAuthorization {
            client_id: params.client_id,
            scope: scopes,
            pkce_challenge: params.code_challenge,
            pkce_method,
        },
    );
    let redirect_url = state.idp.authorization_url(&request_state).map_err(|_| ApiError::ServiceUnavailable)?;
    Ok(Redirect::to(&redirect_url).into_response())
}

#[tracing::instrument(skip(state))]
async fn callback(State(state): State<AuthState>, Query(params): Query<CallbackParams>) -> Result<impl IntoResponse, ApiError> {
    let pending = state
        .pending
        .lock()
        .unwrap()
        .remove(&params.state)
        .ok_or_else(|| ApiError::Validation("invalid callback state".into()))?;

    let subject = state
        .idp
        .exchange_code(&params.state, &params.code)
        .await
        .map_err(|_| ApiError::Validation("invalid callback code".into()))?;

    if state.store.get_user(&subject).is_none() {
        state.store.create_user(subject.clone(), String::new()).map_err(map_conflict)?;
    }

    let delegation =
        state.engine.create_delegation(&pending.client_id, &subject, pending.scope, pending.pkce_challenge, pending.pkce_method)?;
    let delegation = state.engine.approve(&delegation.id)?;
    Ok(delegation_token_body(&delegation))
}

#[tracing::instrument(skip(state, body), err)]
async fn exchange(
    State(state): State<AuthState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ExchangeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.rate_limiter.check(&addr.ip().to_string()) {
        return Err(ApiError::RateLimited);
    }
    let (_, access_token) = state.engine.exchange(&body.delegation_token, body.code_verifier.as_deref())?;
    Ok(Json(TokenResponse { access_token, token_type: "Bearer" }))
}

#[tracing::instrument(skip(state, body))]
async fn revoke(State(state): State<AuthState>, Json(body): Json<RevokeRequest>) -> impl IntoResponse {
    state.engine.revoke_token(&body.token);
    Json(RevokeResponse { status: "revoked" })
}

#[tracing::instrument(skip(state, body))]
async fn introspect(State(state): State<AuthState>, Json(body): Json<IntrospectRequest>) -> impl IntoResponse {
    let result = state.engine.introspect(&body.token);
    if !result.active {
        return Json(serde_json::json!({ "active": false }));
    }
    let mut body = result.claims.unwrap_or_else(|| serde_json::json!({}));
    body["active"] = Value::Bool(true);
    Json(body)
}

async fn health() -> impl IntoResponse {
    StatusCode::OK
}

fn delegation_token_body(delegation: &crate::store::Delegation) -> Json<Value> {
    Json(serde_json::json!({ "delegation_token": delegation.delegation_token }))
}

fn map_conflict(err: crate::store::StoreError) -> ApiError {
    match err {
        crate::store::StoreError::AgentConflict | crate::store::StoreError::UserConflict => {
            ApiError::Conflict(err.to_string())
        }
        other => ApiError::Internal(anyhow::anyhow!(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delegation_token_body_serializes_token_field() {
        use chrono::Utc;

        let delegation = crate::store::Delegation {
            id: "d1".into(),
            agent_id: "a1".into(),
            user_id: "alice".into(),
            scopes: vec!["read:data".into()],
            status: crate::store::DelegationStatus::Approved,
            created_at: Utc::now(),
            approved_at: Some(Utc::now()),
            expires_at: Utc::now(),
            revoked_at: None,
            delegation_token: Some("tok".into()),
            access_token: None,
            pkce_challenge: None,
            pkce_method: None,
        };
        let Json(value) = delegation_token_body(&delegation);
        assert_eq!(value["delegation_token"], "tok");
    }
}
