use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::Json;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ApiError;
use crate::store::{Agent, AgentFilter, AgentStatus, AgentUpdate, Delegation, DelegationFilter, DelegationStatus};

use super::AuthState;

pub fn router() -> Router<AuthState> {
    Router::new()
        .route("/api/agents", get(list_agents).post(create_agent))
        .route("/api/agents/{id}", get(get_agent).patch(update_agent).delete(delete_agent))
        .route("/api/delegations", get(list_delegations))
        .route("/api/delegations/{id}/approve", post(approve_delegation))
        .route("/api/delegations/{id}/deny", post(deny_delegation))
        .route("/api/delegations/{id}/revoke", post(revoke_delegation))
        .route("/api/tokens/active", get(list_active_tokens))
        .route("/api/tokens/revoke", post(revoke_token))
        .route("/api/status", get(status))
        .route("/api/logs", get(logs))
}

#[derive(Debug, Serialize)]
struct ListResponse<T: Serialize> {
    items: Vec<T>,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct ListAgentsParams {
    status: Option<String>,
    search: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListDelegationsParams {
    status: Option<String>,
    agent_id: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListLogsParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub scopes: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateAgentRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub scopes: Option<serde_json::Value>,
    pub status: Option<String>,
}

#[tracing::instrument(skip(state))]
async fn list_agents(State(state): State<AuthState>, Query(params): Query<ListAgentsParams>) -> Result<impl IntoResponse, ApiError> {
    let status = params.status.as_deref().map(str::parse::<AgentStatus>).transpose().map_err(|()| ApiError::Validation("invalid status".into()))?;
    let agents: Vec<Agent> = state.store.list_agents(AgentFilter { status, search: params.search.as_deref() });
    let total = agents.len();
    Ok(Json(ListResponse { items: agents, total }))
}

#[tracing::instrument(skip(state, body), err)]
async fn create_agent(State(state): State<AuthState>, Json(body): Json<CreateAgentRequest>) -> Result<impl IntoResponse, ApiError> {
    crate::validation::require_non_empty("name", &body.name)?;
    let scopes = crate::validation::parse_scopes(body.scopes.as_ref())?;
    let agent = state
        .store
        .create_agent(crate::store::NewAgent { id: body.id, name: body.name, description: body.description, scopes })
        .map_err(map_store_err)?;
    Ok((StatusCode::CREATED, Json(agent)))
}

#[tracing::instrument(skip(state))]
async fn get_agent(State(state): State<AuthState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let agent = state.store.get_agent(&id).ok_or(ApiError::AuthUnknownAgent)?;
    Ok(Json(agent))
}

#[tracing::instrument(skip(state, body), err)]
async fn update_agent(State(state): State<AuthState>, Path(id): Path<String>, Json(body): Json<UpdateAgentRequest>) -> Result<impl IntoResponse, ApiError> {
    let scopes = body.scopes.as_ref().map(|v| crate::validation::parse_scopes(Some(v))).transpose()?;
    let status = body.status.as_deref().map(str::parse::<AgentStatus>).transpose().map_err(|()| ApiError::Validation("invalid status".into()))?;
    let agent = state
        .store
        .update_agent(&id, AgentUpdate { name: body.name, description: body.description, scopes, status })
        .map_err(map_store_err)?;
    Ok(Json(agent))
}

#[tracing::instrument(skip(state))]
async fn delete_agent(State(state): State<AuthState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_agent(&id).map_err(map_store_err)?;
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(state))]
async fn list_delegations(
    State(state): State<AuthState>,
    Query(params): Query<ListDelegationsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<DelegationStatus>)
        .transpose()
        .map_err(|()| ApiError::Validation("invalid status".into()))?;
    let delegations: Vec<Delegation> = state.store.list_delegations(DelegationFilter {
        status,
        agent_id: params.agent_id.as_deref(),
        user_id: params.user_id.as_deref(),
    });
    let total = delegations.len();
    Ok(Json(ListResponse { items: delegations.into_iter().map(redact_delegation).collect::<Vec<_>>(), total }))
}

/// Truncate bearer tokens in list views; a full token is only ever
/// returned to the party that just minted it, never echoed back in a
/// listing.
fn redact_delegation(mut delegation: Delegation) -> Delegation {
    delegation.delegation_token = delegation.delegation_token.as_deref().map(token_fingerprint);
    delegation.access_token = delegation.access_token.as_deref().map(token_fingerprint);
    delegation
}

fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("sha256:{}", hex::encode(&digest[..8]))
}

#[tracing::instrument(skip(state))]
async fn approve_delegation(State(state): State<AuthState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let delegation = state.engine.approve(&id)?;
    Ok(Json(redact_delegation(delegation)))
}

#[tracing::instrument(skip(state))]
async fn deny_delegation(State(state): State<AuthState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let delegation = state.engine.deny(&id)?;
    Ok(Json(redact_delegation(delegation)))
}

#[tracing::instrument(skip(state))]
async fn revoke_delegation(State(state): State<AuthState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let delegation = state.engine.revoke_delegation(&id)?;
    Ok(Json(redact_delegation(delegation)))
}

#[derive(Debug, Serialize)]
struct ActiveTokenEntry {
    fingerprint: String,
}

#[tracing::instrument(skip(state))]
async fn list_active_tokens(State(state): State<AuthState>) -> impl IntoResponse {
    let tokens = state.store.list_active_tokens();
    let items: Vec<_> = tokens.iter().map(|t| ActiveTokenEntry { fingerprint: token_fingerprint(t) }).collect();
    let total = items.len();
    Json(ListResponse { items, total })
}

#[derive(Debug, Deserialize)]
struct RevokeTokenRequest {
    token: String,
}

#[tracing::instrument(skip(state, body))]
async fn revoke_token(State(state): State<AuthState>, Json(body): Json<RevokeTokenRequest>) -> impl IntoResponse {
    state.engine.revoke_token(&body.token);
    StatusCode::OK
}

#[tracing::instrument(skip(state))]
async fn status(State(state): State<AuthState>) -> impl IntoResponse {
    Json(state.store.stats())
}

#[tracing::instrument(skip(state))]
async fn logs(State(state): State<AuthState>, Query(params): Query<ListLogsParams>) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100);
    let items = state.store.get_activities(limit);
    let total = items.len();
    Json(ListResponse { items, total })
}

fn map_store_err(err: crate::store::StoreError) -> ApiError {
    use crate::store::StoreError;
    match err {
        StoreError::AgentNotFound | StoreError::UserNotFound | StoreError::DelegationNotFound => ApiError::AuthUnknownAgent,
        StoreError::AgentConflict | StoreError::UserConflict => ApiError::Conflict(err.to_string()),
        StoreError::NotPending => ApiError::DelegationNotApproved,
        StoreError::NotMintable => ApiError::DelegationNotApproved,
        StoreError::NotRevocable => ApiError::DelegationNotApproved,
        StoreError::SignError(_) => ApiError::Internal(anyhow::anyhow!(err)),
    }
}
