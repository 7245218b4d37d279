use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, Header, Host, authorization::Bearer};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;

use super::ResourceState;

pub fn router() -> Router<ResourceState> {
    Router::new().route("/data", get(data))
}

/// The `DPoP` request header, carrying the caller's proof-of-possession
/// token. Grounded on the resource endpoint reading a dedicated `DPoP`
/// header alongside `Authorization: Bearer`.
static DPOP_HEADER_NAME: axum::http::HeaderName = axum::http::HeaderName::from_static("dpop");

struct DpopProof(String);

impl Header for DpopProof {
    fn name() -> &'static axum::http::HeaderName {
        &DPOP_HEADER_NAME
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, axum_extra::headers::Error>
    where
        I: Iterator<Item = &'i axum::http::HeaderValue>,
    {
        let value = values.next().ok_or_else(axum_extra::headers::Error::invalid)?;
        let value = value.to_str().map_err(|_| axum_extra::headers::Error::invalid())?;
        Ok(Self(value.to_owned()))
    }

    fn encode<E: Extend<axum::http::HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = axum::http::HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

#[derive(Debug, Deserialize)]
struct IntrospectResponse {
    active: bool,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    scope: Option<Vec<String>>,
}

#[tracing::instrument(skip(state, headers, bearer, dpop))]
async fn data(
    State(state): State<ResourceState>,
    uri: Uri,
    headers: HeaderMap,
    TypedHeader(host): TypedHeader<Host>,
    TypedHeader(bearer): TypedHeader<Authorization<Bearer>>,
    dpop: Option<TypedHeader<DpopProof>>,
) -> Result<impl IntoResponse, ApiError> {
    let token = bearer.token();

    if state.dpop_required {
        let TypedHeader(DpopProof(proof)) = dpop.ok_or(ApiError::DpopInvalid)?;
        // `htu` binds to the real absolute URL, the way the original
        // resource server compares against `request.base_url`: scheme
        // (honoring a reverse proxy's `X-Forwarded-Proto`) plus the
        // request's actual `Host` header and path, not a fixed literal.
        let scheme = headers.get("x-forwarded-proto").and_then(|v| v.to_str().ok()).unwrap_or("http");
        let url = format!("{scheme}://{host}{}", uri.path());
        state.dpop_verifier.verify(&proof, "GET", &url).map_err(map_dpop_err)?;
    }

    let response = state
        .http_client
        .post(&state.introspect_url)
        .json(&serde_json::json!({ "token": token }))
        .timeout(std::time::Duration::from_secs(2))
        .send()
        .await
        .map_err(|_| ApiError::ServiceUnavailable)?;

    let body: IntrospectResponse = response.json().await.map_err(|_| ApiError::ServiceUnavailable)?;

    if !body.active {
        return Err(ApiError::Forbidden);
    }

    let payload: Value = serde_json::json!({
        "user": body.sub,
        "agent": body.actor,
        "scope": body.scope.unwrap_or_default(),
    });
    Ok((StatusCode::OK, Json(payload)))
}

fn map_dpop_err(err: crate::dpop::DpopError) -> ApiError {
    match err {
        crate::dpop::DpopError::Invalid => ApiError::DpopInvalid,
        crate::dpop::DpopError::Replay => ApiError::DpopReplay,
        crate::dpop::DpopError::Stale => ApiError::DpopStale,
    }
}
