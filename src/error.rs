use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Unified API error. Every variant maps to the taxonomy name and HTTP
/// status from the error taxonomy; the name (not the Rust variant name)
/// is what crosses the wire in `{error, message, timestamp}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("unknown user")]
    AuthUnknownUser,

    #[error("unknown agent")]
    AuthUnknownAgent,

    #[error("scope denied")]
    ScopeDenied,

    #[error("token expired")]
    TokenExpired,

    #[error("token invalid")]
    TokenInvalid,

    #[error("token revoked")]
    TokenRevoked,

    #[error("pkce verifier required")]
    PkceRequired,

    #[error("pkce verifier mismatch")]
    PkceMismatch,

    #[error("delegation not approved")]
    DelegationNotApproved,

    #[error("delegation revoked")]
    DelegationRevoked,

    #[error("delegation expired")]
    DelegationExpired,

    #[error("dpop proof invalid")]
    DpopInvalid,

    #[error("dpop proof replayed")]
    DpopReplay,

    #[error("dpop proof stale")]
    DpopStale,

    #[error("missing or malformed authorization header")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("upstream introspection unavailable")]
    ServiceUnavailable,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl ApiError {
    /// The stable taxonomy name from the error handling design, distinct
    /// from the Rust variant name and from the human-readable message.
    fn taxonomy(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::AuthUnknownUser => "auth_unknown_user",
            Self::AuthUnknownAgent => "auth_unknown_agent",
            Self::ScopeDenied => "scope_denied",
            Self::TokenExpired => "token_expired",
            Self::TokenInvalid => "token_invalid",
            Self::TokenRevoked => "token_revoked",
            Self::PkceRequired => "pkce_required",
            Self::PkceMismatch => "pkce_mismatch",
            Self::DelegationNotApproved => "delegation_not_approved",
            Self::DelegationRevoked => "delegation_revoked",
            Self::DelegationExpired => "delegation_expired",
            Self::DpopInvalid => "dpop_invalid",
            Self::DpopReplay => "dpop_replay",
            Self::DpopStale => "dpop_stale",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::ServiceUnavailable => "service_unavailable",
            Self::RateLimited => "rate_limited",
            Self::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::AuthUnknownUser
            | Self::AuthUnknownAgent
            | Self::ScopeDenied
            | Self::TokenExpired
            | Self::TokenInvalid
            | Self::TokenRevoked
            | Self::PkceRequired
            | Self::PkceMismatch
            | Self::DelegationNotApproved
            | Self::DelegationRevoked
            | Self::DelegationExpired
            | Self::Forbidden => StatusCode::FORBIDDEN,
            Self::DpopInvalid | Self::DpopReplay | Self::DpopStale | Self::Unauthorized => {
                StatusCode::UNAUTHORIZED
            }
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Internal(err) = &self {
            tracing::error!(error = ?err, "internal error");
        }
        let status = self.status();
        let message = match &self {
            // Never leak underlying exception text for internal errors.
            Self::Internal(_) => "an internal error occurred".to_owned(),
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: self.taxonomy(),
            message,
            timestamp: chrono::Utc::now(),
        };
        (status, Json(body)).into_response()
    }
}
