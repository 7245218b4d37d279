//! Pluggable identity provider seam. A real deployment plugs in an OIDC
//! adapter talking to Keycloak or another provider; this crate ships only
//! the trait plus two local implementations used by default and by
//! tests/dev, per the external-collaborator boundary drawn around
//! federated identity.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum IdpError {
    #[error("identity provider is disabled")]
    Disabled,
    #[error("invalid state")]
    InvalidState,
    #[error("invalid code")]
    InvalidCode,
}

/// One pending `/authorize` round-trip awaiting an IdP callback. PKCE
/// fields are carried here rather than encoded into `state`, so `state`
/// remains an opaque correlation id (see the PKCE-through-callback
/// decision in the design notes).
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub client_id: String,
    pub scope: Vec<String>,
    pub pkce_challenge: Option<String>,
    pub pkce_method: Option<crate::store::PkceMethod>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Whether this adapter actually redirects; when `false`, `/authorize`
    /// never produces a 302 and `/callback` is unreachable.
    fn enabled(&self) -> bool;

    /// Build the redirect URL for a fresh authorization round-trip,
    /// returning the opaque `state` value to persist alongside `pending`.
    fn authorization_url(&self, state: &str) -> Result<String, IdpError>;

    /// Exchange an authorization `code` for the federated subject
    /// (`sub`), given the `state` the IdP echoed back.
    async fn exchange_code(&self, state: &str, code: &str) -> Result<String, IdpError>;
}

/// Default adapter: IdP integration is off. `/authorize` always falls
/// through to direct delegation-token issuance.
pub struct DisabledIdp;

#[async_trait]
impl IdentityProvider for DisabledIdp {
    fn enabled(&self) -> bool {
        false
    }

    fn authorization_url(&self, _state: &str) -> Result<String, IdpError> {
        Err(IdpError::Disabled)
    }

    async fn exchange_code(&self, _state: &str, _code: &str) -> Result<String, IdpError> {
        Err(IdpError::Disabled)
    }
}

/// Deterministic local stand-in for a real OIDC provider, used to
/// exercise `/callback` and the PKCE-survives-the-round-trip behavior in
/// tests and local development without a live Keycloak instance. The
/// "authorization URL" is itself a localhost `/callback` link carrying a
/// fixed code; the "subject" is derived from the code.
pub struct LocalStubIdp {
    pub redirect_base: String,
}

#[async_trait]
impl IdentityProvider for LocalStubIdp {
    fn enabled(&self) -> bool {
        true
    }

    fn authorization_url(&self, state: &str) -> Result<String, IdpError> {
        Ok(format!("{}?code=stub-code&state={state}", self.redirect_base))
    }

    async fn exchange_code(&self, state: &str, code: &str) -> Result<String, IdpError> {
        if state.is_empty() {
            return Err(IdpError::InvalidState);
        }
        if code != "stub-code" {
            return Err(IdpError::InvalidCode);
        }
        Ok(format!("stub-subject-{state}"))
    }
}
