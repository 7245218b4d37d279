use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::ApiError;
use crate::pkce;
use crate::signer::{Signer, SignerError};
use crate::store::{
    AgentStatus, Delegation, DelegationStatus, NewDelegation, PkceMethod, Store, StoreError,
};

pub struct EngineConfig {
    pub issuer: String,
    pub delegation_ttl: Duration,
    pub access_ttl: Duration,
}

/// Orchestrates the delegation lifecycle: create, approve/deny, mint
/// access tokens, revoke. The only component permitted to mutate
/// delegation status, delegated to the Store's atomic operations for
/// the actual state transitions.
pub struct Engine {
    store: Arc<Store>,
    signer: Arc<Signer>,
    config: EngineConfig,
}

pub struct IntrospectResult {
    pub active: bool,
    pub claims: Option<Value>,
}

impl Engine {
    pub fn new(store: Arc<Store>, signer: Arc<Signer>, config: EngineConfig) -> Self {
        Self { store, signer, config }
    }

    #[tracing::instrument(skip(self, scopes), fields(%agent_id, %user_id))]
    pub fn create_delegation(
        &self,
        agent_id: &str,
        user_id: &str,
        scopes: Vec<String>,
        pkce_challenge: Option<String>,
        pkce_method: Option<PkceMethod>,
    ) -> Result<Delegation, ApiError> {
        let agent = self.store.get_agent(agent_id).ok_or(ApiError::AuthUnknownAgent)?;
        if agent.status != AgentStatus::Active {
            return Err(ApiError::AuthUnknownAgent);
        }
        if self.store.get_user(user_id).is_none() {
            return Err(ApiError::AuthUnknownUser);
        }
        if !agent.allowed_scopes.is_empty() && scopes.iter().any(|s| !agent.allowed_scopes.contains(s)) {
            return Err(ApiError::ScopeDenied);
        }

        let delegation = self.store.create_delegation(NewDelegation {
            id: format!("del-{}", Uuid::new_v4().simple()),
            agent_id: agent_id.to_owned(),
            user_id: user_id.to_owned(),
            scopes,
            expires_at: Utc::now() + self.config.delegation_ttl,
            pkce_challenge,
            pkce_method,
        });
        self.store.log_activity(
            "delegation_created",
            json!({ "delegation_id": delegation.id }),
            Some(user_id.to_owned()),
            Some(agent_id.to_owned()),
            Some(delegation.id.clone()),
        );
        Ok(delegation)
    }

    /// Approve a pending delegation and atomically mint its delegation
    /// token.
    #[tracing::instrument(skip(self), fields(%delegation_id))]
    pub fn approve(&self, delegation_id: &str) -> Result<Delegation, ApiError> {
        let signer = Arc::clone(&self.signer);
        let issuer = self.config.issuer.clone();
        let delegation = self
            .store
            .approve_delegation(delegation_id, |d| sign_delegation_token(&signer, &issuer, d))
            .map_err(map_store_err)?;
        self.store.log_activity(
            "delegation_approved",
            json!({ "delegation_id": delegation_id }),
            None,
            Some(delegation.agent_id.clone()),
            Some(delegation_id.to_owned()),
        );
        Ok(delegation)
    }

    #[tracing::instrument(skip(self), fields(%delegation_id))]
    pub fn deny(&self, delegation_id: &str) -> Result<Delegation, ApiError> {
        let delegation = self.store.deny_delegation(delegation_id).map_err(map_store_err)?;
        self.store.log_activity(
            "delegation_denied",
            json!({ "delegation_id": delegation_id }),
            None,
            None,
            Some(delegation_id.to_owned()),
        );
        Ok(delegation)
    }

    /// Exchange a signed delegation token (plus optional PKCE verifier)
    /// for a fresh access token.
    #[tracing::instrument(skip(self, delegation_token, code_verifier))]
    pub fn exchange(
        &self,
        delegation_token: &str,
        code_verifier: Option<&str>,
    ) -> Result<(Delegation, String), ApiError> {
        let claims = self.signer.verify(delegation_token).map_err(map_signer_err)?;
        let delegation_id = claims.get("delegation_id").and_then(Value::as_str).ok_or(ApiError::TokenInvalid)?;
        let delegation = self.store.get_delegation(delegation_id).ok_or(ApiError::TokenInvalid)?;

        if self.store.is_token_revoked(delegation_token) {
            return Err(ApiError::TokenRevoked);
        }
        match delegation.status {
            DelegationStatus::Approved => {}
            DelegationStatus::Revoked => return Err(ApiError::DelegationRevoked),
            DelegationStatus::Expired => return Err(ApiError::DelegationExpired),
            DelegationStatus::Pending | DelegationStatus::Denied => return Err(ApiError::DelegationNotApproved),
        }

        pkce::verify(delegation.pkce_challenge.as_deref(), delegation.pkce_method, code_verifier)
            .map_err(map_pkce_err)?;

        let signer = Arc::clone(&self.signer);
        let issuer = self.config.issuer.clone();
        let exp = std::cmp::min(Utc::now() + self.config.access_ttl, delegation.expires_at);
        let (delegation, token) = self
            .store
            .mint_access(delegation_id, |d| sign_access_token(&signer, &issuer, d, exp), exp)
            .map_err(map_store_err)?;

        self.store.log_activity(
            "access_token_minted",
            json!({ "delegation_id": delegation.id }),
            Some(delegation.user_id.clone()),
            Some(delegation.agent_id.clone()),
            Some(delegation.id.clone()),
        );
        Ok((delegation, token))
    }

    /// Revoke a raw token string. Idempotent, always succeeds.
    pub fn revoke_token(&self, token: &str) {
        self.store.revoke_token(token);
        self.store.log_activity("token_revoked", json!({}), None, None, None);
    }

    /// Revoke a delegation by id: moves it and its tokens into the
    /// revocation set.
    #[tracing::instrument(skip(self), fields(%delegation_id))]
    pub fn revoke_delegation(&self, delegation_id: &str) -> Result<Delegation, ApiError> {
        let delegation = self.store.revoke_delegation(delegation_id).map_err(map_store_err)?;
        self.store.log_activity(
            "delegation_revoked",
            json!({ "delegation_id": delegation_id }),
            None,
            Some(delegation.agent_id.clone()),
            Some(delegation_id.to_owned()),
        );
        Ok(delegation)
    }

    /// A token is active iff: signature verifies; not expired; not in
    /// the revocation set; its delegation currently resolves to
    /// `approved`. Forged or tampered tokens never error here — they
    /// simply introspect inactive.
    pub fn introspect(&self, token: &str) -> IntrospectResult {
        let Ok(claims) = self.signer.verify(token) else {
            return IntrospectResult { active: false, claims: None };
        };
        if self.store.is_token_revoked(token) {
            return IntrospectResult { active: false, claims: None };
        }
        let Some(delegation_id) = claims.get("delegation_id").and_then(Value::as_str) else {
            return IntrospectResult { active: false, claims: None };
        };
        let Some(delegation) = self.store.get_delegation(delegation_id) else {
            return IntrospectResult { active: false, claims: None };
        };
        if delegation.status != DelegationStatus::Approved {
            return IntrospectResult { active: false, claims: None };
        }
        IntrospectResult { active: true, claims: Some(claims) }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

fn sign_delegation_token(signer: &Signer, issuer: &str, d: &Delegation) -> Result<String, SignerError> {
    let claims = json!({
        "iss": issuer,
        "sub": d.agent_id,
        "delegator": d.user_id,
        "scope": d.scopes,
        "exp": d.expires_at.timestamp(),
        "iat": Utc::now().timestamp(),
        "jti": format!("del-jti-{}", Uuid::new_v4().simple()),
        "delegation_id": d.id,
        "code_challenge": d.pkce_challenge,
        "code_challenge_method": d.pkce_method.map(PkceMethod::as_str),
    });
    signer.sign(&claims)
}

fn sign_access_token(
    signer: &Signer,
    issuer: &str,
    d: &Delegation,
    exp: chrono::DateTime<Utc>,
) -> Result<String, SignerError> {
    let claims = json!({
        "iss": issuer,
        "sub": d.user_id,
        "actor": d.agent_id,
        "scope": d.scopes,
        "exp": exp.timestamp(),
        "iat": Utc::now().timestamp(),
        "jti": format!("acc-jti-{}", Uuid::new_v4().simple()),
        "delegation_id": d.id,
    });
    signer.sign(&claims)
}

fn map_store_err(err: StoreError) -> ApiError {
    match err {
        StoreError::DelegationNotFound | StoreError::AgentNotFound | StoreError::UserNotFound => {
            ApiError::Validation("not found".into())
        }
        StoreError::AgentConflict | StoreError::UserConflict => ApiError::Conflict("already exists".into()),
        StoreError::NotPending | StoreError::NotMintable => ApiError::DelegationNotApproved,
        StoreError::NotRevocable => ApiError::DelegationRevoked,
        StoreError::SignError(e) => map_signer_err(e),
    }
}

fn map_signer_err(err: SignerError) -> ApiError {
    match err {
        SignerError::Expired => ApiError::TokenExpired,
        SignerError::BadSignature | SignerError::Malformed | SignerError::WrongAlg | SignerError::MissingClaims => {
            ApiError::TokenInvalid
        }
    }
}

fn map_pkce_err(err: pkce::PkceError) -> ApiError {
    match err {
        pkce::PkceError::Required => ApiError::PkceRequired,
        pkce::PkceError::Mismatch => ApiError::PkceMismatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewAgent;

    fn engine() -> Engine {
        let store = Arc::new(Store::new());
        let signer = Arc::new(Signer::new(b"a-very-secret-signing-key-of-32b".to_vec()));
        Engine::new(
            store,
            signer,
            EngineConfig {
                issuer: "https://auth.example".into(),
                delegation_ttl: Duration::minutes(10),
                access_ttl: Duration::minutes(5),
            },
        )
    }

    fn register(engine: &Engine) {
        engine
            .store()
            .create_agent(NewAgent {
                id: Some("a1".into()),
                name: "A".into(),
                description: None,
                scopes: vec!["read:data".into()],
            })
            .unwrap();
        engine.store().create_user("alice".into(), "hash".into()).unwrap();
    }

    #[test]
    fn happy_path_mints_access_token() {
        let engine = engine();
        register(&engine);
        let delegation = engine
            .create_delegation("a1", "alice", vec!["read:data".into()], None, None)
            .unwrap();
        let delegation = engine.approve(&delegation.id).unwrap();
        let (_, access_token) = engine.exchange(&delegation.delegation_token.unwrap(), None).unwrap();
        let result = engine.introspect(&access_token);
        assert!(result.active);
        assert_eq!(result.claims.unwrap()["actor"], "a1");
    }

    #[test]
    fn scope_outside_allowed_scopes_is_denied() {
        let engine = engine();
        register(&engine);
        let err = engine.create_delegation("a1", "alice", vec!["write:data".into()], None, None);
        assert!(matches!(err, Err(ApiError::ScopeDenied)));
    }

    #[test]
    fn revocation_propagates_to_introspection() {
        let engine = engine();
        register(&engine);
        let delegation = engine.create_delegation("a1", "alice", vec!["read:data".into()], None, None).unwrap();
        let delegation = engine.approve(&delegation.id).unwrap();
        let (_, access_token) = engine.exchange(&delegation.delegation_token.unwrap(), None).unwrap();

        engine.revoke_token(&access_token);

        assert!(!engine.introspect(&access_token).active);
    }

    #[test]
    fn agent_deletion_cascades_to_inactive_tokens() {
        let engine = engine();
        register(&engine);
        let delegation = engine.create_delegation("a1", "alice", vec!["read:data".into()], None, None).unwrap();
        let delegation = engine.approve(&delegation.id).unwrap();
        let (_, access_token) = engine.exchange(&delegation.delegation_token.unwrap(), None).unwrap();

        engine.store().delete_agent("a1").unwrap();

        assert!(!engine.introspect(&access_token).active);
    }

    #[test]
    fn double_approval_rejected() {
        let engine = engine();
        register(&engine);
        let delegation = engine.create_delegation("a1", "alice", vec!["read:data".into()], None, None).unwrap();
        let first = engine.approve(&delegation.id).unwrap();
        let err = engine.approve(&delegation.id);
        assert!(matches!(err, Err(ApiError::DelegationNotApproved)));
        // The first approval's token remains canonical.
        assert_eq!(
            engine.store().get_delegation(&delegation.id).unwrap().delegation_token,
            first.delegation_token
        );
    }

    #[test]
    fn pkce_mismatch_rejects_exchange() {
        let engine = engine();
        register(&engine);
        let challenge = pkce::challenge_from_verifier("correct-verifier-aaaaaaaaaaaaaaaa");
        let delegation = engine
            .create_delegation(
                "a1",
                "alice",
                vec!["read:data".into()],
                Some(challenge),
                Some(PkceMethod::S256),
            )
            .unwrap();
        let delegation = engine.approve(&delegation.id).unwrap();
        let token = delegation.delegation_token.unwrap();

        let err = engine.exchange(&token, Some("wrong-verifier"));
        assert!(matches!(err, Err(ApiError::PkceMismatch)));

        let ok = engine.exchange(&token, Some("correct-verifier-aaaaaaaaaaaaaaaa"));
        assert!(ok.is_ok());
    }

    #[test]
    fn algorithm_confusion_introspects_inactive() {
        let engine = engine();
        register(&engine);
        let delegation = engine.create_delegation("a1", "alice", vec!["read:data".into()], None, None).unwrap();
        engine.approve(&delegation.id).unwrap();

        let forged = crate::signer::forge_with_alg(
            "none",
            &json!({
                "iss": "https://auth.example",
                "sub": "alice",
                "actor": "a1",
                "scope": ["read:data"],
                "exp": (Utc::now() + Duration::minutes(5)).timestamp(),
                "iat": Utc::now().timestamp(),
                "jti": "forged",
                "delegation_id": delegation.id,
            }),
        );
        assert!(!engine.introspect(&forged).active);
    }
}
