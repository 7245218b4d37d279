pub mod models;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use models::{
    ActivityEntry, Agent, AgentStatus, Delegation, DelegationStatus, PkceMethod, SystemStats, User,
};

const ACTIVITY_LOG_CAPACITY: usize = 1000;
const MAX_ACTIVITY_LISTING: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("agent not found")]
    AgentNotFound,
    #[error("agent already exists")]
    AgentConflict,
    #[error("user not found")]
    UserNotFound,
    #[error("user already exists")]
    UserConflict,
    #[error("delegation not found")]
    DelegationNotFound,
    #[error("only pending delegations can be approved")]
    NotPending,
    #[error("only approved delegations not expired or revoked can mint access tokens")]
    NotMintable,
    #[error("only pending or approved delegations can be revoked")]
    NotRevocable,
    #[error(transparent)]
    SignError(#[from] crate::signer::SignerError),
}

/// Parameters accepted at agent registration. `id` is auto-generated when
/// absent.
pub struct NewAgent {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub scopes: Vec<String>,
}

/// Mutable subset of agent fields `update_agent` may change.
#[derive(Default)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub status: Option<AgentStatus>,
}

pub struct AgentFilter<'a> {
    pub status: Option<AgentStatus>,
    pub search: Option<&'a str>,
}

pub struct DelegationFilter<'a> {
    pub status: Option<DelegationStatus>,
    pub agent_id: Option<&'a str>,
    pub user_id: Option<&'a str>,
}

pub struct NewDelegation {
    pub id: String,
    pub agent_id: String,
    pub user_id: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub pkce_challenge: Option<String>,
    pub pkce_method: Option<PkceMethod>,
}

struct StoreInner {
    agents: HashMap<String, Agent>,
    users: HashMap<String, User>,
    delegations: HashMap<String, Delegation>,
    active_tokens: HashMap<String, DateTime<Utc>>,
    revoked_tokens: HashSet<String>,
    activities: VecDeque<ActivityEntry>,
}

/// Process-wide, concurrency-safe in-memory persistence. All reads and
/// writes go through one logical lock; critical sections here never
/// perform network I/O, only pure computation and map/set mutation.
pub struct Store {
    inner: Mutex<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                agents: HashMap::new(),
                users: HashMap::new(),
                delegations: HashMap::new(),
                active_tokens: HashMap::new(),
                revoked_tokens: HashSet::new(),
                activities: VecDeque::new(),
            }),
        }
    }

    // -- Agents ----------------------------------------------------------

    pub fn create_agent(&self, new: NewAgent) -> Result<Agent, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = new.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if inner.agents.contains_key(&id) {
            return Err(StoreError::AgentConflict);
        }
        let agent = Agent {
            id: id.clone(),
            name: new.name,
            description: new.description.unwrap_or_default(),
            allowed_scopes: new.scopes,
            status: AgentStatus::Active,
            created_at: Utc::now(),
            last_used_at: None,
            delegation_count: 0,
        };
        inner.agents.insert(id, agent.clone());
        Ok(agent)
    }

    pub fn get_agent(&self, id: &str) -> Option<Agent> {
        self.inner.lock().unwrap().agents.get(id).cloned()
    }

    pub fn list_agents(&self, filter: AgentFilter<'_>) -> Vec<Agent> {
        let inner = self.inner.lock().unwrap();
        inner
            .agents
            .values()
            .filter(|a| filter.status.is_none_or(|s| a.status == s))
            .filter(|a| {
                filter.search.is_none_or(|needle| {
                    let needle = needle.to_lowercase();
                    a.name.to_lowercase().contains(&needle)
                        || a.description.to_lowercase().contains(&needle)
                })
            })
            .cloned()
            .collect()
    }

    pub fn update_agent(&self, id: &str, update: AgentUpdate) -> Result<Agent, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let agent = inner.agents.get_mut(id).ok_or(StoreError::AgentNotFound)?;
        if let Some(name) = update.name {
            agent.name = name;
        }
        if let Some(description) = update.description {
            agent.description = description;
        }
        if let Some(scopes) = update.scopes {
            agent.allowed_scopes = scopes;
        }
        if let Some(status) = update.status {
            agent.status = status;
        }
        Ok(agent.clone())
    }

    /// Delete an agent. Cascades: every one of its `approved` delegations
    /// is revoked (its tokens move into the revocation set) before the
    /// agent record disappears, all under the same lock acquisition.
    pub fn delete_agent(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.agents.contains_key(id) {
            return Err(StoreError::AgentNotFound);
        }
        let affected: Vec<String> = inner
            .delegations
            .values()
            .filter(|d| d.agent_id == id && d.status == DelegationStatus::Approved)
            .map(|d| d.id.clone())
            .collect();
        for delegation_id in affected {
            revoke_delegation_locked(&mut inner, &delegation_id)?;
        }
        inner.agents.remove(id);
        Ok(())
    }

    // -- Users -------------------------------------------------------------

    pub fn create_user(&self, username: String, secret_hash: String) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.users.contains_key(&username) {
            return Err(StoreError::UserConflict);
        }
        inner.users.insert(username.clone(), User { username, secret_hash });
        Ok(())
    }

    pub fn get_user(&self, username: &str) -> Option<User> {
        self.inner.lock().unwrap().users.get(username).cloned()
    }

    pub fn list_usernames(&self) -> Vec<String> {
        self.inner.lock().unwrap().users.keys().cloned().collect()
    }

    /// Validate a presented secret against the user's stored hash.
    /// `false` for an unknown user, matching `validate_user` in the
    /// original source.
    pub fn validate_user(&self, username: &str, secret: &str) -> bool {
        let Some(user) = self.get_user(username) else {
            return false;
        };
        crate::secret::verify(secret, &user.secret_hash)
    }

    // -- Delegations ---------------------------------------------------------

    pub fn create_delegation(&self, new: NewDelegation) -> Delegation {
        let mut inner = self.inner.lock().unwrap();
        let delegation = Delegation {
            id: new.id.clone(),
            agent_id: new.agent_id,
            user_id: new.user_id,
            scopes: new.scopes,
            status: DelegationStatus::Pending,
            created_at: Utc::now(),
            approved_at: None,
            expires_at: new.expires_at,
            revoked_at: None,
            delegation_token: None,
            access_token: None,
            pkce_challenge: new.pkce_challenge,
            pkce_method: new.pkce_method,
        };
        inner.delegations.insert(new.id, delegation.clone());
        delegation
    }

    pub fn get_delegation(&self, id: &str) -> Option<Delegation> {
        let mut inner = self.inner.lock().unwrap();
        lazy_expire_locked(&mut inner, id);
        inner.delegations.get(id).cloned()
    }

    pub fn list_delegations(&self, filter: DelegationFilter<'_>) -> Vec<Delegation> {
        let mut inner = self.inner.lock().unwrap();
        let ids: Vec<String> = inner.delegations.keys().cloned().collect();
        for id in &ids {
            lazy_expire_locked(&mut inner, id);
        }
        inner
            .delegations
            .values()
            .filter(|d| filter.status.is_none_or(|s| d.status == s))
            .filter(|d| filter.agent_id.is_none_or(|a| d.agent_id == a))
            .filter(|d| filter.user_id.is_none_or(|u| d.user_id == u))
            .cloned()
            .collect()
    }

    /// Approve a pending, unexpired delegation and atomically mint its
    /// delegation token. `mint` is given a read-only snapshot of the
    /// delegation and must produce the signed token string; it performs
    /// no I/O and is invoked while the lock is held.
    pub fn approve_delegation(
        &self,
        id: &str,
        mint: impl FnOnce(&Delegation) -> Result<String, crate::signer::SignerError>,
    ) -> Result<Delegation, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        lazy_expire_locked(&mut inner, id);
        let delegation = inner.delegations.get(id).ok_or(StoreError::DelegationNotFound)?;
        if delegation.status != DelegationStatus::Pending {
            return Err(StoreError::NotPending);
        }
        let token = mint(delegation)?;
        let now = Utc::now();
        let agent_id = delegation.agent_id.clone();
        let delegation = inner.delegations.get_mut(id).expect("checked above");
        delegation.status = DelegationStatus::Approved;
        delegation.approved_at = Some(now);
        delegation.delegation_token = Some(token);
        if let Some(agent) = inner.agents.get_mut(&agent_id) {
            agent.delegation_count += 1;
            agent.last_used_at = Some(now);
        }
        Ok(inner.delegations.get(id).expect("checked above").clone())
    }

    pub fn deny_delegation(&self, id: &str) -> Result<Delegation, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        lazy_expire_locked(&mut inner, id);
        let delegation = inner.delegations.get_mut(id).ok_or(StoreError::DelegationNotFound)?;
        if delegation.status != DelegationStatus::Pending {
            return Err(StoreError::NotPending);
        }
        delegation.status = DelegationStatus::Denied;
        Ok(delegation.clone())
    }

    /// Mint a fresh access token from an approved, unexpired, unrevoked
    /// delegation. Repeated calls are permitted; each produces a fresh
    /// token, and the active-token set tracks every one minted.
    pub fn mint_access(
        &self,
        id: &str,
        mint: impl FnOnce(&Delegation) -> Result<String, crate::signer::SignerError>,
        exp: DateTime<Utc>,
    ) -> Result<(Delegation, String), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        lazy_expire_locked(&mut inner, id);
        let delegation = inner.delegations.get(id).ok_or(StoreError::DelegationNotFound)?;
        if delegation.status != DelegationStatus::Approved {
            return Err(StoreError::NotMintable);
        }
        let token = mint(delegation)?;
        let delegation = inner.delegations.get_mut(id).expect("checked above");
        delegation.access_token = Some(token.clone());
        inner.active_tokens.insert(token.clone(), exp);
        let delegation = inner.delegations.get(id).expect("checked above").clone();
        Ok((delegation, token))
    }

    pub fn revoke_delegation(&self, id: &str) -> Result<Delegation, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        lazy_expire_locked(&mut inner, id);
        revoke_delegation_locked(&mut inner, id)
    }

    // -- Tokens --------------------------------------------------------------

    /// Mark an arbitrary token string revoked. Idempotent; always
    /// succeeds even for tokens the store has never seen, matching the
    /// spec's "always succeeds" contract for `/revoke`.
    pub fn revoke_token(&self, token: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.revoked_tokens.insert(token.to_owned());
    }

    pub fn is_token_revoked(&self, token: &str) -> bool {
        self.inner.lock().unwrap().revoked_tokens.contains(token)
    }

    /// Enumerate currently-active tokens, first pruning any whose
    /// recorded expiry has passed. Advisory only — never consulted for
    /// authorization decisions.
    pub fn list_active_tokens(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        inner.active_tokens.retain(|_, exp| *exp > now);
        inner.active_tokens.keys().cloned().collect()
    }

    // -- Activities ------------------------------------------------------

    pub fn log_activity(
        &self,
        action: impl Into<String>,
        details: serde_json::Value,
        user: Option<String>,
        agent_id: Option<String>,
        delegation_id: Option<String>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if inner.activities.len() >= ACTIVITY_LOG_CAPACITY {
            inner.activities.pop_front();
        }
        inner.activities.push_back(ActivityEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: action.into(),
            details,
            user,
            agent_id,
            delegation_id,
        });
    }

    pub fn get_activities(&self, limit: usize) -> Vec<ActivityEntry> {
        let limit = limit.min(MAX_ACTIVITY_LISTING);
        let inner = self.inner.lock().unwrap();
        inner.activities.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> SystemStats {
        let inner = self.inner.lock().unwrap();
        SystemStats {
            total_agents: inner.agents.len(),
            active_agents: inner.agents.values().filter(|a| a.status == AgentStatus::Active).count(),
            total_users: inner.users.len(),
            total_delegations: inner.delegations.len(),
            pending_delegations: inner
                .delegations
                .values()
                .filter(|d| d.status == DelegationStatus::Pending)
                .count(),
            approved_delegations: inner
                .delegations
                .values()
                .filter(|d| d.status == DelegationStatus::Approved)
                .count(),
            active_tokens: inner.active_tokens.len(),
            revoked_tokens: inner.revoked_tokens.len(),
        }
    }
}

/// Lazy `expire` transition: demote a delegation past its `expires_at`
/// to `Expired` before the caller proceeds, per the state machine.
fn lazy_expire_locked(inner: &mut StoreInner, id: &str) {
    let now = Utc::now();
    if let Some(delegation) = inner.delegations.get_mut(id)
        && matches!(delegation.status, DelegationStatus::Pending | DelegationStatus::Approved)
        && delegation.expires_at < now
    {
        delegation.status = DelegationStatus::Expired;
    }
}

fn revoke_delegation_locked(inner: &mut StoreInner, id: &str) -> Result<Delegation, StoreError> {
    let delegation = inner.delegations.get(id).ok_or(StoreError::DelegationNotFound)?;
    if !matches!(delegation.status, DelegationStatus::Pending | DelegationStatus::Approved) {
        return Err(StoreError::NotRevocable);
    }
    let delegation_token = delegation.delegation_token.clone();
    let access_token = delegation.access_token.clone();
    if let Some(token) = &delegation_token {
        inner.revoked_tokens.insert(token.clone());
    }
    if let Some(token) = &access_token {
        inner.revoked_tokens.insert(token.clone());
    }
    let delegation = inner.delegations.get_mut(id).expect("checked above");
    delegation.status = DelegationStatus::Revoked;
    delegation.revoked_at = Some(Utc::now());
    Ok(delegation.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(store: &Store) -> Agent {
        store
            .create_agent(NewAgent {
                id: Some("a1".into()),
                name: "A".into(),
                description: None,
                scopes: vec!["read:data".into()],
            })
            .unwrap()
    }

    #[test]
    fn duplicate_agent_conflicts() {
        let store = Store::new();
        agent(&store);
        let err = store.create_agent(NewAgent {
            id: Some("a1".into()),
            name: "dup".into(),
            description: None,
            scopes: vec![],
        });
        assert!(matches!(err, Err(StoreError::AgentConflict)));
    }

    #[test]
    fn approve_requires_pending() {
        let store = Store::new();
        agent(&store);
        let delegation = store.create_delegation(NewDelegation {
            id: "d1".into(),
            agent_id: "a1".into(),
            user_id: "alice".into(),
            scopes: vec!["read:data".into()],
            expires_at: Utc::now() + chrono::Duration::minutes(10),
            pkce_challenge: None,
            pkce_method: None,
        });
        assert_eq!(delegation.status, DelegationStatus::Pending);

        store.approve_delegation("d1", |_| Ok("tok".into())).unwrap();
        let err = store.approve_delegation("d1", |_| Ok("tok2".into()));
        assert!(matches!(err, Err(StoreError::NotPending)));
    }

    #[test]
    fn expired_delegation_cannot_mint() {
        let store = Store::new();
        agent(&store);
        store.create_delegation(NewDelegation {
            id: "d1".into(),
            agent_id: "a1".into(),
            user_id: "alice".into(),
            scopes: vec![],
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            pkce_challenge: None,
            pkce_method: None,
        });
        let err = store.mint_access("d1", |_| Ok("tok".into()), Utc::now());
        assert!(matches!(err, Err(StoreError::NotMintable)));
        assert_eq!(store.get_delegation("d1").unwrap().status, DelegationStatus::Expired);
    }

    #[test]
    fn delete_agent_cascades_revocation() {
        let store = Store::new();
        agent(&store);
        store.create_delegation(NewDelegation {
            id: "d1".into(),
            agent_id: "a1".into(),
            user_id: "alice".into(),
            scopes: vec![],
            expires_at: Utc::now() + chrono::Duration::minutes(10),
            pkce_challenge: None,
            pkce_method: None,
        });
        store.approve_delegation("d1", |_| Ok("deltok".into())).unwrap();
        let exp = Utc::now() + chrono::Duration::minutes(5);
        store.mint_access("d1", |_| Ok("acctok".into()), exp).unwrap();

        store.delete_agent("a1").unwrap();

        assert!(store.is_token_revoked("deltok"));
        assert!(store.is_token_revoked("acctok"));
        assert_eq!(store.get_delegation("d1").unwrap().status, DelegationStatus::Revoked);
        assert!(store.get_agent("a1").is_none());
    }

    #[test]
    fn activity_log_is_bounded() {
        let store = Store::new();
        for i in 0..(ACTIVITY_LOG_CAPACITY + 10) {
            store.log_activity(format!("event-{i}"), serde_json::json!({}), None, None, None);
        }
        let all = store.get_activities(usize::MAX.min(100));
        assert_eq!(all.len(), MAX_ACTIVITY_LISTING);
    }
}
