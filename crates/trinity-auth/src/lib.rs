#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **trinity-auth** – Capability tokens and per-agent API keys.
//!
//! The platform authenticates inter-agent calls (§4.8) and control-plane
//! callers (§4.1) by a capability token carrying a [`KeyScope`]: either bound
//! to a single agent name, or the system scope, which bypasses authorization
//! entirely. This crate owns the token shape and the validator trait; the
//! composition root chooses a concrete [`TokenValidator`] implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trinity_types::AgentName;
use uuid::Uuid;

/// The authorization scope carried by a minted token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "agent")]
pub enum KeyScope {
    /// Bound to exactly one agent; authorization checks still apply.
    Agent(AgentName),
    /// The platform's own supervisory scope; bypasses `may_call`/ownership checks.
    System,
}

impl KeyScope {
    /// Whether this scope bypasses authorization checks entirely.
    pub fn is_system(&self) -> bool {
        matches!(self, Self::System)
    }
}

/// Canonical claim set carried by a Trinity capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Scope this token authorizes.
    pub scope: KeyScope,
    /// When the token was minted.
    pub issued_at: DateTime<Utc>,
    /// Absolute expiry; `None` means non-expiring (used for long-lived agent keys).
    pub expires_at: Option<DateTime<Utc>>,
    /// Unique token id, for audit and revocation.
    pub jti: Uuid,
}

impl Claims {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| now >= exp).unwrap_or(false)
    }
}

/// Errors produced while minting or validating tokens.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    /// The raw token string was not recognized.
    #[error("unknown token")]
    UnknownToken,
    /// The token has expired.
    #[error("token expired")]
    Expired,
    /// The token has been explicitly revoked.
    #[error("token revoked")]
    Revoked,
}

/// Behavior common to all concrete capability token formats.
#[async_trait]
pub trait CapabilityToken: Sized + Send + Sync {
    /// Mint a new token carrying `claims`.
    async fn mint(claims: Claims) -> Self;

    /// The serialized wire-format representation handed to callers.
    fn as_str(&self) -> &str;
}

/// Verification behavior shared across the platform.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Verify `raw` token authenticity and return its claims.
    async fn validate(&self, raw: &str) -> Result<Claims, AuthError>;
}

/// An opaque bearer token: a random identifier the issuing keystore maps back
/// to [`Claims`]. This is the reference format used by the in-memory
/// composition root; a production deployment would swap in a signed format
/// (e.g. JWT) implementing the same two traits.
#[derive(Debug, Clone)]
pub struct OpaqueToken(String);

#[async_trait]
impl CapabilityToken for OpaqueToken {
    async fn mint(_claims: Claims) -> Self {
        Self(format!("tok_{}", Uuid::new_v4().simple()))
    }

    fn as_str(&self) -> &str {
        &self.0
    }
}

/// In-memory keystore doubling as issuer and validator.
///
/// Grounded on the same "concurrent map guarded for writes" shape used for
/// revocation and permission state elsewhere in this repository: reads take
/// a shared lock, writes (mint/revoke) take an exclusive one scoped to the
/// whole table since key issuance is comparatively rare.
#[derive(Debug, Default)]
pub struct InMemoryKeyStore {
    tokens: RwLock<HashMap<String, (Claims, bool)>>,
}

impl InMemoryKeyStore {
    /// Construct an empty keystore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint and register a new agent-scoped key, bound to `agent`.
    pub async fn issue_agent_key(&self, agent: AgentName) -> String {
        self.issue(KeyScope::Agent(agent)).await
    }

    /// Mint and register a new system-scoped key.
    pub async fn issue_system_key(&self) -> String {
        self.issue(KeyScope::System).await
    }

    async fn issue(&self, scope: KeyScope) -> String {
        let claims = Claims {
            scope,
            issued_at: Utc::now(),
            expires_at: None,
            jti: Uuid::new_v4(),
        };
        let token = OpaqueToken::mint(claims.clone()).await;
        let raw = token.as_str().to_string();
        self.tokens
            .write()
            .expect("keystore lock poisoned")
            .insert(raw.clone(), (claims, true));
        raw
    }

    /// Revoke a previously issued token; subsequent `validate` calls fail.
    pub fn revoke(&self, raw: &str) {
        if let Some(entry) = self.tokens.write().expect("keystore lock poisoned").get_mut(raw) {
            entry.1 = false;
        }
    }
}

#[async_trait]
impl TokenValidator for InMemoryKeyStore {
    async fn validate(&self, raw: &str) -> Result<Claims, AuthError> {
        let table = self.tokens.read().expect("keystore lock poisoned");
        let (claims, active) = table.get(raw).ok_or(AuthError::UnknownToken)?;
        if !active {
            return Err(AuthError::Revoked);
        }
        if claims.is_expired(Utc::now()) {
            return Err(AuthError::Expired);
        }
        Ok(claims.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_agent_key_validates_to_same_scope() {
        let store = InMemoryKeyStore::new();
        let agent = AgentName::new("worker-01").unwrap();
        let raw = store.issue_agent_key(agent.clone()).await;

        let claims = store.validate(&raw).await.unwrap();
        assert_eq!(claims.scope, KeyScope::Agent(agent));
    }

    #[tokio::test]
    async fn system_key_bypasses() {
        let store = InMemoryKeyStore::new();
        let raw = store.issue_system_key().await;
        let claims = store.validate(&raw).await.unwrap();
        assert!(claims.scope.is_system());
    }

    #[tokio::test]
    async fn revoked_key_fails_validation() {
        let store = InMemoryKeyStore::new();
        let raw = store.issue_system_key().await;
        store.revoke(&raw);
        assert_eq!(store.validate(&raw).await.unwrap_err(), AuthError::Revoked);
    }

    #[tokio::test]
    async fn unknown_token_fails() {
        let store = InMemoryKeyStore::new();
        assert_eq!(
            store.validate("tok_nonexistent").await.unwrap_err(),
            AuthError::UnknownToken
        );
    }
}
