//! Session registry: turns a successful PAKE login into a bearer token.
//!
//! A token is a capability only. It identifies the caller to the record
//! service and carries no key material.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use tracing::{debug, info};
use vault_core::{Identity, VaultError, VaultResult};

use crate::auth::SessionGrant;

/// Random 256-bit bearer token.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionToken([REDACTED])")
    }
}

#[derive(Debug, Clone)]
struct Session {
    identity: Identity,
    expires_at: u64,
}

#[derive(Debug)]
pub struct SessionRegistry {
    ttl: Duration,
    sessions: RwLock<HashMap<SessionToken, Session>>,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Issue a token for a fresh login.
    pub fn issue(&self, grant: &SessionGrant) -> VaultResult<SessionToken> {
        let token = SessionToken::generate();
        let session = Session {
            identity: grant.identity.clone(),
            expires_at: grant.granted_at + self.ttl.as_secs(),
        };
        self.sessions
            .write()
            .map_err(|_| poisoned())?
            .insert(token.clone(), session);
        debug!(identity = %grant.identity, "session issued");
        Ok(token)
    }

    /// Resolve a token to its identity. Unknown and expired tokens fail
    /// identically.
    pub fn authenticate(&self, token: &SessionToken) -> VaultResult<Identity> {
        let now = vault_core::now_epoch();
        let sessions = self.sessions.read().map_err(|_| poisoned())?;
        match sessions.get(token) {
            Some(session) if now < session.expires_at => Ok(session.identity.clone()),
            _ => Err(VaultError::AuthenticationFailure),
        }
    }

    /// Logout. Returns whether the token was live.
    pub fn revoke(&self, token: &SessionToken) -> VaultResult<bool> {
        Ok(self
            .sessions
            .write()
            .map_err(|_| poisoned())?
            .remove(token)
            .is_some())
    }

    /// Drop every session held by `identity`.
    pub fn revoke_identity(&self, identity: &Identity) -> VaultResult<usize> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        let before = sessions.len();
        sessions.retain(|_, s| &s.identity != identity);
        let removed = before - sessions.len();
        if removed > 0 {
            info!(%identity, removed, "sessions revoked");
        }
        Ok(removed)
    }

    pub fn purge_expired(&self, now: u64) -> VaultResult<usize> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned())?;
        let before = sessions.len();
        sessions.retain(|_, s| now < s.expires_at);
        Ok(before - sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> VaultError {
    VaultError::TransientStoreFailure("session registry lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(email: &str, granted_at: u64) -> SessionGrant {
        SessionGrant {
            identity: Identity::user(email),
            granted_at,
        }
    }

    #[test]
    fn test_issue_and_authenticate() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let token = registry.issue(&grant("alice@example.com", vault_core::now_epoch())).unwrap();

        assert_eq!(
            registry.authenticate(&token).unwrap(),
            Identity::user("alice@example.com")
        );
    }

    #[test]
    fn test_tokens_are_unique() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let g = grant("alice@example.com", vault_core::now_epoch());
        let a = registry.issue(&g).unwrap();
        let b = registry.issue(&g).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_expired_token_rejected() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let token = registry.issue(&grant("alice@example.com", 1_000)).unwrap();

        assert!(matches!(
            registry.authenticate(&token),
            Err(VaultError::AuthenticationFailure)
        ));
        assert_eq!(registry.purge_expired(vault_core::now_epoch()).unwrap(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_revoke() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let now = vault_core::now_epoch();
        let token = registry.issue(&grant("alice@example.com", now)).unwrap();
        let other = registry.issue(&grant("bob@example.com", now)).unwrap();

        assert!(registry.revoke(&token).unwrap());
        assert!(!registry.revoke(&token).unwrap());
        assert!(registry.authenticate(&token).is_err());
        assert!(registry.authenticate(&other).is_ok());
    }

    #[test]
    fn test_revoke_identity() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let now = vault_core::now_epoch();
        registry.issue(&grant("alice@example.com", now)).unwrap();
        registry.issue(&grant("alice@example.com", now)).unwrap();
        let bob = registry.issue(&grant("bob@example.com", now)).unwrap();

        assert_eq!(
            registry
                .revoke_identity(&Identity::user("alice@example.com"))
                .unwrap(),
            2
        );
        assert!(registry.authenticate(&bob).is_ok());
    }

    #[test]
    fn test_debug_redacts_token() {
        let registry = SessionRegistry::new(Duration::from_secs(60));
        let token = registry.issue(&grant("alice@example.com", 0)).unwrap();
        assert!(!format!("{token:?}").contains(token.as_str()));
    }
}
