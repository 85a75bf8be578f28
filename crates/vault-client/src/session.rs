//! Unlocked vault session.
//!
//! Holds the only in-memory copy of the master key. The key has no byte
//! accessor; the session can only hand it to the crypto worker.

use std::sync::Arc;

use vault_core::{Identity, VaultError, VaultResult};
use vault_crypto::WrappingKey;
use vault_server::SessionToken;

pub struct VaultSession {
    identity: Identity,
    token: SessionToken,
    master: Option<Arc<WrappingKey>>,
}

impl VaultSession {
    pub(crate) fn new(identity: Identity, token: SessionToken, master: WrappingKey) -> Self {
        Self {
            identity,
            token,
            master: Some(Arc::new(master)),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn is_locked(&self) -> bool {
        self.master.is_none()
    }

    /// Drop the master key. It is zeroized as soon as no in-flight crypto
    /// job still holds it; the session stays usable for listing only.
    pub fn lock(&mut self) {
        if self.master.take().is_some() {
            tracing::debug!(identity = %self.identity, "vault session locked");
        }
    }

    pub(crate) fn master(&self) -> VaultResult<Arc<WrappingKey>> {
        self.master
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| VaultError::InvalidInput("vault session is locked".into()))
    }

    /// Continue under the token and master key issued by a password
    /// rotation. The old token is already revoked.
    pub(crate) fn rotated(&mut self, token: SessionToken, master: Arc<WrappingKey>) {
        self.token = token;
        self.master = Some(master);
    }
}

impl std::fmt::Debug for VaultSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultSession")
            .field("identity", &self.identity)
            .field("locked", &self.is_locked())
            .finish()
    }
}
