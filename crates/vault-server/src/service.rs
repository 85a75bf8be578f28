//! Record service: the server facade clients talk to.
//!
//! Combines the auth service, the session registry, the record store and
//! the blob store. Every file or share operation is authorized by a session
//! token; a file that exists but belongs to someone else is reported as
//! not found.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use vault_core::config::ServerConfig;
use vault_core::{
    now_epoch, Algorithm, FileId, FileRecord, Identity, KsfParams, ShareId, ShareRecord,
    VaultError, VaultResult, WrappedKey,
};
use vault_crypto::ServerSetup;
use vault_store::{BlobStore, RecordStore, TxOp};

use crate::auth::{AuthService, PakeResponse, SessionGrant};
use crate::cleanup::CleanupStats;
use crate::sessions::{SessionRegistry, SessionToken};

/// An encrypted upload. The client picks `file_id` because the ciphertext
/// and wrapped key are already bound to it.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub file_id: FileId,
    pub file_name: String,
    pub file_size: u64,
    pub ciphertext: Vec<u8>,
    pub content_nonce: Vec<u8>,
    pub algorithm: Algorithm,
    pub wrapped: WrappedKey,
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub record: FileRecord,
    pub ciphertext: Vec<u8>,
}

/// One file's new wrapped key in a rotation.
#[derive(Debug, Clone)]
pub struct RewrappedKey {
    pub file_id: FileId,
    /// Wrap nonce observed when the rotation plan was built
    pub expected_nonce: Vec<u8>,
    pub wrapped: WrappedKey,
}

/// Everything a password rotation replaces, committed as one transaction.
#[derive(Debug, Clone)]
pub struct RotationCommit {
    /// Login finish message proving the current password, built from a
    /// fresh `login_start`. Consumed by the commit.
    pub password_proof: Vec<u8>,
    /// RegistrationUpload for the new password
    pub upload: Vec<u8>,
    pub ksf: KsfParams,
    pub rewrapped: Vec<RewrappedKey>,
}

#[derive(Debug, Clone)]
pub struct NewShare {
    pub share_id: ShareId,
    pub file_id: FileId,
    /// RegistrationUpload for the share password
    pub upload: Vec<u8>,
    pub ksf: KsfParams,
    /// File key wrapped under the share key
    pub wrapped: WrappedKey,
}

pub struct VaultServer<S> {
    auth: AuthService<S>,
    sessions: SessionRegistry,
    store: Arc<S>,
    blobs: BlobStore,
    rotation_timeout: Duration,
}

impl<S: RecordStore> VaultServer<S> {
    pub fn new(
        config: &ServerConfig,
        default_ksf: KsfParams,
        setup: ServerSetup,
        store: Arc<S>,
        blobs: BlobStore,
    ) -> Self {
        let auth = AuthService::new(
            Arc::clone(&store),
            Arc::new(setup),
            config.login_state_ttl(),
            default_ksf,
        );
        Self {
            auth,
            sessions: SessionRegistry::new(config.session_ttl()),
            store,
            blobs,
            rotation_timeout: config.rotation_timeout(),
        }
    }

    /// Earlier KSF defaults still held by older registrations.
    pub fn with_legacy_ksf(mut self, legacy: Vec<KsfParams>) -> Self {
        self.auth = self.auth.with_legacy_ksf(legacy);
        self
    }

    pub fn auth(&self) -> &AuthService<S> {
        &self.auth
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    // ── Authentication ───────────────────────────────────────────────────

    pub fn register_start(&self, identity: &Identity, request: &[u8]) -> VaultResult<PakeResponse> {
        if identity.is_share() {
            return Err(VaultError::InvalidInput(
                "share identities are registered by their owner".into(),
            ));
        }
        self.auth.registration_start(identity, request)
    }

    pub async fn register_finish(
        &self,
        identity: &Identity,
        upload: &[u8],
        ksf: KsfParams,
    ) -> VaultResult<()> {
        if identity.is_share() {
            return Err(VaultError::InvalidInput(
                "share identities are registered by their owner".into(),
            ));
        }
        self.auth.registration_finish(identity, upload, ksf).await
    }

    pub async fn login_start(&self, identity: &Identity, request: &[u8]) -> VaultResult<PakeResponse> {
        self.auth.login_start(identity, request).await
    }

    /// Finish a login and issue a session token for the grant.
    pub async fn login_finish(
        &self,
        identity: &Identity,
        finish_request: &[u8],
    ) -> VaultResult<(SessionToken, SessionGrant)> {
        let grant = self.auth.login_finish(identity, finish_request).await?;
        let token = self.sessions.issue(&grant)?;
        Ok((token, grant))
    }

    pub fn logout(&self, token: &SessionToken) -> VaultResult<()> {
        self.sessions.revoke(token)?;
        Ok(())
    }

    fn user_session(&self, token: &SessionToken) -> VaultResult<Identity> {
        let identity = self.sessions.authenticate(token)?;
        if identity.is_share() {
            return Err(VaultError::InvalidInput(
                "share sessions can only open their share".into(),
            ));
        }
        Ok(identity)
    }

    // ── Files ────────────────────────────────────────────────────────────

    /// Store ciphertext, then its record. If the record commit fails the
    /// blob is removed again.
    pub async fn put_file(&self, token: &SessionToken, file: NewFile) -> VaultResult<FileRecord> {
        let owner = self.user_session(token)?;
        let storage_path = BlobStore::path_for(&file.file_id);
        let record = FileRecord {
            file_id: file.file_id,
            owner,
            file_name: file.file_name,
            file_size: file.file_size,
            storage_path: storage_path.clone(),
            content_nonce: file.content_nonce,
            algorithm: file.algorithm,
            wrapped: file.wrapped,
            created_at: now_epoch(),
        };

        // Never overwrite someone else's ciphertext
        if self.store.get_file(&record.file_id).await?.is_some()
            || self.blobs.exists(&storage_path).await?
        {
            return Err(VaultError::Conflict(format!(
                "file {} already exists",
                record.file_id
            )));
        }

        self.blobs.put(&storage_path, file.ciphertext).await?;
        match self
            .store
            .transaction(vec![TxOp::PutFile(record.clone())])
            .await
        {
            Ok(()) => {}
            // Lost a race for the id; the blob now belongs to the winner
            Err(e @ VaultError::Conflict(_)) => return Err(e),
            Err(e) => {
                if let Err(cleanup) = self.blobs.delete(&storage_path).await {
                    warn!(path = %storage_path, error = %cleanup, "orphaned blob after failed commit");
                }
                return Err(e);
            }
        }

        info!(file_id = %record.file_id, owner = %record.owner, bytes = record.file_size, "file stored");
        Ok(record)
    }

    pub async fn get_file(&self, token: &SessionToken, file_id: &FileId) -> VaultResult<StoredFile> {
        let owner = self.user_session(token)?;
        let record = self.owned_file(&owner, file_id).await?;
        let ciphertext = self.blobs.get(&record.storage_path).await?;
        Ok(StoredFile { record, ciphertext })
    }

    /// Record only, without fetching ciphertext.
    pub async fn get_file_record(
        &self,
        token: &SessionToken,
        file_id: &FileId,
    ) -> VaultResult<FileRecord> {
        let owner = self.user_session(token)?;
        self.owned_file(&owner, file_id).await
    }

    pub async fn list_files(&self, token: &SessionToken) -> VaultResult<Vec<FileRecord>> {
        let owner = self.user_session(token)?;
        self.store.list_files(&owner).await
    }

    async fn owned_file(&self, owner: &Identity, file_id: &FileId) -> VaultResult<FileRecord> {
        match self.store.get_file(file_id).await? {
            Some(record) if &record.owner == owner => Ok(record),
            _ => Err(VaultError::NotFound(format!("file {file_id}"))),
        }
    }

    // ── Rotation ─────────────────────────────────────────────────────────

    /// Registration response for the caller's new password. Persists
    /// nothing; the old registration stays valid until commit.
    pub fn rotation_start(&self, token: &SessionToken, request: &[u8]) -> VaultResult<PakeResponse> {
        let identity = self.user_session(token)?;
        self.auth.registration_start(&identity, request)
    }

    /// Replace the registration and every wrapped key in one transaction.
    ///
    /// The caller must prove the current password with a fresh login; a
    /// session token alone is not enough. The commit is rejected with
    /// `RotationAbort` if any file's wrap nonce or the owner's file set
    /// changed since the plan was built, and with `TransientStoreFailure`
    /// if it does not finish within the rotation timeout. Either way
    /// nothing is written.
    ///
    /// On success every session of the identity is revoked, since they
    /// hold the old master key, and pending logins are dropped. The
    /// returned token replaces the caller's.
    pub async fn commit_rotation(
        &self,
        token: &SessionToken,
        commit: RotationCommit,
    ) -> VaultResult<SessionToken> {
        let identity = self.user_session(token)?;
        self.auth
            .verify_password_proof(&identity, &commit.password_proof)
            .await?;
        let record = self.auth.registration_record(&commit.upload, commit.ksf)?;

        let expected: BTreeSet<FileId> = commit.rewrapped.iter().map(|r| r.file_id).collect();
        if expected.len() != commit.rewrapped.len() {
            return Err(VaultError::InvalidInput(
                "rotation lists a file more than once".into(),
            ));
        }

        let file_count = commit.rewrapped.len();
        let mut ops = Vec::with_capacity(2 * file_count + 2);
        ops.push(TxOp::ExpectOwnedFiles {
            owner: identity.clone(),
            expected,
        });
        for r in commit.rewrapped {
            ops.push(TxOp::ExpectWrapNonce {
                file_id: r.file_id,
                expected: r.expected_nonce,
            });
            ops.push(TxOp::UpdateWrappedKey {
                file_id: r.file_id,
                wrapped: r.wrapped,
            });
        }
        ops.push(TxOp::PutRegistration {
            identity: identity.clone(),
            record,
        });

        let start = Instant::now();
        match tokio::time::timeout(self.rotation_timeout, self.store.transaction(ops)).await {
            Ok(Ok(())) => {}
            Ok(Err(VaultError::Conflict(detail))) => {
                warn!(%identity, %detail, "rotation aborted: concurrent modification");
                return Err(VaultError::RotationAbort(detail));
            }
            Ok(Err(e)) => {
                warn!(%identity, error = %e, "rotation commit failed");
                return Err(e);
            }
            Err(_) => {
                warn!(%identity, timeout = ?self.rotation_timeout, "rotation commit timed out");
                return Err(VaultError::TransientStoreFailure(
                    "rotation commit timed out".into(),
                ));
            }
        }

        let revoked = self.sessions.revoke_identity(&identity)?;
        if let Err(e) = self.auth.discard_pending_login(&identity).await {
            // Stale states are refused at finish regardless
            warn!(%identity, error = %e, "failed to drop pending login after rotation");
        }
        let token = self.sessions.issue(&SessionGrant {
            identity: identity.clone(),
            granted_at: now_epoch(),
        })?;

        info!(
            %identity,
            files = file_count,
            sessions_revoked = revoked,
            duration_ms = start.elapsed().as_millis() as u64,
            "password rotated"
        );
        Ok(token)
    }

    // ── Shares ───────────────────────────────────────────────────────────

    /// Registration response for a new share identity. Persists nothing.
    pub fn share_start(
        &self,
        token: &SessionToken,
        share_id: &ShareId,
        request: &[u8],
    ) -> VaultResult<PakeResponse> {
        self.user_session(token)?;
        self.auth
            .registration_start(&Identity::share(share_id), request)
    }

    /// Store the share registration and record together.
    pub async fn create_share(
        &self,
        token: &SessionToken,
        share: NewShare,
    ) -> VaultResult<ShareRecord> {
        let owner = self.user_session(token)?;
        self.owned_file(&owner, &share.file_id).await?;
        let identity = Identity::share(&share.share_id);
        let registration = self.auth.registration_record(&share.upload, share.ksf)?;

        let record = ShareRecord {
            share_id: share.share_id,
            file_id: share.file_id,
            owner,
            wrapped: share.wrapped,
            created_at: now_epoch(),
        };
        self.store
            .transaction(vec![
                TxOp::ExpectNoRegistration {
                    identity: identity.clone(),
                },
                TxOp::PutRegistration {
                    identity,
                    record: registration,
                },
                TxOp::PutShare(record.clone()),
            ])
            .await?;

        info!(share_id = %record.share_id, file_id = %record.file_id, "share created");
        Ok(record)
    }

    pub async fn list_shares(&self, token: &SessionToken) -> VaultResult<Vec<ShareRecord>> {
        let owner = self.user_session(token)?;
        self.store.list_shares(&owner).await
    }

    /// Delete the share's registration and record, and end any session
    /// opened with it. The file and the owner's wrapped key are untouched.
    pub async fn revoke_share(&self, token: &SessionToken, share_id: &ShareId) -> VaultResult<()> {
        let owner = self.user_session(token)?;
        match self.store.get_share(share_id).await? {
            Some(share) if share.owner == owner => {}
            _ => return Err(VaultError::NotFound(format!("share {share_id}"))),
        }

        let identity = Identity::share(share_id);
        self.store
            .transaction(vec![
                TxOp::DeleteShare {
                    share_id: *share_id,
                },
                TxOp::DeleteRegistration {
                    identity: identity.clone(),
                },
            ])
            .await?;
        self.sessions.revoke_identity(&identity)?;

        info!(%share_id, "share revoked");
        Ok(())
    }

    /// Fetch the shared file for a session logged in as the share identity.
    pub async fn open_share(
        &self,
        token: &SessionToken,
        share_id: &ShareId,
    ) -> VaultResult<(ShareRecord, StoredFile)> {
        let identity = self.sessions.authenticate(token)?;
        if identity != Identity::share(share_id) {
            return Err(VaultError::NotFound(format!("share {share_id}")));
        }
        let share = self
            .store
            .get_share(share_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("share {share_id}")))?;
        let record = self
            .store
            .get_file(&share.file_id)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("file {}", share.file_id)))?;
        let ciphertext = self.blobs.get(&record.storage_path).await?;
        debug!(%share_id, file_id = %record.file_id, "share opened");
        Ok((share, StoredFile { record, ciphertext }))
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Purge expired login state and sessions.
    pub async fn cleanup_expired(&self) -> VaultResult<CleanupStats> {
        let start = Instant::now();
        let login_states_removed = self.auth.purge_expired_login_states().await?;
        let sessions_removed = self.sessions.purge_expired(now_epoch())?;
        Ok(CleanupStats {
            login_states_removed,
            sessions_removed,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}
