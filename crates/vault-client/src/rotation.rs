//! Password rotation: rewrap every file key under a new master key.
//!
//! 1. Prove the old password with a PAKE login whose finish request is
//!    held back; its export key gives the old master key.
//! 2. Register the new password; the server answers but stores nothing.
//! 3. Unwrap each owned file key under the old key and wrap it under the
//!    new one, on the crypto worker.
//! 4. Commit the proof, the new registration and every new wrapped key in
//!    one server-side transaction.
//!
//! Nothing is written before step 4. Cancellation, an unwrap failure, or a
//! concurrent change to the file set aborts with `RotationAbort` and leaves
//! the old password and wrapped keys in force. Shares are never touched.
//!
//! The proof is only good while the server keeps its login state, so a
//! plan must be committed within the login state TTL. After commit every
//! other session of the account is revoked and must log in again.

use std::sync::Arc;

use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vault_core::{Identity, VaultError, VaultResult};
use vault_crypto::pake::client;
use vault_crypto::{derive_wrapping_key, KeyPurpose, WrappingKey};
use vault_server::{RewrappedKey, RotationCommit, SessionToken};
use vault_store::RecordStore;

use crate::client::{blocking, clone_secret, VaultClient};
use crate::session::VaultSession;

/// A fully computed rotation, ready to commit.
pub struct RotationPlan {
    commit: RotationCommit,
    new_master: Arc<WrappingKey>,
}

impl RotationPlan {
    pub fn file_count(&self) -> usize {
        self.commit.rewrapped.len()
    }
}

fn cancelled() -> VaultError {
    VaultError::RotationAbort("cancelled".into())
}

impl<S: RecordStore> VaultClient<S> {
    /// Change the password and rewrap every file key. On success `session`
    /// continues under a new token and the new master key; every other
    /// session of the account is ended.
    pub async fn change_password(
        &self,
        session: &mut VaultSession,
        old_password: &SecretString,
        new_password: &SecretString,
        cancel: &CancellationToken,
    ) -> VaultResult<()> {
        let plan = self
            .prepare_rotation(session, old_password, new_password, cancel)
            .await?;
        self.commit_rotation(session, plan, cancel).await
    }

    /// Steps 1-3. Writes nothing.
    pub async fn prepare_rotation(
        &self,
        session: &VaultSession,
        old_password: &SecretString,
        new_password: &SecretString,
        cancel: &CancellationToken,
    ) -> VaultResult<RotationPlan> {
        let identity = session.identity().clone();
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let proof = self.password_proof(&identity, old_password).await?;
        let old_master = Arc::new(derive_wrapping_key(&proof.export_key, KeyPurpose::Master)?);

        let plan = self
            .build_plan(
                &identity,
                session.token(),
                old_master,
                proof.finish_request,
                new_password,
                cancel,
            )
            .await;
        match plan {
            Ok((commit, new_master)) => Ok(RotationPlan { commit, new_master }),
            Err(e) => {
                warn!(%identity, error = %e, "rotation abandoned before commit");
                Err(e)
            }
        }
    }

    async fn build_plan(
        &self,
        identity: &Identity,
        token: &SessionToken,
        old_master: Arc<WrappingKey>,
        password_proof: Vec<u8>,
        new_password: &SecretString,
        cancel: &CancellationToken,
    ) -> VaultResult<(RotationCommit, Arc<WrappingKey>)> {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let (state, request) = client::start_registration(new_password)?;
        let response = self.server.rotation_start(token, &request)?;
        let ksf = response.ksf;
        let (upload, export_key) = {
            let password = clone_secret(new_password);
            let identity = identity.clone();
            blocking(move || {
                client::finish_registration(state, &password, &response.message, &identity, &ksf)
                    .map(|f| (f.upload, f.export_key))
            })
            .await?
        };
        let new_master = Arc::new(derive_wrapping_key(&export_key, KeyPurpose::Master)?);

        let files = self.server.list_files(token).await?;
        let jobs = files.into_iter().map(|record| {
            let worker = self.worker.clone();
            let old = Arc::clone(&old_master);
            let new = Arc::clone(&new_master);
            async move {
                let wrapped = worker
                    .rewrap(old, new, record.file_id, record.algorithm, record.wrapped.clone())
                    .await
                    .map_err(|e| match e {
                        VaultError::IntegrityFailure(detail) => VaultError::RotationAbort(format!(
                            "file {} does not unwrap under the current key: {detail}",
                            record.file_id
                        )),
                        other => other,
                    })?;
                Ok::<_, VaultError>(RewrappedKey {
                    file_id: record.file_id,
                    expected_nonce: record.wrapped.wrap_nonce,
                    wrapped,
                })
            }
        });

        // Dropping the batch on cancel leaves queued jobs without a
        // requester, so the worker skips them.
        let rewrapped = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            result = futures::future::try_join_all(jobs) => result?,
        };

        Ok((
            RotationCommit {
                password_proof,
                upload,
                ksf,
                rewrapped,
            },
            new_master,
        ))
    }

    /// Step 4. Once the commit has started it runs to completion (bounded
    /// by the server's rotation timeout); cancellation is only honored
    /// before that.
    pub async fn commit_rotation(
        &self,
        session: &mut VaultSession,
        plan: RotationPlan,
        cancel: &CancellationToken,
    ) -> VaultResult<()> {
        let RotationPlan { commit, new_master } = plan;
        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let files = commit.rewrapped.len();
        let token = self.server.commit_rotation(session.token(), commit).await?;

        session.rotated(token, new_master);
        info!(identity = %session.identity(), files, "password changed");
        Ok(())
    }
}
