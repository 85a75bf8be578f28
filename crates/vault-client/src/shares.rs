//! Password-protected shares of a single file.
//!
//! A share is its own PAKE identity. Its export key derives a share key
//! that wraps one file key; the recipient logs in as the share and never
//! sees the owner's master key.

use std::sync::Arc;

use secrecy::SecretString;
use tracing::info;
use vault_core::{FileId, FileRecord, Identity, ShareId, ShareRecord, VaultResult};
use vault_crypto::pake::client;
use vault_crypto::{derive_wrapping_key, KeyPurpose};
use vault_server::NewShare;
use vault_store::RecordStore;

use crate::client::{blocking, clone_secret, VaultClient};
use crate::session::VaultSession;

impl<S: RecordStore> VaultClient<S> {
    /// Share one of the session owner's files under `share_password`.
    /// Returns the share id the recipient needs alongside the password.
    pub async fn create_share(
        &self,
        session: &VaultSession,
        file_id: &FileId,
        share_password: &SecretString,
    ) -> VaultResult<ShareId> {
        let master = session.master()?;
        let record = self
            .server
            .get_file_record(session.token(), file_id)
            .await?;

        let share_id = ShareId::generate();
        let identity = Identity::share(&share_id);
        let (state, request) = client::start_registration(share_password)?;
        let response = self
            .server
            .share_start(session.token(), &share_id, &request)?;
        let ksf = response.ksf;
        let (upload, export_key) = {
            let password = clone_secret(share_password);
            blocking(move || {
                client::finish_registration(state, &password, &response.message, &identity, &ksf)
                    .map(|f| (f.upload, f.export_key))
            })
            .await?
        };
        let share_key = Arc::new(derive_wrapping_key(&export_key, KeyPurpose::Share)?);

        let wrapped = self
            .worker
            .rewrap(
                master,
                share_key,
                record.file_id,
                record.algorithm,
                record.wrapped.clone(),
            )
            .await?;

        let share = self
            .server
            .create_share(
                session.token(),
                NewShare {
                    share_id,
                    file_id: record.file_id,
                    upload,
                    ksf,
                    wrapped,
                },
            )
            .await?;
        info!(share_id = %share.share_id, file = %record.file_name, "file shared");
        Ok(share.share_id)
    }

    /// Open a share as its recipient. Needs no user account.
    pub async fn open_share(
        &self,
        share_id: &ShareId,
        share_password: &SecretString,
    ) -> VaultResult<(FileRecord, Vec<u8>)> {
        let identity = Identity::share(share_id);
        let (token, share_key) = self
            .authenticate(&identity, share_password, KeyPurpose::Share)
            .await?;

        let opened = self.server.open_share(&token, share_id).await;
        self.end_session(&identity, &token);
        let (share, stored) = opened?;

        let record = stored.record;
        let plaintext = self
            .worker
            .open(
                Arc::new(share_key),
                record.file_id,
                record.algorithm,
                share.wrapped,
                stored.ciphertext,
                record.content_nonce.clone(),
            )
            .await?;
        Ok((record, plaintext))
    }

    pub async fn list_shares(&self, session: &VaultSession) -> VaultResult<Vec<ShareRecord>> {
        self.server.list_shares(session.token()).await
    }

    pub async fn revoke_share(&self, session: &VaultSession, share_id: &ShareId) -> VaultResult<()> {
        self.server.revoke_share(session.token(), share_id).await
    }
}
