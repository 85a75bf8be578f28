//! Client flows: register, log in, upload, download.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use vault_core::{Algorithm, FileId, FileRecord, Identity, VaultError, VaultResult};
use vault_crypto::pake::client::{self, LoginFinish};
use vault_crypto::{derive_wrapping_key, CryptoError, KeyPurpose, WrappingKey};
use vault_server::{NewFile, SessionToken, VaultServer};
use vault_store::RecordStore;

use crate::session::VaultSession;
use crate::worker::CryptoWorker;

pub struct VaultClient<S> {
    pub(crate) server: Arc<VaultServer<S>>,
    pub(crate) worker: CryptoWorker,
    algorithm: Algorithm,
}

impl<S: RecordStore> VaultClient<S> {
    /// `algorithm` applies to new uploads; existing files keep the one in
    /// their record.
    pub fn new(server: Arc<VaultServer<S>>, algorithm: Algorithm, concurrency: usize) -> Self {
        Self {
            server,
            worker: CryptoWorker::spawn(concurrency),
            algorithm,
        }
    }

    pub fn server(&self) -> &Arc<VaultServer<S>> {
        &self.server
    }

    /// Register a new user account.
    pub async fn register(&self, email: &str, password: &SecretString) -> VaultResult<()> {
        let identity = Identity::user(email);
        let (state, request) = client::start_registration(password)?;
        let response = self.server.register_start(&identity, &request)?;

        let (upload, ksf) = {
            let password = clone_secret(password);
            let identity = identity.clone();
            blocking(move || {
                client::finish_registration(
                    state,
                    &password,
                    &response.message,
                    &identity,
                    &response.ksf,
                )
                .map(|f| (f.upload, response.ksf))
            })
            .await?
        };

        self.server.register_finish(&identity, &upload, ksf).await?;
        info!(%identity, "registered");
        Ok(())
    }

    /// Log in and unlock: PAKE login, then derive the master key from the
    /// export key.
    pub async fn login(&self, email: &str, password: &SecretString) -> VaultResult<VaultSession> {
        let identity = Identity::user(email);
        let (token, master) = self
            .authenticate(&identity, password, KeyPurpose::Master)
            .await?;
        Ok(VaultSession::new(identity, token, master))
    }

    /// Full PAKE login for any identity, yielding a session token and the
    /// wrapping key for `purpose`.
    ///
    /// A wrong password fails in the client-side finish; the server's
    /// login state for it simply expires.
    pub(crate) async fn authenticate(
        &self,
        identity: &Identity,
        password: &SecretString,
        purpose: KeyPurpose,
    ) -> VaultResult<(SessionToken, WrappingKey)> {
        let finish = self.password_proof(identity, password).await?;
        let (token, _grant) = self
            .server
            .login_finish(identity, &finish.finish_request)
            .await?;
        let key = derive_wrapping_key(&finish.export_key, purpose)?;
        Ok((token, key))
    }

    /// Client half of a PAKE login. The finish request is left for the
    /// caller to spend, on a session or as proof for a privileged call.
    pub(crate) async fn password_proof(
        &self,
        identity: &Identity,
        password: &SecretString,
    ) -> VaultResult<LoginFinish> {
        let (state, request) = client::start_login(password)?;
        let response = self.server.login_start(identity, &request).await?;

        let finish = {
            let password = clone_secret(password);
            let identity = identity.clone();
            blocking(move || {
                client::finish_login(state, &password, &response.message, &identity, &response.ksf)
            })
            .await
        };
        match finish {
            Ok(finish) => Ok(finish),
            Err(VaultError::AuthenticationFailure) => {
                debug!(%identity, "login rejected locally");
                Err(VaultError::AuthenticationFailure)
            }
            Err(e) => Err(e),
        }
    }

    /// End a short-lived session the caller opened for itself.
    pub(crate) fn end_session(&self, identity: &Identity, token: &SessionToken) {
        if let Err(e) = self.server.logout(token) {
            warn!(%identity, error = %e, "failed to end session");
        }
    }

    /// Encrypt and store a file. The file name is kept in the record; the
    /// blob path is derived from the random file id.
    pub async fn upload(
        &self,
        session: &VaultSession,
        file_name: &str,
        plaintext: Vec<u8>,
    ) -> VaultResult<FileRecord> {
        let master = session.master()?;
        let file_id = FileId::new();
        let file_size = plaintext.len() as u64;

        let sealed = self
            .worker
            .seal(master, file_id, self.algorithm, plaintext)
            .await?;

        self.server
            .put_file(
                session.token(),
                NewFile {
                    file_id,
                    file_name: file_name.to_string(),
                    file_size,
                    ciphertext: sealed.ciphertext,
                    content_nonce: sealed.content_nonce,
                    algorithm: self.algorithm,
                    wrapped: sealed.wrapped,
                },
            )
            .await
    }

    /// Fetch and decrypt a file. Any tampering fails with
    /// `IntegrityFailure`; no partial plaintext is returned.
    pub async fn download(
        &self,
        session: &VaultSession,
        file_id: &FileId,
    ) -> VaultResult<(FileRecord, Vec<u8>)> {
        let master = session.master()?;
        let stored = self.server.get_file(session.token(), file_id).await?;
        let record = stored.record;

        let plaintext = self
            .worker
            .open(
                master,
                record.file_id,
                record.algorithm,
                record.wrapped.clone(),
                stored.ciphertext,
                record.content_nonce.clone(),
            )
            .await?;
        Ok((record, plaintext))
    }

    pub async fn list(&self, session: &VaultSession) -> VaultResult<Vec<FileRecord>> {
        self.server.list_files(session.token()).await
    }

    /// End the server session and drop the master key.
    pub fn logout(&self, mut session: VaultSession) -> VaultResult<()> {
        session.lock();
        self.server.logout(session.token())
    }
}

/// Argon2id inside OPAQUE finish is deliberately slow; keep it off the
/// async workers.
pub(crate) async fn blocking<T, F>(f: F) -> VaultResult<T>
where
    F: FnOnce() -> Result<T, CryptoError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VaultError::Other(anyhow::anyhow!("PAKE task failed: {e}")))?
        .map_err(VaultError::from)
}

pub(crate) fn clone_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_owned())
}
