//! PAKE authentication service.
//!
//! Registration persists nothing until finish. Login start stores an
//! ephemeral server state keyed by identity (a second start replaces the
//! first); login finish takes it out of the store, so every state is
//! verified at most once whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use vault_core::{
    now_epoch, Identity, KsfParams, LoginState, RegistrationRecord, VaultError, VaultResult,
};
use vault_crypto::pake::server;
use vault_crypto::{CryptoError, ServerSetup};
use vault_store::{RecordStore, TxOp};

/// Emitted on every successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub identity: Identity,
    pub granted_at: u64,
}

/// Server's answer to a registration or login start: the OPAQUE message and
/// the Argon2id parameters the client must stretch with.
#[derive(Debug, Clone)]
pub struct PakeResponse {
    pub message: Vec<u8>,
    pub ksf: KsfParams,
}

pub struct AuthService<S> {
    store: Arc<S>,
    setup: Arc<ServerSetup>,
    login_state_ttl: Duration,
    /// Parameters offered to new registrations
    default_ksf: KsfParams,
    /// Earlier defaults still held by older registrations
    legacy_ksf: Vec<KsfParams>,
    grants: broadcast::Sender<SessionGrant>,
}

impl<S: RecordStore> AuthService<S> {
    pub fn new(
        store: Arc<S>,
        setup: Arc<ServerSetup>,
        login_state_ttl: Duration,
        default_ksf: KsfParams,
    ) -> Self {
        let (grants, _) = broadcast::channel(64);
        Self {
            store,
            setup,
            login_state_ttl,
            default_ksf,
            legacy_ksf: Vec::new(),
            grants,
        }
    }

    /// Declare earlier deployment defaults. Unknown identities are answered
    /// with one of these or the current default, so an account registered
    /// under old parameters looks like any other answer.
    pub fn with_legacy_ksf(mut self, legacy: Vec<KsfParams>) -> Self {
        self.legacy_ksf = legacy;
        self
    }

    fn ksf_profiles(&self) -> impl Iterator<Item = &KsfParams> {
        std::iter::once(&self.default_ksf).chain(self.legacy_ksf.iter())
    }

    /// Parameters shown for an identity with no registration: a keyed,
    /// stable pick among the known profiles.
    fn ksf_for_unknown(&self, identity: &Identity) -> KsfParams {
        let n = 1 + self.legacy_ksf.len();
        let pick = self.setup.identity_choice(identity, n);
        self.ksf_profiles()
            .nth(pick)
            .copied()
            .unwrap_or(self.default_ksf)
    }

    /// Observe successful logins.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionGrant> {
        self.grants.subscribe()
    }

    /// Evaluate a registration request. Persists nothing.
    pub fn registration_start(
        &self,
        identity: &Identity,
        request: &[u8],
    ) -> VaultResult<PakeResponse> {
        let message = server::create_registration_response(&self.setup, identity, request)?;
        Ok(PakeResponse {
            message,
            ksf: self.default_ksf,
        })
    }

    /// Build the record for a finished registration without storing it.
    /// Callers commit it in their own transaction.
    pub fn registration_record(
        &self,
        upload: &[u8],
        ksf: KsfParams,
    ) -> VaultResult<RegistrationRecord> {
        ksf.validate()?;
        let password_file = server::finish_registration(upload)?;
        Ok(RegistrationRecord {
            password_file,
            ksf,
            registered_at: now_epoch(),
        })
    }

    /// Store a new registration. Fails with `Conflict` if the identity is
    /// taken.
    pub async fn registration_finish(
        &self,
        identity: &Identity,
        upload: &[u8],
        ksf: KsfParams,
    ) -> VaultResult<()> {
        let record = self.registration_record(upload, ksf)?;
        self.store
            .transaction(vec![
                TxOp::ExpectNoRegistration {
                    identity: identity.clone(),
                },
                TxOp::PutRegistration {
                    identity: identity.clone(),
                    record,
                },
            ])
            .await?;
        info!(%identity, "registration stored");
        Ok(())
    }

    /// Answer a credential request and store the ephemeral server state.
    ///
    /// Unknown identities get a dummy response and parameters picked from
    /// the known profiles; they fail later, at finish, like a wrong
    /// password.
    pub async fn login_start(
        &self,
        identity: &Identity,
        request: &[u8],
    ) -> VaultResult<PakeResponse> {
        let record = self.store.get_registration(identity).await?;
        let ksf = match &record {
            Some(r) => {
                if !self.ksf_profiles().any(|p| *p == r.ksf) {
                    warn!(
                        %identity,
                        ksf = ?r.ksf,
                        "registration uses KSF params outside the configured profiles; add them to crypto.legacy_ksf"
                    );
                }
                r.ksf
            }
            None => self.ksf_for_unknown(identity),
        };
        let registration = record
            .as_ref()
            .map(|r| server::password_file_fingerprint(&r.password_file))
            .unwrap_or_default();

        let start = server::start_login(
            &self.setup,
            identity,
            record.as_ref().map(|r| r.password_file.as_slice()),
            request,
        )?;

        let state = LoginState {
            server_state: start.server_state,
            expires_at: now_epoch() + self.login_state_ttl.as_secs(),
            registration,
        };
        self.store.upsert_login_state(identity, state).await?;
        debug!(%identity, "login started");

        Ok(PakeResponse {
            message: start.response,
            ksf,
        })
    }

    /// Verify the client's finalization and emit a grant. The stored state
    /// is consumed before verification, so a replayed finish request always
    /// fails.
    pub async fn login_finish(
        &self,
        identity: &Identity,
        finish_request: &[u8],
    ) -> VaultResult<SessionGrant> {
        let now = self.verify_login(identity, finish_request).await?;
        let grant = SessionGrant {
            identity: identity.clone(),
            granted_at: now,
        };
        // No subscribers is fine
        let _ = self.grants.send(grant.clone());
        info!(%identity, "login succeeded");
        Ok(grant)
    }

    /// Check a fresh password proof without granting a session. Used where
    /// a session token alone is not enough authority.
    pub async fn verify_password_proof(
        &self,
        identity: &Identity,
        finish_request: &[u8],
    ) -> VaultResult<()> {
        self.verify_login(identity, finish_request).await?;
        debug!(%identity, "password proof verified");
        Ok(())
    }

    /// Drop any pending login for `identity`.
    pub async fn discard_pending_login(&self, identity: &Identity) -> VaultResult<()> {
        if self.store.take_login_state(identity).await?.is_some() {
            debug!(%identity, "pending login discarded");
        }
        Ok(())
    }

    /// Consume the login state and verify against it. A state built from a
    /// password file that has since been replaced is stale.
    async fn verify_login(&self, identity: &Identity, finish_request: &[u8]) -> VaultResult<u64> {
        let now = now_epoch();
        let state = match self.store.take_login_state(identity).await? {
            Some(state) if !state.is_expired(now) => state,
            Some(_) => {
                debug!(%identity, "login state expired");
                return Err(VaultError::ReplayOrExpiredState);
            }
            None => return Err(VaultError::ReplayOrExpiredState),
        };

        let current = self
            .store
            .get_registration(identity)
            .await?
            .map(|r| server::password_file_fingerprint(&r.password_file))
            .unwrap_or_default();
        if current != state.registration {
            debug!(%identity, "login state predates the current registration");
            return Err(VaultError::ReplayOrExpiredState);
        }

        match server::finish_login(&state.server_state, finish_request) {
            Ok(_session_key) => {}
            Err(CryptoError::Authentication) => {
                info!(%identity, "login failed");
                return Err(VaultError::AuthenticationFailure);
            }
            Err(e) => {
                debug!(%identity, error = %e, "login finish rejected");
                return Err(VaultError::AuthenticationFailure);
            }
        }
        Ok(now)
    }

    pub async fn purge_expired_login_states(&self) -> VaultResult<usize> {
        self.store.purge_expired_login_states(now_epoch()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use vault_crypto::pake::client;
    use vault_store::LocalRecordStore;

    const TEST_KSF: KsfParams = KsfParams {
        mem_cost_kib: 256,
        time_cost: 1,
        parallelism: 1,
    };

    fn service(ttl: Duration) -> AuthService<LocalRecordStore> {
        AuthService::new(
            Arc::new(LocalRecordStore::in_memory()),
            Arc::new(ServerSetup::generate()),
            ttl,
            TEST_KSF,
        )
    }

    async fn register(auth: &AuthService<LocalRecordStore>, identity: &Identity, pw: &str) {
        let pw = SecretString::from(pw);
        let (state, request) = client::start_registration(&pw).unwrap();
        let response = auth.registration_start(identity, &request).unwrap();
        let finish =
            client::finish_registration(state, &pw, &response.message, identity, &response.ksf)
                .unwrap();
        auth.registration_finish(identity, &finish.upload, response.ksf)
            .await
            .unwrap();
    }

    /// Runs a client login up to the finish request.
    async fn client_finish(
        auth: &AuthService<LocalRecordStore>,
        identity: &Identity,
        pw: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let pw = SecretString::from(pw);
        let (state, request) = client::start_login(&pw).unwrap();
        let response = auth.login_start(identity, &request).await.unwrap();
        client::finish_login(state, &pw, &response.message, identity, &response.ksf)
            .map(|f| f.finish_request)
    }

    #[tokio::test]
    async fn test_register_and_login() {
        let auth = service(Duration::from_secs(300));
        let mut grants = auth.subscribe();
        let alice = Identity::user("alice@example.com");
        register(&auth, &alice, "correct-horse").await;

        let finish = client_finish(&auth, &alice, "correct-horse").await.unwrap();
        let grant = auth.login_finish(&alice, &finish).await.unwrap();

        assert_eq!(grant.identity, alice);
        assert_eq!(grants.recv().await.unwrap(), grant);
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let auth = service(Duration::from_secs(300));
        let alice = Identity::user("alice@example.com");
        register(&auth, &alice, "pw").await;

        let pw = SecretString::from("other");
        let (state, request) = client::start_registration(&pw).unwrap();
        let response = auth.registration_start(&alice, &request).unwrap();
        let finish =
            client::finish_registration(state, &pw, &response.message, &alice, &response.ksf)
                .unwrap();
        let err = auth
            .registration_finish(&alice, &finish.upload, response.ksf)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_replayed_finish_rejected() {
        let auth = service(Duration::from_secs(300));
        let alice = Identity::user("alice@example.com");
        register(&auth, &alice, "pw").await;

        let finish = client_finish(&auth, &alice, "pw").await.unwrap();
        auth.login_finish(&alice, &finish).await.unwrap();

        let err = auth.login_finish(&alice, &finish).await.unwrap_err();
        assert!(matches!(err, VaultError::ReplayOrExpiredState));
        assert_eq!(err.public_message(), "incorrect password");
    }

    #[tokio::test]
    async fn test_failed_finish_consumes_state() {
        let auth = service(Duration::from_secs(300));
        let alice = Identity::user("alice@example.com");
        register(&auth, &alice, "pw").await;

        let pw = SecretString::from("pw");
        let (_, request) = client::start_login(&pw).unwrap();
        auth.login_start(&alice, &request).await.unwrap();

        let err = auth.login_finish(&alice, b"garbage").await.unwrap_err();
        assert!(matches!(err, VaultError::AuthenticationFailure));
        let err = auth.login_finish(&alice, b"garbage").await.unwrap_err();
        assert!(matches!(err, VaultError::ReplayOrExpiredState));
    }

    #[tokio::test]
    async fn test_second_start_replaces_first() {
        let auth = service(Duration::from_secs(300));
        let alice = Identity::user("alice@example.com");
        register(&auth, &alice, "pw").await;

        let first = client_finish(&auth, &alice, "pw").await.unwrap();
        let second = client_finish(&auth, &alice, "pw").await.unwrap();

        assert!(auth.login_finish(&alice, &second).await.is_ok());
        assert!(matches!(
            auth.login_finish(&alice, &first).await,
            Err(VaultError::ReplayOrExpiredState)
        ));
    }

    #[tokio::test]
    async fn test_expired_state_rejected() {
        let auth = service(Duration::ZERO);
        let alice = Identity::user("alice@example.com");
        register(&auth, &alice, "pw").await;

        let finish = client_finish(&auth, &alice, "pw").await.unwrap();
        let err = auth.login_finish(&alice, &finish).await.unwrap_err();
        assert!(matches!(err, VaultError::ReplayOrExpiredState));
    }

    #[tokio::test]
    async fn test_unknown_identity_fails_like_wrong_password() {
        let auth = service(Duration::from_secs(300));
        let ghost = Identity::user("nobody@example.com");

        let result = client_finish(&auth, &ghost, "pw").await;
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[tokio::test]
    async fn test_login_returns_registered_ksf() {
        let store = Arc::new(LocalRecordStore::in_memory());
        let setup = Arc::new(ServerSetup::generate());
        let alice = Identity::user("alice@example.com");

        let old = AuthService::new(
            Arc::clone(&store),
            Arc::clone(&setup),
            Duration::from_secs(300),
            TEST_KSF,
        );
        register(&old, &alice, "pw").await;

        // Deployment defaults change after registration
        let stronger = KsfParams {
            time_cost: 2,
            ..TEST_KSF
        };
        let new = AuthService::new(store, setup, Duration::from_secs(300), stronger);
        let finish = client_finish(&new, &alice, "pw").await.unwrap();
        assert!(new.login_finish(&alice, &finish).await.is_ok());
    }

    #[tokio::test]
    async fn test_old_accounts_indistinguishable_after_default_change() {
        let store = Arc::new(LocalRecordStore::in_memory());
        let setup = Arc::new(ServerSetup::generate());
        let alice = Identity::user("alice@example.com");
        let old = AuthService::new(
            Arc::clone(&store),
            Arc::clone(&setup),
            Duration::from_secs(300),
            TEST_KSF,
        );
        register(&old, &alice, "pw").await;

        let stronger = KsfParams {
            time_cost: 2,
            ..TEST_KSF
        };
        let new = AuthService::new(store, setup, Duration::from_secs(300), stronger)
            .with_legacy_ksf(vec![TEST_KSF]);

        let pw = SecretString::from("pw");
        let (_, request) = client::start_login(&pw).unwrap();
        assert_eq!(new.login_start(&alice, &request).await.unwrap().ksf, TEST_KSF);

        // Unknown identities answer with either profile, always the same one
        let mut seen = Vec::new();
        for i in 0..32 {
            let ghost = Identity::user(&format!("ghost{i}@example.com"));
            let first = new.login_start(&ghost, &request).await.unwrap().ksf;
            let again = new.login_start(&ghost, &request).await.unwrap().ksf;
            assert_eq!(first, again);
            seen.push(first);
        }
        assert!(seen.contains(&TEST_KSF));
        assert!(seen.contains(&stronger));
    }

    #[tokio::test]
    async fn test_login_state_stale_after_registration_replaced() {
        let auth = service(Duration::from_secs(300));
        let alice = Identity::user("alice@example.com");
        register(&auth, &alice, "old").await;

        // Login started against the old password file
        let finish = client_finish(&auth, &alice, "old").await.unwrap();

        let pw = SecretString::from("new");
        let (state, request) = client::start_registration(&pw).unwrap();
        let response = auth.registration_start(&alice, &request).unwrap();
        let upload =
            client::finish_registration(state, &pw, &response.message, &alice, &response.ksf)
                .unwrap()
                .upload;
        let record = auth.registration_record(&upload, response.ksf).unwrap();
        auth.store
            .transaction(vec![TxOp::PutRegistration {
                identity: alice.clone(),
                record,
            }])
            .await
            .unwrap();

        let err = auth.login_finish(&alice, &finish).await.unwrap_err();
        assert!(matches!(err, VaultError::ReplayOrExpiredState));
    }

    #[tokio::test]
    async fn test_password_proof_is_single_use_and_grants_nothing() {
        let auth = service(Duration::from_secs(300));
        let mut grants = auth.subscribe();
        let alice = Identity::user("alice@example.com");
        register(&auth, &alice, "pw").await;

        let finish = client_finish(&auth, &alice, "pw").await.unwrap();
        auth.verify_password_proof(&alice, &finish).await.unwrap();
        assert!(grants.try_recv().is_err());
        assert!(matches!(
            auth.verify_password_proof(&alice, &finish).await,
            Err(VaultError::ReplayOrExpiredState)
        ));

        // A login started with a wrong password cannot be turned into a proof
        let wrong = client_finish(&auth, &alice, "nope").await;
        assert!(wrong.is_err());
        assert!(matches!(
            auth.verify_password_proof(&alice, b"garbage").await,
            Err(VaultError::AuthenticationFailure)
        ));
    }

    #[tokio::test]
    async fn test_discard_pending_login() {
        let auth = service(Duration::from_secs(300));
        let alice = Identity::user("alice@example.com");
        register(&auth, &alice, "pw").await;

        let finish = client_finish(&auth, &alice, "pw").await.unwrap();
        auth.discard_pending_login(&alice).await.unwrap();
        assert!(matches!(
            auth.login_finish(&alice, &finish).await,
            Err(VaultError::ReplayOrExpiredState)
        ));
    }

    #[tokio::test]
    async fn test_purge_expired_login_states() {
        let auth = service(Duration::ZERO);
        let alice = Identity::user("alice@example.com");
        register(&auth, &alice, "pw").await;
        client_finish(&auth, &alice, "pw").await.unwrap();

        assert_eq!(auth.purge_expired_login_states().await.unwrap(), 1);
    }
}
