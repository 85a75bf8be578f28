//! Record store: the server's database boundary.
//!
//! Holds registration records, ephemeral login state, file records and
//! share records. Every multi-row change goes through
//! [`RecordStore::transaction`], which applies a list of [`TxOp`]s
//! all-or-nothing and checks preconditions against the state at commit.
//!
//! [`LocalRecordStore`] keeps the tables in memory and, when given a path,
//! persists them as JSON via temp file + rename, so a crash mid-commit
//! leaves the previous state on disk.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::{Path, PathBuf};
#[cfg(any(test, feature = "test-hooks"))]
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
#[cfg(any(test, feature = "test-hooks"))]
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;
use vault_core::{
    FileId, FileRecord, Identity, LoginState, RegistrationRecord, ShareId, ShareRecord,
    VaultError, VaultResult, WrappedKey,
};

/// One step of a multi-row transaction.
///
/// `Expect*` variants are preconditions: if one fails the whole transaction
/// is rejected with [`VaultError::Conflict`] and nothing is written.
#[derive(Debug, Clone)]
pub enum TxOp {
    /// The file's current wrap nonce must still be `expected`.
    ExpectWrapNonce { file_id: FileId, expected: Vec<u8> },
    /// The set of files owned by `owner` must be exactly `expected`.
    ExpectOwnedFiles {
        owner: Identity,
        expected: BTreeSet<FileId>,
    },
    /// No registration may exist for `identity`.
    ExpectNoRegistration { identity: Identity },
    PutRegistration {
        identity: Identity,
        record: RegistrationRecord,
    },
    DeleteRegistration { identity: Identity },
    /// Insert a new file record; fails if the id is taken.
    PutFile(FileRecord),
    /// Replace `wrapped_key` and `wrap_nonce` together.
    UpdateWrappedKey { file_id: FileId, wrapped: WrappedKey },
    DeleteFile { file_id: FileId },
    /// Insert a new share record; fails if the id is taken.
    PutShare(ShareRecord),
    DeleteShare { share_id: ShareId },
}

/// Persistence boundary used by the server.
pub trait RecordStore: Send + Sync + 'static {
    fn get_registration(
        &self,
        identity: &Identity,
    ) -> impl Future<Output = VaultResult<Option<RegistrationRecord>>> + Send;

    /// Store login state for `identity`, replacing any earlier one.
    fn upsert_login_state(
        &self,
        identity: &Identity,
        state: LoginState,
    ) -> impl Future<Output = VaultResult<()>> + Send;

    /// Remove and return the login state for `identity`. At most one caller
    /// ever receives a given state.
    fn take_login_state(
        &self,
        identity: &Identity,
    ) -> impl Future<Output = VaultResult<Option<LoginState>>> + Send;

    /// Drop every login state with `expires_at <= now`. Returns the count.
    fn purge_expired_login_states(&self, now: u64)
        -> impl Future<Output = VaultResult<usize>> + Send;

    fn get_file(
        &self,
        file_id: &FileId,
    ) -> impl Future<Output = VaultResult<Option<FileRecord>>> + Send;

    fn list_files(
        &self,
        owner: &Identity,
    ) -> impl Future<Output = VaultResult<Vec<FileRecord>>> + Send;

    fn get_share(
        &self,
        share_id: &ShareId,
    ) -> impl Future<Output = VaultResult<Option<ShareRecord>>> + Send;

    fn list_shares(
        &self,
        owner: &Identity,
    ) -> impl Future<Output = VaultResult<Vec<ShareRecord>>> + Send;

    /// Apply `ops` atomically.
    fn transaction(&self, ops: Vec<TxOp>) -> impl Future<Output = VaultResult<()>> + Send;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct Tables {
    registrations: BTreeMap<Identity, RegistrationRecord>,
    files: BTreeMap<FileId, FileRecord>,
    shares: BTreeMap<ShareId, ShareRecord>,
}

impl Tables {
    fn apply(&mut self, op: &TxOp) -> VaultResult<()> {
        match op {
            TxOp::ExpectWrapNonce { file_id, expected } => {
                let current = self
                    .files
                    .get(file_id)
                    .ok_or_else(|| VaultError::Conflict(format!("file {file_id} disappeared")))?;
                if &current.wrapped.wrap_nonce != expected {
                    return Err(VaultError::Conflict(format!(
                        "wrapped key of {file_id} changed concurrently"
                    )));
                }
            }
            TxOp::ExpectOwnedFiles { owner, expected } => {
                let current: BTreeSet<FileId> = self
                    .files
                    .values()
                    .filter(|f| &f.owner == owner)
                    .map(|f| f.file_id)
                    .collect();
                if &current != expected {
                    return Err(VaultError::Conflict(format!(
                        "file set of {owner} changed ({} expected, {} now)",
                        expected.len(),
                        current.len()
                    )));
                }
            }
            TxOp::ExpectNoRegistration { identity } => {
                if self.registrations.contains_key(identity) {
                    return Err(VaultError::Conflict(format!("{identity} already registered")));
                }
            }
            TxOp::PutRegistration { identity, record } => {
                self.registrations.insert(identity.clone(), record.clone());
            }
            TxOp::DeleteRegistration { identity } => {
                self.registrations
                    .remove(identity)
                    .ok_or_else(|| VaultError::NotFound(format!("registration {identity}")))?;
            }
            TxOp::PutFile(record) => {
                if self.files.contains_key(&record.file_id) {
                    return Err(VaultError::Conflict(format!(
                        "file {} already exists",
                        record.file_id
                    )));
                }
                self.files.insert(record.file_id, record.clone());
            }
            TxOp::UpdateWrappedKey { file_id, wrapped } => {
                let record = self
                    .files
                    .get_mut(file_id)
                    .ok_or_else(|| VaultError::NotFound(format!("file {file_id}")))?;
                record.wrapped = wrapped.clone();
            }
            TxOp::DeleteFile { file_id } => {
                self.files
                    .remove(file_id)
                    .ok_or_else(|| VaultError::NotFound(format!("file {file_id}")))?;
            }
            TxOp::PutShare(record) => {
                if self.shares.contains_key(&record.share_id) {
                    return Err(VaultError::Conflict(format!(
                        "share {} already exists",
                        record.share_id
                    )));
                }
                self.shares.insert(record.share_id, record.clone());
            }
            TxOp::DeleteShare { share_id } => {
                self.shares
                    .remove(share_id)
                    .ok_or_else(|| VaultError::NotFound(format!("share {share_id}")))?;
            }
        }
        Ok(())
    }
}

/// Test hooks for exercising interrupted commits.
#[cfg(any(test, feature = "test-hooks"))]
#[derive(Debug, Default)]
struct Faults {
    fail_next_commit: AtomicBool,
    commit_delay_ms: AtomicU64,
}

/// In-process record store, optionally persisted to a JSON file.
///
/// Login state is ephemeral and never written to disk.
#[derive(Debug)]
pub struct LocalRecordStore {
    path: Option<PathBuf>,
    tables: Mutex<Tables>,
    login_states: Mutex<BTreeMap<Identity, LoginState>>,
    #[cfg(any(test, feature = "test-hooks"))]
    faults: Faults,
}

impl LocalRecordStore {
    pub fn in_memory() -> Self {
        Self::with_tables(None, Tables::default())
    }

    /// Load the store at `path`, or start empty if the file does not exist.
    pub fn open(path: &Path) -> VaultResult<Self> {
        let tables = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading record store: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing record store: {}", path.display()))?
        } else {
            Tables::default()
        };
        Ok(Self::with_tables(Some(path.to_path_buf()), tables))
    }

    fn with_tables(path: Option<PathBuf>, tables: Tables) -> Self {
        Self {
            path,
            tables: Mutex::new(tables),
            login_states: Mutex::new(BTreeMap::new()),
            #[cfg(any(test, feature = "test-hooks"))]
            faults: Faults::default(),
        }
    }

    /// Make the next transaction fail with a transient error without
    /// applying anything.
    #[cfg(any(test, feature = "test-hooks"))]
    pub fn fail_next_commit(&self) {
        self.faults.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Delay every transaction by `delay` before it commits.
    #[cfg(any(test, feature = "test-hooks"))]
    pub fn set_commit_delay(&self, delay: Duration) {
        self.faults
            .commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn tables(&self) -> VaultResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| VaultError::TransientStoreFailure("record store lock poisoned".into()))
    }

    fn login_states(&self) -> VaultResult<MutexGuard<'_, BTreeMap<Identity, LoginState>>> {
        self.login_states
            .lock()
            .map_err(|_| VaultError::TransientStoreFailure("login state lock poisoned".into()))
    }

    fn commit(&self, ops: &[TxOp]) -> VaultResult<()> {
        #[cfg(any(test, feature = "test-hooks"))]
        if self.faults.fail_next_commit.swap(false, Ordering::SeqCst) {
            tracing::warn!(ops = ops.len(), "record store: injected commit failure");
            return Err(VaultError::TransientStoreFailure(
                "injected commit failure".into(),
            ));
        }

        let mut tables = self.tables()?;
        let mut staged = tables.clone();
        for op in ops {
            staged.apply(op)?;
        }
        if let Some(path) = &self.path {
            persist(path, &staged)?;
        }
        *tables = staged;

        debug!(ops = ops.len(), "record store: transaction committed");
        Ok(())
    }
}

/// Atomic write: temp file, then rename.
fn persist(path: &Path, tables: &Tables) -> VaultResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            VaultError::TransientStoreFailure(format!("creating {}: {e}", parent.display()))
        })?;
    }

    let json = serde_json::to_string_pretty(tables).context("serializing record store")?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, json).map_err(|e| {
        VaultError::TransientStoreFailure(format!("writing {}: {e}", tmp_path.display()))
    })?;
    std::fs::rename(&tmp_path, path).map_err(|e| {
        VaultError::TransientStoreFailure(format!("renaming {}: {e}", path.display()))
    })?;
    Ok(())
}

impl RecordStore for LocalRecordStore {
    async fn get_registration(&self, identity: &Identity) -> VaultResult<Option<RegistrationRecord>> {
        Ok(self.tables()?.registrations.get(identity).cloned())
    }

    async fn upsert_login_state(&self, identity: &Identity, state: LoginState) -> VaultResult<()> {
        self.login_states()?.insert(identity.clone(), state);
        Ok(())
    }

    async fn take_login_state(&self, identity: &Identity) -> VaultResult<Option<LoginState>> {
        Ok(self.login_states()?.remove(identity))
    }

    async fn purge_expired_login_states(&self, now: u64) -> VaultResult<usize> {
        let mut states = self.login_states()?;
        let before = states.len();
        states.retain(|_, state| !state.is_expired(now));
        Ok(before - states.len())
    }

    async fn get_file(&self, file_id: &FileId) -> VaultResult<Option<FileRecord>> {
        Ok(self.tables()?.files.get(file_id).cloned())
    }

    async fn list_files(&self, owner: &Identity) -> VaultResult<Vec<FileRecord>> {
        Ok(self
            .tables()?
            .files
            .values()
            .filter(|f| &f.owner == owner)
            .cloned()
            .collect())
    }

    async fn get_share(&self, share_id: &ShareId) -> VaultResult<Option<ShareRecord>> {
        Ok(self.tables()?.shares.get(share_id).cloned())
    }

    async fn list_shares(&self, owner: &Identity) -> VaultResult<Vec<ShareRecord>> {
        Ok(self
            .tables()?
            .shares
            .values()
            .filter(|s| &s.owner == owner)
            .cloned()
            .collect())
    }

    async fn transaction(&self, ops: Vec<TxOp>) -> VaultResult<()> {
        #[cfg(any(test, feature = "test-hooks"))]
        {
            let delay_ms = self.faults.commit_delay_ms.load(Ordering::SeqCst);
            if delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }
        self.commit(&ops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vault_core::{Algorithm, KsfParams};

    fn registration(tag: u8) -> RegistrationRecord {
        RegistrationRecord {
            password_file: vec![tag; 8],
            ksf: KsfParams::default(),
            registered_at: 1,
        }
    }

    fn file(owner: &Identity, nonce: u8) -> FileRecord {
        let file_id = FileId::new();
        FileRecord {
            file_id,
            owner: owner.clone(),
            file_name: "notes.txt".into(),
            file_size: 5,
            storage_path: format!("blobs/{file_id}"),
            content_nonce: vec![0; 12],
            algorithm: Algorithm::Aes256Gcm,
            wrapped: WrappedKey {
                wrapped_key: vec![1; 48],
                wrap_nonce: vec![nonce; 12],
            },
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn test_registration_put_get() {
        let store = LocalRecordStore::in_memory();
        let alice = Identity::user("alice@example.com");
        assert!(store.get_registration(&alice).await.unwrap().is_none());

        store
            .transaction(vec![TxOp::PutRegistration {
                identity: alice.clone(),
                record: registration(1),
            }])
            .await
            .unwrap();

        let stored = store.get_registration(&alice).await.unwrap().unwrap();
        assert_eq!(stored.password_file, vec![1; 8]);
    }

    #[tokio::test]
    async fn test_expect_no_registration() {
        let store = LocalRecordStore::in_memory();
        let alice = Identity::user("alice@example.com");
        let register = || {
            vec![
                TxOp::ExpectNoRegistration {
                    identity: alice.clone(),
                },
                TxOp::PutRegistration {
                    identity: alice.clone(),
                    record: registration(1),
                },
            ]
        };
        store.transaction(register()).await.unwrap();
        let err = store.transaction(register()).await.unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_login_state_taken_once() {
        let store = LocalRecordStore::in_memory();
        let alice = Identity::user("alice@example.com");
        let state = LoginState {
            server_state: vec![9; 4],
            expires_at: 100,
            registration: Vec::new(),
        };
        store.upsert_login_state(&alice, state).await.unwrap();

        assert!(store.take_login_state(&alice).await.unwrap().is_some());
        assert!(store.take_login_state(&alice).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_login_state_upsert_replaces() {
        let store = LocalRecordStore::in_memory();
        let alice = Identity::user("alice@example.com");
        for tag in [1u8, 2] {
            let state = LoginState {
                server_state: vec![tag],
                expires_at: 100,
                registration: Vec::new(),
            };
            store.upsert_login_state(&alice, state).await.unwrap();
        }
        let taken = store.take_login_state(&alice).await.unwrap().unwrap();
        assert_eq!(taken.server_state, vec![2]);
    }

    #[tokio::test]
    async fn test_concurrent_take_single_winner() {
        let store = Arc::new(LocalRecordStore::in_memory());
        let alice = Identity::user("alice@example.com");
        let state = LoginState {
            server_state: vec![1],
            expires_at: 100,
            registration: Vec::new(),
        };
        store.upsert_login_state(&alice, state).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let alice = alice.clone();
            handles.push(tokio::spawn(async move {
                store.take_login_state(&alice).await.unwrap().is_some()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_purge_expired_login_states() {
        let store = LocalRecordStore::in_memory();
        for (email, expires_at) in [("a@x.io", 10), ("b@x.io", 20), ("c@x.io", 30)] {
            let state = LoginState {
                server_state: vec![0],
                expires_at,
                registration: Vec::new(),
            };
            store
                .upsert_login_state(&Identity::user(email), state)
                .await
                .unwrap();
        }

        assert_eq!(store.purge_expired_login_states(20).await.unwrap(), 2);
        assert!(store
            .take_login_state(&Identity::user("c@x.io"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_failed_precondition_writes_nothing() {
        let store = LocalRecordStore::in_memory();
        let alice = Identity::user("alice@example.com");
        let record = file(&alice, 1);
        let file_id = record.file_id;
        store.transaction(vec![TxOp::PutFile(record)]).await.unwrap();

        let new_wrapped = WrappedKey {
            wrapped_key: vec![2; 48],
            wrap_nonce: vec![2; 12],
        };
        let err = store
            .transaction(vec![
                TxOp::UpdateWrappedKey {
                    file_id,
                    wrapped: new_wrapped,
                },
                TxOp::PutRegistration {
                    identity: alice.clone(),
                    record: registration(3),
                },
                TxOp::ExpectWrapNonce {
                    file_id,
                    expected: vec![7; 12],
                },
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, VaultError::Conflict(_)));
        let current = store.get_file(&file_id).await.unwrap().unwrap();
        assert_eq!(current.wrapped.wrap_nonce, vec![1; 12]);
        assert!(store.get_registration(&alice).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expect_owned_files() {
        let store = LocalRecordStore::in_memory();
        let alice = Identity::user("alice@example.com");
        let bob = Identity::user("bob@example.com");
        let a = file(&alice, 1);
        let expected: BTreeSet<FileId> = [a.file_id].into();
        store
            .transaction(vec![TxOp::PutFile(a), TxOp::PutFile(file(&bob, 1))])
            .await
            .unwrap();

        store
            .transaction(vec![TxOp::ExpectOwnedFiles {
                owner: alice.clone(),
                expected: expected.clone(),
            }])
            .await
            .unwrap();

        store
            .transaction(vec![TxOp::PutFile(file(&alice, 2))])
            .await
            .unwrap();
        let err = store
            .transaction(vec![TxOp::ExpectOwnedFiles {
                owner: alice,
                expected,
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_injected_commit_failure() {
        let store = LocalRecordStore::in_memory();
        let alice = Identity::user("alice@example.com");
        store.fail_next_commit();

        let err = store
            .transaction(vec![TxOp::PutFile(file(&alice, 1))])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.list_files(&alice).await.unwrap().is_empty());

        // Only the next commit fails
        store
            .transaction(vec![TxOp::PutFile(file(&alice, 1))])
            .await
            .unwrap();
        assert_eq!(store.list_files(&alice).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shares_listed_by_owner() {
        let store = LocalRecordStore::in_memory();
        let alice = Identity::user("alice@example.com");
        let record = file(&alice, 1);
        let share = ShareRecord {
            share_id: ShareId::generate(),
            file_id: record.file_id,
            owner: alice.clone(),
            wrapped: record.wrapped.clone(),
            created_at: 1,
        };
        let share_id = share.share_id;
        store
            .transaction(vec![TxOp::PutFile(record), TxOp::PutShare(share)])
            .await
            .unwrap();

        assert_eq!(store.list_shares(&alice).await.unwrap().len(), 1);
        assert!(store
            .list_shares(&Identity::user("bob@example.com"))
            .await
            .unwrap()
            .is_empty());

        store
            .transaction(vec![TxOp::DeleteShare { share_id }])
            .await
            .unwrap();
        assert!(store.get_share(&share_id).await.unwrap().is_none());

        let err = store
            .transaction(vec![TxOp::DeleteShare { share_id }])
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_persisted_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/records.json");
        let alice = Identity::user("alice@example.com");
        let record = file(&alice, 1);
        let file_id = record.file_id;

        {
            let store = LocalRecordStore::open(&path).unwrap();
            store
                .transaction(vec![
                    TxOp::PutRegistration {
                        identity: alice.clone(),
                        record: registration(1),
                    },
                    TxOp::PutFile(record),
                ])
                .await
                .unwrap();
            let state = LoginState {
                server_state: vec![1],
                expires_at: u64::MAX,
                registration: Vec::new(),
            };
            store.upsert_login_state(&alice, state).await.unwrap();
        }

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reopened = LocalRecordStore::open(&path).unwrap();
        assert!(reopened.get_registration(&alice).await.unwrap().is_some());
        assert_eq!(
            reopened.get_file(&file_id).await.unwrap().unwrap().file_name,
            "notes.txt"
        );
        assert!(
            reopened.take_login_state(&alice).await.unwrap().is_none(),
            "login state is never persisted"
        );
    }

    #[test]
    fn test_open_corrupt_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("records.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(LocalRecordStore::open(&path).is_err());
    }
}
