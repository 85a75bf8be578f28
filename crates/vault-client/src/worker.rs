//! Crypto worker: envelope operations off the async runtime.
//!
//! Callers send one job per file over an mpsc channel and await a oneshot
//! reply. The dispatcher runs each job on the blocking pool, at most
//! `concurrency` at a time. A job whose requester has gone away (reply
//! receiver dropped) is skipped, so cancelling a batch stops the work that
//! has not started yet.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info};
use vault_core::{Algorithm, FileId, VaultError, VaultResult, WrappedKey};
use vault_crypto::{
    decrypt_content, encrypt_content, generate_file_key, unwrap_key, wrap_key, WrappingKey,
};

/// Output of sealing one file: content ciphertext plus its wrapped key.
#[derive(Debug, Clone)]
pub struct SealedFile {
    pub ciphertext: Vec<u8>,
    pub content_nonce: Vec<u8>,
    pub wrapped: WrappedKey,
}

enum Job {
    Seal {
        key: Arc<WrappingKey>,
        file_id: FileId,
        algorithm: Algorithm,
        plaintext: Vec<u8>,
        reply: oneshot::Sender<VaultResult<SealedFile>>,
    },
    Open {
        key: Arc<WrappingKey>,
        file_id: FileId,
        algorithm: Algorithm,
        wrapped: WrappedKey,
        ciphertext: Vec<u8>,
        nonce: Vec<u8>,
        reply: oneshot::Sender<VaultResult<Vec<u8>>>,
    },
    Rewrap {
        from: Arc<WrappingKey>,
        to: Arc<WrappingKey>,
        file_id: FileId,
        algorithm: Algorithm,
        wrapped: WrappedKey,
        reply: oneshot::Sender<VaultResult<WrappedKey>>,
    },
}

impl Job {
    fn is_abandoned(&self) -> bool {
        match self {
            Job::Seal { reply, .. } => reply.is_closed(),
            Job::Open { reply, .. } => reply.is_closed(),
            Job::Rewrap { reply, .. } => reply.is_closed(),
        }
    }

    fn file_id(&self) -> FileId {
        match self {
            Job::Seal { file_id, .. } | Job::Open { file_id, .. } | Job::Rewrap { file_id, .. } => {
                *file_id
            }
        }
    }

    /// Runs on the blocking pool. A failed send means the requester left
    /// mid-job; the result is dropped.
    fn run(self) {
        match self {
            Job::Seal {
                key,
                file_id,
                algorithm,
                plaintext,
                reply,
            } => {
                let _ = reply.send(seal(&key, &file_id, algorithm, &plaintext));
            }
            Job::Open {
                key,
                file_id,
                algorithm,
                wrapped,
                ciphertext,
                nonce,
                reply,
            } => {
                let result = unwrap_key(&key, &wrapped, &file_id, algorithm)
                    .and_then(|file_key| {
                        decrypt_content(&file_key, &file_id, algorithm, &ciphertext, &nonce)
                    })
                    .map_err(VaultError::from);
                let _ = reply.send(result);
            }
            Job::Rewrap {
                from,
                to,
                file_id,
                algorithm,
                wrapped,
                reply,
            } => {
                let result = unwrap_key(&from, &wrapped, &file_id, algorithm)
                    .and_then(|file_key| wrap_key(&to, &file_key, &file_id, algorithm))
                    .map_err(VaultError::from);
                let _ = reply.send(result);
            }
        }
    }
}

/// Fresh file key per call, so identical plaintexts never share a key.
fn seal(
    key: &WrappingKey,
    file_id: &FileId,
    algorithm: Algorithm,
    plaintext: &[u8],
) -> VaultResult<SealedFile> {
    let file_key = generate_file_key();
    let sealed = encrypt_content(&file_key, file_id, algorithm, plaintext)?;
    let wrapped = wrap_key(key, &file_key, file_id, algorithm)?;
    Ok(SealedFile {
        ciphertext: sealed.ciphertext,
        content_nonce: sealed.nonce,
        wrapped,
    })
}

/// Handle to the dispatcher task. Cheap to clone.
#[derive(Clone)]
pub struct CryptoWorker {
    tx: mpsc::Sender<Job>,
}

impl CryptoWorker {
    /// Start the dispatcher. Must be called inside a tokio runtime.
    pub fn spawn(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (tx, rx) = mpsc::channel(concurrency * 4);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        tokio::spawn(dispatch(rx, semaphore));
        info!(concurrency, "crypto worker ready");
        Self { tx }
    }

    /// Generate a file key, encrypt `plaintext` under it, wrap it under `key`.
    pub async fn seal(
        &self,
        key: Arc<WrappingKey>,
        file_id: FileId,
        algorithm: Algorithm,
        plaintext: Vec<u8>,
    ) -> VaultResult<SealedFile> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            Job::Seal {
                key,
                file_id,
                algorithm,
                plaintext,
                reply,
            },
            rx,
        )
        .await
    }

    /// Unwrap the file key with `key` and decrypt the content.
    pub async fn open(
        &self,
        key: Arc<WrappingKey>,
        file_id: FileId,
        algorithm: Algorithm,
        wrapped: WrappedKey,
        ciphertext: Vec<u8>,
        nonce: Vec<u8>,
    ) -> VaultResult<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            Job::Open {
                key,
                file_id,
                algorithm,
                wrapped,
                ciphertext,
                nonce,
                reply,
            },
            rx,
        )
        .await
    }

    /// Unwrap under `from`, wrap again under `to` with a fresh nonce.
    pub async fn rewrap(
        &self,
        from: Arc<WrappingKey>,
        to: Arc<WrappingKey>,
        file_id: FileId,
        algorithm: Algorithm,
        wrapped: WrappedKey,
    ) -> VaultResult<WrappedKey> {
        let (reply, rx) = oneshot::channel();
        self.submit(
            Job::Rewrap {
                from,
                to,
                file_id,
                algorithm,
                wrapped,
                reply,
            },
            rx,
        )
        .await
    }

    async fn submit<T>(&self, job: Job, rx: oneshot::Receiver<VaultResult<T>>) -> VaultResult<T> {
        self.tx
            .send(job)
            .await
            .map_err(|_| VaultError::Other(anyhow::anyhow!("crypto worker stopped")))?;
        rx.await
            .map_err(|_| VaultError::Other(anyhow::anyhow!("crypto job dropped without a result")))?
    }
}

async fn dispatch(mut rx: mpsc::Receiver<Job>, semaphore: Arc<Semaphore>) {
    while let Some(job) = rx.recv().await {
        if job.is_abandoned() {
            debug!(file_id = %job.file_id(), "crypto job skipped: requester gone");
            continue;
        }
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            // Requester may have left while this job waited for a permit
            if job.is_abandoned() {
                debug!(file_id = %job.file_id(), "crypto job skipped: requester gone");
                return;
            }
            job.run();
        });
    }
    debug!("crypto worker stopped: all handles dropped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use vault_core::{Identity, KsfParams};
    use vault_crypto::pake::{client, server};
    use vault_crypto::{derive_wrapping_key, KeyPurpose, ServerSetup};

    /// Wrapping keys only come out of a PAKE run; do a cheap one.
    fn test_key(password: &str) -> Arc<WrappingKey> {
        let ksf = KsfParams {
            mem_cost_kib: 256,
            time_cost: 1,
            parallelism: 1,
        };
        let setup = ServerSetup::generate();
        let identity = Identity::user("worker@example.com");
        let pw = SecretString::from(password);
        let (state, request) = client::start_registration(&pw).unwrap();
        let response = server::create_registration_response(&setup, &identity, &request).unwrap();
        let finish = client::finish_registration(state, &pw, &response, &identity, &ksf).unwrap();
        Arc::new(derive_wrapping_key(&finish.export_key, KeyPurpose::Master).unwrap())
    }

    #[tokio::test]
    async fn test_seal_open_roundtrip() {
        let worker = CryptoWorker::spawn(2);
        let key = test_key("pw");
        let file_id = FileId::new();

        let sealed = worker
            .seal(Arc::clone(&key), file_id, Algorithm::Aes256Gcm, b"payload".to_vec())
            .await
            .unwrap();
        let plaintext = worker
            .open(
                key,
                file_id,
                Algorithm::Aes256Gcm,
                sealed.wrapped,
                sealed.ciphertext,
                sealed.content_nonce,
            )
            .await
            .unwrap();
        assert_eq!(plaintext, b"payload");
    }

    #[tokio::test]
    async fn test_open_with_wrong_key_is_integrity_failure() {
        let worker = CryptoWorker::spawn(1);
        let file_id = FileId::new();
        let sealed = worker
            .seal(test_key("a"), file_id, Algorithm::Aes256Gcm, b"payload".to_vec())
            .await
            .unwrap();

        let err = worker
            .open(
                test_key("b"),
                file_id,
                Algorithm::Aes256Gcm,
                sealed.wrapped,
                sealed.ciphertext,
                sealed.content_nonce,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::IntegrityFailure(_)));
    }

    #[tokio::test]
    async fn test_rewrap_moves_key() {
        let worker = CryptoWorker::spawn(2);
        let old = test_key("old");
        let new = test_key("new");
        let file_id = FileId::new();
        let algorithm = Algorithm::ChaCha20Poly1305;

        let sealed = worker
            .seal(Arc::clone(&old), file_id, algorithm, b"data".to_vec())
            .await
            .unwrap();
        let rewrapped = worker
            .rewrap(Arc::clone(&old), Arc::clone(&new), file_id, algorithm, sealed.wrapped.clone())
            .await
            .unwrap();
        assert_ne!(rewrapped.wrap_nonce, sealed.wrapped.wrap_nonce);

        let plaintext = worker
            .open(
                new,
                file_id,
                algorithm,
                rewrapped,
                sealed.ciphertext.clone(),
                sealed.content_nonce.clone(),
            )
            .await
            .unwrap();
        assert_eq!(plaintext, b"data");
    }

    #[tokio::test]
    async fn test_many_concurrent_jobs() {
        let worker = CryptoWorker::spawn(2);
        let key = test_key("pw");

        let jobs = (0..32u8).map(|i| {
            let worker = worker.clone();
            let key = Arc::clone(&key);
            async move {
                worker
                    .seal(key, FileId::new(), Algorithm::Aes256Gcm, vec![i; 1024])
                    .await
            }
        });
        let results = futures::future::join_all(jobs).await;
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_abandoned_job_does_not_stall_worker() {
        let worker = CryptoWorker::spawn(1);
        let key = test_key("pw");

        // Requester gives up immediately
        let abandoned = worker.seal(
            Arc::clone(&key),
            FileId::new(),
            Algorithm::Aes256Gcm,
            vec![0; 1 << 20],
        );
        let _ = tokio::time::timeout(std::time::Duration::ZERO, abandoned).await;

        let sealed = worker
            .seal(key, FileId::new(), Algorithm::Aes256Gcm, b"next".to_vec())
            .await;
        assert!(sealed.is_ok());
    }
}
