//! Ciphertext blob storage over OpenDAL.
//!
//! Blobs are opaque bytes addressed by a storage path. The store never sees
//! plaintext or keys.

use opendal::{ErrorKind, Operator};
use vault_core::{FileId, VaultError, VaultResult};

#[derive(Debug, Clone)]
pub struct BlobStore {
    op: Operator,
}

impl BlobStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    /// Blob store backed by process memory (tests, demos).
    pub fn memory() -> VaultResult<Self> {
        let op = Operator::new(opendal::services::Memory::default())
            .map_err(|e| VaultError::Config(format!("memory operator: {e}")))?
            .finish();
        Ok(Self::new(op))
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Storage path for a file's ciphertext. Derived from the random file
    /// id only; the file name never reaches object storage.
    pub fn path_for(file_id: &FileId) -> String {
        format!("blobs/{file_id}")
    }

    pub async fn put(&self, path: &str, ciphertext: Vec<u8>) -> VaultResult<()> {
        let len = ciphertext.len();
        self.op
            .write(path, ciphertext)
            .await
            .map_err(|e| map_err(path, e))?;
        tracing::debug!(path, bytes = len, "blob stored");
        Ok(())
    }

    pub async fn get(&self, path: &str) -> VaultResult<Vec<u8>> {
        let buf = self.op.read(path).await.map_err(|e| map_err(path, e))?;
        Ok(buf.to_vec())
    }

    pub async fn delete(&self, path: &str) -> VaultResult<()> {
        self.op.delete(path).await.map_err(|e| map_err(path, e))
    }

    pub async fn exists(&self, path: &str) -> VaultResult<bool> {
        self.op.exists(path).await.map_err(|e| map_err(path, e))
    }
}

fn map_err(path: &str, e: opendal::Error) -> VaultError {
    if e.kind() == ErrorKind::NotFound {
        VaultError::NotFound(format!("blob {path}"))
    } else if e.is_temporary() {
        VaultError::TransientStoreFailure(format!("blob {path}: {e}"))
    } else {
        VaultError::Other(anyhow::anyhow!("blob {path}: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let blobs = BlobStore::memory().unwrap();
        let path = BlobStore::path_for(&FileId::new());

        blobs.put(&path, b"ciphertext".to_vec()).await.unwrap();
        assert!(blobs.exists(&path).await.unwrap());
        assert_eq!(blobs.get(&path).await.unwrap(), b"ciphertext");

        blobs.delete(&path).await.unwrap();
        assert!(!blobs.exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let blobs = BlobStore::memory().unwrap();
        let err = blobs.get("blobs/missing").await.unwrap_err();
        assert!(matches!(err, VaultError::NotFound(_)));
    }

    #[test]
    fn test_path_for_hides_name() {
        let file_id = FileId::new();
        let path = BlobStore::path_for(&file_id);
        assert_eq!(path, format!("blobs/{file_id}"));
    }
}
