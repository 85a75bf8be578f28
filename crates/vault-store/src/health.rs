//! Storage health check

use anyhow::Result;

use crate::BlobStore;

/// Verify the blob backend is reachable by listing the root
pub async fn check_health(blobs: &BlobStore) -> Result<()> {
    blobs
        .operator()
        .list("/")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("storage health check failed: {e}"))
}
