//! OpenDAL Operator factory for blob storage backends

use anyhow::{Context, Result};
use opendal::Operator;
use vault_core::config::{expand_tilde, StorageConfig};

/// Build the operator named by `storage.backend`.
///
/// S3 credentials come from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`
/// (or the `VAULT_`-prefixed equivalents), never from the config file.
pub fn build_operator(storage: &StorageConfig) -> Result<Operator> {
    match storage.backend.as_str() {
        "memory" => Ok(Operator::new(opendal::services::Memory::default())
            .context("creating OpenDAL memory operator")?
            .finish()),
        "fs" => {
            let root = expand_tilde(std::path::Path::new(&storage.root));
            std::fs::create_dir_all(&root)
                .with_context(|| format!("creating blob root: {}", root.display()))?;
            let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
            Ok(Operator::new(builder)
                .context("creating OpenDAL fs operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .finish())
        }
        "s3" => {
            let access_key = std::env::var("AWS_ACCESS_KEY_ID")
                .or_else(|_| std::env::var("VAULT_ACCESS_KEY_ID"))
                .context("S3 credentials not set: export AWS_ACCESS_KEY_ID")?;
            let secret_key = std::env::var("AWS_SECRET_ACCESS_KEY")
                .or_else(|_| std::env::var("VAULT_SECRET_ACCESS_KEY"))
                .context("AWS_SECRET_ACCESS_KEY not set")?;
            build_s3_operator(storage, &access_key, &secret_key)
        }
        other => anyhow::bail!("unknown storage backend: {other}"),
    }
}

/// Build an S3 operator (path-style addressing, so MinIO and SeaweedFS work).
///
/// If `enforce_tls` is true and the endpoint uses HTTP, this returns an error.
/// Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_s3_operator(
    storage: &StorageConfig,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Operator> {
    if storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                storage.endpoint
            );
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted. \
             Set storage.enforce_tls = true and use HTTPS in production."
        );
    }

    // opendal 0.55: builders use the consuming pattern
    let builder = opendal::services::S3::default()
        .root(&storage.root)
        .endpoint(&storage.endpoint)
        .region(&storage.region)
        .bucket(&storage.bucket)
        .access_key_id(access_key_id)
        .secret_access_key(secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_config(endpoint: &str, enforce_tls: bool) -> StorageConfig {
        StorageConfig {
            backend: "s3".into(),
            root: "/".into(),
            endpoint: endpoint.into(),
            enforce_tls,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_memory_operator() {
        let storage = StorageConfig {
            backend: "memory".into(),
            ..Default::default()
        };
        assert!(build_operator(&storage).is_ok());
    }

    #[test]
    fn test_build_fs_operator_creates_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("blobs");
        let storage = StorageConfig {
            backend: "fs".into(),
            root: root.to_string_lossy().into_owned(),
            ..Default::default()
        };
        assert!(build_operator(&storage).is_ok());
        assert!(root.is_dir());
    }

    #[test]
    fn test_unknown_backend() {
        let storage = StorageConfig {
            backend: "ftp".into(),
            ..Default::default()
        };
        assert!(build_operator(&storage).is_err());
    }

    #[test]
    fn test_s3_http_allowed_without_enforce_tls() {
        let result = build_s3_operator(&s3_config("http://localhost:8333", false), "key", "secret");
        assert!(result.is_ok());
    }

    #[test]
    fn test_s3_http_rejected_with_enforce_tls() {
        let result = build_s3_operator(&s3_config("http://insecure:8333", true), "key", "secret");
        assert!(result.is_err(), "HTTP + enforce_tls must fail");
        assert!(
            result.unwrap_err().to_string().contains("enforce_tls"),
            "error message should mention enforce_tls"
        );
    }

    #[test]
    fn test_s3_https_with_enforce_tls() {
        let result =
            build_s3_operator(&s3_config("https://s3.example.com", true), "key", "secret");
        assert!(result.is_ok());
    }
}
