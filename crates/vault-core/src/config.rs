use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{VaultError, VaultResult};
use crate::types::{Algorithm, KsfParams};

/// Top-level configuration (loaded from vault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub server: ServerConfig,
    pub crypto: CryptoConfig,
    pub storage: StorageConfig,
    pub records: RecordsConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Lifetime of ephemeral login state between login start and finish
    pub login_state_ttl_secs: u64,
    /// Lifetime of an issued session token
    pub session_ttl_secs: u64,
    /// How often expired login state and sessions are purged
    pub cleanup_interval_secs: u64,
    /// Upper bound on a rotation commit before it is abandoned
    pub rotation_timeout_secs: u64,
    /// OPAQUE server setup file (base64). Generated once, never rotated.
    pub server_setup_file: PathBuf,
}

impl ServerConfig {
    pub fn login_state_ttl(&self) -> Duration {
        Duration::from_secs(self.login_state_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn rotation_timeout(&self) -> Duration {
        Duration::from_secs(self.rotation_timeout_secs)
    }
}

/// E2E encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// AEAD suite for new files: "aes-256-gcm" or "chacha20-poly1305"
    pub algorithm: String,
    /// Argon2id memory cost in KiB for new registrations
    pub argon2_mem_cost_kib: u32,
    /// Argon2id iterations for new registrations
    pub argon2_time_cost: u32,
    /// Argon2id parallelism for new registrations
    pub argon2_parallelism: u32,
    /// Concurrent crypto jobs on the blocking pool (0 = cpu count)
    pub worker_concurrency: usize,
    /// Earlier Argon2id defaults still held by older registrations. Unknown
    /// identities are answered from the same set so they blend in.
    pub legacy_ksf: Vec<KsfParams>,
}

impl CryptoConfig {
    pub fn algorithm(&self) -> VaultResult<Algorithm> {
        self.algorithm.parse()
    }

    pub fn ksf_params(&self) -> KsfParams {
        KsfParams {
            mem_cost_kib: self.argon2_mem_cost_kib,
            time_cost: self.argon2_time_cost,
            parallelism: self.argon2_parallelism,
        }
    }

    pub fn worker_concurrency(&self) -> usize {
        if self.worker_concurrency > 0 {
            return self.worker_concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        let ksf = KsfParams::default();
        Self {
            algorithm: Algorithm::default().label().into(),
            argon2_mem_cost_kib: ksf.mem_cost_kib,
            argon2_time_cost: ksf.time_cost,
            argon2_parallelism: ksf.parallelism,
            worker_concurrency: 0,
            legacy_ksf: Vec::new(),
        }
    }
}

/// Object storage for ciphertext blobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "memory", "fs" or "s3"
    pub backend: String,
    /// Root directory (fs) or key prefix (s3)
    pub root: String,
    /// S3 endpoint
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    /// Refuse plaintext HTTP S3 endpoints
    pub enforce_tls: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "fs".into(),
            root: "~/.local/share/e2e-vault/blobs".into(),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "e2e-vault".into(),
            enforce_tls: false,
        }
    }
}

/// Record database holding registrations, wrapped keys and shares
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsConfig {
    /// JSON record file; when unset records live in memory only
    pub path: Option<PathBuf>,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("~/.local/share/e2e-vault/records.json")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            login_state_ttl_secs: 300,
            session_ttl_secs: 3600,
            cleanup_interval_secs: 60,
            rotation_timeout_secs: 30,
            server_setup_file: PathBuf::from("~/.local/share/e2e-vault/server-setup"),
        }
    }
}

impl VaultConfig {
    /// Reject configurations that would only fail later, mid-protocol.
    pub fn validate(&self) -> VaultResult<()> {
        self.crypto.algorithm()?;
        if self.server.login_state_ttl_secs == 0 {
            return Err(VaultError::Config(
                "server.login_state_ttl_secs must be positive".into(),
            ));
        }
        if self.server.rotation_timeout_secs == 0 {
            return Err(VaultError::Config(
                "server.rotation_timeout_secs must be positive".into(),
            ));
        }
        self.crypto
            .ksf_params()
            .validate()
            .map_err(|e| VaultError::Config(e.to_string()))?;
        for ksf in &self.crypto.legacy_ksf {
            ksf.validate()
                .map_err(|e| VaultError::Config(format!("crypto.legacy_ksf: {e}")))?;
        }
        match self.storage.backend.as_str() {
            "memory" | "fs" | "s3" => Ok(()),
            other => Err(VaultError::Config(format!(
                "unknown storage backend: {other}"
            ))),
        }
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~/")) {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"));
        return home.join(rest);
    }
    path.to_path_buf()
}
