use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::VaultError;

/// Opaque identity key for a PAKE registration.
///
/// Users and shares live in separate namespaces (`user:` / `share:`) so a
/// generated share id can never shadow a user account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn user(email: &str) -> Self {
        Self(format!("user:{}", email.trim().to_lowercase()))
    }

    pub fn share(share_id: &ShareId) -> Self {
        Self(format!("share:{share_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Bytes used as the OPAQUE credential identifier.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_share(&self) -> bool {
        self.0.starts_with("share:")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(uuid::Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for FileId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| VaultError::InvalidInput(format!("file id {s:?}: {e}")))
    }
}

/// Random identifier of a share, handed to recipients out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareId(uuid::Uuid);

impl ShareId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ShareId {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| VaultError::InvalidInput(format!("share id {s:?}: {e}")))
    }
}

/// AEAD suite used for both content encryption and key wrapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl Algorithm {
    pub fn label(&self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "aes-256-gcm",
            Algorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Algorithm {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes-256-gcm" => Ok(Algorithm::Aes256Gcm),
            "chacha20-poly1305" => Ok(Algorithm::ChaCha20Poly1305),
            other => Err(VaultError::Config(format!("unknown algorithm: {other}"))),
        }
    }
}

/// Argon2id cost parameters for the password-hardening step inside OPAQUE.
///
/// Recorded in every registration so verification stays reproducible after
/// the deployment defaults change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KsfParams {
    /// Memory cost in KiB
    pub mem_cost_kib: u32,
    /// Iterations
    pub time_cost: u32,
    pub parallelism: u32,
}

impl KsfParams {
    /// Upper bound on memory cost (1 GiB). Share recipients stretch with
    /// whatever the share owner chose, so this caps what they can be made
    /// to spend.
    pub const MAX_MEM_COST_KIB: u32 = 1 << 20;
    pub const MAX_TIME_COST: u32 = 16;
    pub const MAX_PARALLELISM: u32 = 16;

    /// Reject parameters Argon2id would refuse, or that are out of bounds.
    /// Parameters arrive from clients, so nothing here may overflow.
    pub fn validate(&self) -> Result<(), VaultError> {
        let min_mem = u64::from(self.parallelism) * 8;
        let in_bounds = (1..=Self::MAX_TIME_COST).contains(&self.time_cost)
            && (1..=Self::MAX_PARALLELISM).contains(&self.parallelism)
            && u64::from(self.mem_cost_kib) >= min_mem
            && self.mem_cost_kib <= Self::MAX_MEM_COST_KIB;
        if !in_bounds {
            return Err(VaultError::InvalidInput(format!(
                "invalid Argon2id parameters: {self:?}"
            )));
        }
        Ok(())
    }
}

impl Default for KsfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 19456,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

/// A file key wrapped under a master or share key.
///
/// `wrapped_key` is useless without the exact `wrap_nonce`; the two are only
/// ever replaced together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    #[serde(with = "b64")]
    pub wrapped_key: Vec<u8>,
    #[serde(with = "b64")]
    pub wrap_nonce: Vec<u8>,
}

/// Server-side result of PAKE registration. Safe to store untrusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRecord {
    /// Serialized OPAQUE password file
    #[serde(with = "b64")]
    pub password_file: Vec<u8>,
    pub ksf: KsfParams,
    pub registered_at: u64,
}

/// Server login state bridging login start and login finish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginState {
    #[serde(with = "b64")]
    pub server_state: Vec<u8>,
    pub expires_at: u64,
    /// Fingerprint of the password file the state was built from; empty
    /// for an unknown identity. A rotation in between makes it stale.
    #[serde(with = "b64", default)]
    pub registration: Vec<u8>,
}

impl LoginState {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Metadata for one stored file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: FileId,
    pub owner: Identity,
    pub file_name: String,
    pub file_size: u64,
    /// Opaque object-storage handle
    pub storage_path: String,
    #[serde(with = "b64")]
    pub content_nonce: Vec<u8>,
    pub algorithm: Algorithm,
    pub wrapped: WrappedKey,
    pub created_at: u64,
}

/// An independently keyed view onto one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRecord {
    pub share_id: ShareId,
    pub file_id: FileId,
    pub owner: Identity,
    pub wrapped: WrappedKey,
    pub created_at: u64,
}

/// Serde helper: `Vec<u8>` as standard base64.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
