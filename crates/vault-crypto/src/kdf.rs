//! Key derivation: PAKE export key → wrapping key (HKDF-SHA256)
//!
//! The export key is already the output of OPAQUE's Argon2id stretching, so
//! it is expanded with HKDF only. A password is never hashed here.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;
use crate::KEY_SIZE;

/// What a derived key is for. Each purpose has its own HKDF info label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// Owner's master key; wraps every file key the owner holds.
    Master,
    /// Per-share key; wraps exactly one file key.
    Share,
}

impl KeyPurpose {
    fn info(&self) -> &'static [u8] {
        match self {
            KeyPurpose::Master => b"e2e-vault/master-key/v1",
            KeyPurpose::Share => b"e2e-vault/share-key/v1",
        }
    }
}

/// Private output of a successful OPAQUE registration or login.
///
/// Only constructed by the PAKE client; zeroized on drop.
pub struct ExportKey {
    bytes: Zeroizing<Vec<u8>>,
}

impl ExportKey {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bytes: Zeroizing::new(bytes.to_vec()),
        }
    }
}

impl std::fmt::Debug for ExportKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A 256-bit key-wrapping key (master or share key).
///
/// Non-exportable: the bytes have no public accessor and no serialization,
/// so the only things a holder can do are `wrap_key` / `unwrap_key`.
/// Zeroized on drop.
pub struct WrappingKey {
    bytes: [u8; KEY_SIZE],
    purpose: KeyPurpose,
}

impl WrappingKey {
    pub(crate) fn from_bytes(bytes: [u8; KEY_SIZE], purpose: KeyPurpose) -> Self {
        Self { bytes, purpose }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub fn purpose(&self) -> KeyPurpose {
        self.purpose
    }
}

impl Drop for WrappingKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingKey")
            .field("purpose", &self.purpose)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Expand an export key into a wrapping key for the given purpose.
pub fn derive_wrapping_key(
    export_key: &ExportKey,
    purpose: KeyPurpose,
) -> Result<WrappingKey, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, &export_key.bytes);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(purpose.info(), &mut okm)
        .map_err(|e| CryptoError::Kdf(format!("HKDF expand failed: {e}")))?;
    Ok(WrappingKey::from_bytes(okm, purpose))
}

/// Argon2id instance used as OPAQUE's key-stretching function.
pub(crate) fn build_ksf(
    params: &vault_core::KsfParams,
) -> Result<argon2::Argon2<'static>, CryptoError> {
    let argon2_params = argon2::Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        None,
    )
    .map_err(|e| CryptoError::Kdf(format!("invalid Argon2id params: {e}")))?;

    Ok(argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2_params,
    ))
}
