//! Whole-file content encryption under a file key
//!
//! Stored format:
//! ```text
//! blob:   [N bytes: ciphertext][16 bytes: tag]
//! record: content_nonce (12 bytes, random), algorithm tag
//! AAD = "e2e-vault/content/v1" || algorithm label || file_id (16 bytes)
//! ```
//!
//! Each file key encrypts exactly one plaintext, so nonce reuse under a key
//! cannot happen.

use vault_core::{Algorithm, FileId};

use crate::aead::{build_aad, open, random_nonce, seal};
use crate::error::CryptoError;
use crate::keys::FileKey;

const CONTENT_DOMAIN: &[u8] = b"e2e-vault/content/v1";

/// Ciphertext plus the nonce it was sealed with.
#[derive(Debug, Clone)]
pub struct SealedContent {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Encrypt file bytes with a fresh random nonce.
pub fn encrypt_content(
    file_key: &FileKey,
    file_id: &FileId,
    algorithm: Algorithm,
    plaintext: &[u8],
) -> Result<SealedContent, CryptoError> {
    let nonce = random_nonce();
    let aad = build_aad(CONTENT_DOMAIN, algorithm, file_id);
    let ciphertext = seal(algorithm, file_key.as_bytes(), &nonce, plaintext, &aad)?;

    Ok(SealedContent {
        ciphertext,
        nonce: nonce.to_vec(),
    })
}

/// Decrypt file bytes. Any bit flip in ciphertext, nonce, file id or
/// algorithm tag fails the whole call; no partial plaintext is returned.
pub fn decrypt_content(
    file_key: &FileKey,
    file_id: &FileId,
    algorithm: Algorithm,
    ciphertext: &[u8],
    nonce: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let aad = build_aad(CONTENT_DOMAIN, algorithm, file_id);
    open(algorithm, file_key.as_bytes(), nonce, ciphertext, &aad).inspect_err(|_| {
        tracing::debug!(%file_id, len = ciphertext.len(), "content decryption failed");
    })
}
