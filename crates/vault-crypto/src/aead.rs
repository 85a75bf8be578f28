//! AEAD dispatch over the configured suite.
//!
//! Both suites take a 256-bit key and a 96-bit nonce, so wrapped keys and
//! content nonces have the same shape whichever suite a file uses.

use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305,
};
use rand::RngCore;
use vault_core::{Algorithm, FileId};

use crate::error::CryptoError;
use crate::{KEY_SIZE, NONCE_SIZE};

/// Fresh random nonce from the OS-seeded thread RNG.
pub(crate) fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Build AAD: domain label || algorithm label || file_id (16 bytes)
pub(crate) fn build_aad(domain: &[u8], algorithm: Algorithm, file_id: &FileId) -> Vec<u8> {
    let label = algorithm.label().as_bytes();
    let mut aad = Vec::with_capacity(domain.len() + label.len() + 16);
    aad.extend_from_slice(domain);
    aad.extend_from_slice(label);
    aad.extend_from_slice(file_id.as_bytes());
    aad
}

pub(crate) fn seal(
    algorithm: Algorithm,
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    msg: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let payload = Payload { msg, aad };
    let sealed = match algorithm {
        Algorithm::Aes256Gcm => {
            Aes256Gcm::new(key.into()).encrypt(aes_gcm::Nonce::from_slice(nonce), payload)
        }
        Algorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(key.into())
            .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
    };
    sealed.map_err(|e| CryptoError::Encrypt(format!("{algorithm} seal: {e}")))
}

/// Decrypt and verify. Never returns partial plaintext.
pub(crate) fn open(
    algorithm: Algorithm,
    key: &[u8; KEY_SIZE],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        tracing::debug!(len = nonce.len(), "rejecting malformed nonce");
        return Err(CryptoError::Integrity(format!(
            "nonce has wrong size: {} bytes (expected {NONCE_SIZE})",
            nonce.len()
        )));
    }
    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    let opened = match algorithm {
        Algorithm::Aes256Gcm => {
            Aes256Gcm::new(key.into()).decrypt(aes_gcm::Nonce::from_slice(nonce), payload)
        }
        Algorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new(key.into())
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload),
    };
    opened.map_err(|_| {
        CryptoError::Integrity(format!(
            "{algorithm} tag mismatch: wrong key or tampered data"
        ))
    })
}
