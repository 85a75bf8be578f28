//! File key generation and key wrapping

use rand::RngCore;
use vault_core::{Algorithm, FileId, WrappedKey};
use zeroize::Zeroize;

use crate::aead::{build_aad, open, random_nonce, seal};
use crate::error::CryptoError;
use crate::kdf::WrappingKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

const WRAP_DOMAIN: &[u8] = b"e2e-vault/wrap/v1";

/// A per-file 256-bit content key. Zeroized on drop.
#[derive(Clone)]
pub struct FileKey {
    bytes: [u8; KEY_SIZE],
}

impl FileKey {
    pub(crate) fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit file key from the OS-seeded CSPRNG.
///
/// Called once per upload; byte-identical files still get distinct keys.
pub fn generate_file_key() -> FileKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    FileKey::from_bytes(bytes)
}

/// Wrap a file key under a master or share key with a fresh nonce.
///
/// The wrapped key is bound to `file_id` and `algorithm` through AAD, so it
/// only unwraps on the record it was produced for.
pub fn wrap_key(
    wrapping_key: &WrappingKey,
    file_key: &FileKey,
    file_id: &FileId,
    algorithm: Algorithm,
) -> Result<WrappedKey, CryptoError> {
    let nonce = random_nonce();
    let aad = build_aad(WRAP_DOMAIN, algorithm, file_id);
    let wrapped_key = seal(
        algorithm,
        wrapping_key.as_bytes(),
        &nonce,
        file_key.as_bytes(),
        &aad,
    )?;

    Ok(WrappedKey {
        wrapped_key,
        wrap_nonce: nonce.to_vec(),
    })
}

/// Unwrap a file key. Fails hard on any tag mismatch; there is no fallback.
pub fn unwrap_key(
    wrapping_key: &WrappingKey,
    wrapped: &WrappedKey,
    file_id: &FileId,
    algorithm: Algorithm,
) -> Result<FileKey, CryptoError> {
    if wrapped.wrapped_key.len() != KEY_SIZE + TAG_SIZE || wrapped.wrap_nonce.len() != NONCE_SIZE
    {
        tracing::debug!(
            %file_id,
            wrapped_len = wrapped.wrapped_key.len(),
            nonce_len = wrapped.wrap_nonce.len(),
            "unwrap: malformed wrapped key record"
        );
        return Err(CryptoError::Integrity(format!(
            "wrapped key record malformed: {} byte key, {} byte nonce",
            wrapped.wrapped_key.len(),
            wrapped.wrap_nonce.len()
        )));
    }

    let aad = build_aad(WRAP_DOMAIN, algorithm, file_id);
    let mut plaintext = open(
        algorithm,
        wrapping_key.as_bytes(),
        &wrapped.wrap_nonce,
        &wrapped.wrapped_key,
        &aad,
    )
    .inspect_err(|_| {
        tracing::debug!(%file_id, purpose = ?wrapping_key.purpose(), "unwrap: tag mismatch");
    })?;

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(FileKey::from_bytes(key_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::{derive_wrapping_key, ExportKey, KeyPurpose};
    use proptest::prelude::*;

    fn test_wrapping_key(seed: u8) -> WrappingKey {
        WrappingKey::from_bytes([seed; KEY_SIZE], KeyPurpose::Master)
    }

    #[test]
    fn test_file_key_generation() {
        let k1 = generate_file_key();
        let k2 = generate_file_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_key_wrap_unwrap_roundtrip() {
        let master = test_wrapping_key(42);
        let file_key = generate_file_key();
        let file_id = FileId::new();

        for algorithm in [Algorithm::Aes256Gcm, Algorithm::ChaCha20Poly1305] {
            let wrapped = wrap_key(&master, &file_key, &file_id, algorithm).unwrap();
            let unwrapped = unwrap_key(&master, &wrapped, &file_id, algorithm).unwrap();
            assert_eq!(file_key.as_bytes(), unwrapped.as_bytes());
        }
    }

    #[test]
    fn test_key_unwrap_wrong_master() {
        let file_key = generate_file_key();
        let file_id = FileId::new();

        let wrapped = wrap_key(&test_wrapping_key(1), &file_key, &file_id, Algorithm::Aes256Gcm)
            .unwrap();
        let result = unwrap_key(&test_wrapping_key(2), &wrapped, &file_id, Algorithm::Aes256Gcm);

        assert!(
            matches!(result, Err(CryptoError::Integrity(_))),
            "unwrap with wrong master key must fail with an integrity error"
        );
    }

    #[test]
    fn test_wrapped_key_bound_to_file() {
        let master = test_wrapping_key(3);
        let file_key = generate_file_key();
        let wrapped = wrap_key(&master, &file_key, &FileId::new(), Algorithm::Aes256Gcm).unwrap();

        let result = unwrap_key(&master, &wrapped, &FileId::new(), Algorithm::Aes256Gcm);
        assert!(result.is_err(), "wrapped key moved to another file must fail");
    }

    #[test]
    fn test_wrapped_key_bound_to_algorithm() {
        let master = test_wrapping_key(3);
        let file_key = generate_file_key();
        let file_id = FileId::new();
        let wrapped = wrap_key(&master, &file_key, &file_id, Algorithm::Aes256Gcm).unwrap();

        let result = unwrap_key(&master, &wrapped, &file_id, Algorithm::ChaCha20Poly1305);
        assert!(result.is_err());
    }

    #[test]
    fn test_wrap_nonce_fresh_each_time() {
        let master = test_wrapping_key(4);
        let file_key = generate_file_key();
        let file_id = FileId::new();

        let w1 = wrap_key(&master, &file_key, &file_id, Algorithm::Aes256Gcm).unwrap();
        let w2 = wrap_key(&master, &file_key, &file_id, Algorithm::Aes256Gcm).unwrap();
        assert_ne!(w1.wrap_nonce, w2.wrap_nonce);
        assert_ne!(w1.wrapped_key, w2.wrapped_key);
    }

    #[test]
    fn test_tampered_wrapped_key() {
        let master = test_wrapping_key(5);
        let file_key = generate_file_key();
        let file_id = FileId::new();
        let mut wrapped = wrap_key(&master, &file_key, &file_id, Algorithm::Aes256Gcm).unwrap();
        wrapped.wrapped_key[0] ^= 0x01;

        assert!(unwrap_key(&master, &wrapped, &file_id, Algorithm::Aes256Gcm).is_err());
    }

    #[test]
    fn test_mismatched_nonce_fails() {
        let master = test_wrapping_key(6);
        let file_id = FileId::new();
        let a = wrap_key(&master, &generate_file_key(), &file_id, Algorithm::Aes256Gcm).unwrap();
        let b = wrap_key(&master, &generate_file_key(), &file_id, Algorithm::Aes256Gcm).unwrap();

        let spliced = WrappedKey {
            wrapped_key: a.wrapped_key,
            wrap_nonce: b.wrap_nonce,
        };
        assert!(unwrap_key(&master, &spliced, &file_id, Algorithm::Aes256Gcm).is_err());
    }

    #[test]
    fn test_wrapped_key_size() {
        let master = test_wrapping_key(7);
        let wrapped =
            wrap_key(&master, &generate_file_key(), &FileId::new(), Algorithm::Aes256Gcm).unwrap();

        // key (32) + tag (16) = 48
        assert_eq!(wrapped.wrapped_key.len(), KEY_SIZE + TAG_SIZE);
        assert_eq!(wrapped.wrap_nonce.len(), NONCE_SIZE);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let master = test_wrapping_key(8);
        let file_id = FileId::new();
        let mut wrapped =
            wrap_key(&master, &generate_file_key(), &file_id, Algorithm::Aes256Gcm).unwrap();
        wrapped.wrap_nonce.truncate(8);

        assert!(matches!(
            unwrap_key(&master, &wrapped, &file_id, Algorithm::Aes256Gcm),
            Err(CryptoError::Integrity(_))
        ));
    }

    proptest! {
        #[test]
        fn wrap_unwrap_roundtrip_for_any_export_key(export in proptest::collection::vec(any::<u8>(), 32..=64)) {
            let key = derive_wrapping_key(&ExportKey::from_bytes(&export), KeyPurpose::Master).unwrap();
            let file_key = generate_file_key();
            let file_id = FileId::new();

            let wrapped = wrap_key(&key, &file_key, &file_id, Algorithm::Aes256Gcm).unwrap();
            let unwrapped = unwrap_key(&key, &wrapped, &file_id, Algorithm::Aes256Gcm).unwrap();
            prop_assert_eq!(unwrapped.as_bytes(), file_key.as_bytes());
        }

        #[test]
        fn unwrap_with_other_export_key_fails(
            a in proptest::collection::vec(any::<u8>(), 64),
            b in proptest::collection::vec(any::<u8>(), 64),
        ) {
            prop_assume!(a != b);
            let k1 = derive_wrapping_key(&ExportKey::from_bytes(&a), KeyPurpose::Master).unwrap();
            let k2 = derive_wrapping_key(&ExportKey::from_bytes(&b), KeyPurpose::Master).unwrap();
            let file_id = FileId::new();

            let wrapped = wrap_key(&k1, &generate_file_key(), &file_id, Algorithm::Aes256Gcm).unwrap();
            let result = unwrap_key(&k2, &wrapped, &file_id, Algorithm::Aes256Gcm);
            prop_assert!(matches!(result, Err(CryptoError::Integrity(_))));
        }
    }
}
