use thiserror::Error;
use vault_core::VaultError;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// PAKE verification failed (wrong password, unknown identity, bad proof).
    #[error("authentication failed")]
    Authentication,

    /// AEAD tag mismatch or malformed ciphertext / wrapped key.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// A PAKE message or state could not be parsed.
    #[error("malformed protocol message: {0}")]
    Protocol(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),
}

impl From<CryptoError> for VaultError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::Authentication => VaultError::AuthenticationFailure,
            CryptoError::Integrity(detail) => VaultError::IntegrityFailure(detail),
            CryptoError::Protocol(detail) => VaultError::InvalidInput(detail),
            CryptoError::Kdf(detail) | CryptoError::Encrypt(detail) => {
                VaultError::Other(anyhow::anyhow!(detail))
            }
        }
    }
}

impl From<opaque_ke::errors::ProtocolError> for CryptoError {
    fn from(e: opaque_ke::errors::ProtocolError) -> Self {
        use opaque_ke::errors::ProtocolError;
        match e {
            ProtocolError::InvalidLoginError => CryptoError::Authentication,
            other => CryptoError::Protocol(format!("{other:?}")),
        }
    }
}
