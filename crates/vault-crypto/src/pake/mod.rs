//! OPAQUE password-authenticated key exchange (opaque-ke 3)
//!
//! Registration (client ↔ server):
//! ```text
//! client::start_registration(pw)          → RegistrationRequest
//! server::create_registration_response()  → RegistrationResponse
//! client::finish_registration(pw)         → RegistrationUpload + export key
//! server::finish_registration(upload)     → password file (stored)
//! ```
//! Login:
//! ```text
//! client::start_login(pw)                 → CredentialRequest
//! server::start_login(password file?)     → CredentialResponse + server state (ephemeral)
//! client::finish_login(pw)                → CredentialFinalization + export key
//! server::finish_login(state)             → session key, or failure
//! ```
//! The password and export key never leave the client. The server stores
//! only the password file, which is not a password-equivalent verifier.

pub mod client;
pub mod server;

use hkdf::Hkdf;
use opaque_ke::{CipherSuite, Identifiers};
use rand::rngs::OsRng;
use sha2::Sha256;
use vault_core::Identity;
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Ristretto255 OPRF and 3DH key exchange, Argon2id key stretching.
pub struct VaultCipherSuite;

impl CipherSuite for VaultCipherSuite {
    type OprfCs = opaque_ke::Ristretto255;
    type KeGroup = opaque_ke::Ristretto255;
    type KeyExchange = opaque_ke::key_exchange::tripledh::TripleDh;
    type Ksf = argon2::Argon2<'static>;
}

const SERVER_IDENTIFIER: &[u8] = b"e2e-vault";

/// Both sides must bind the same identifiers or the login MAC fails.
pub(crate) fn identifiers(identity: &Identity) -> Identifiers<'_> {
    Identifiers {
        client: Some(identity.as_bytes()),
        server: Some(SERVER_IDENTIFIER),
    }
}

/// Long-lived server secret (OPRF seed + server keypair).
///
/// Constant for the whole deployment: replacing it invalidates every stored
/// password file.
pub struct ServerSetup(opaque_ke::ServerSetup<VaultCipherSuite>);

impl ServerSetup {
    pub fn generate() -> Self {
        Self(opaque_ke::ServerSetup::<VaultCipherSuite>::new(&mut OsRng))
    }

    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.0.serialize().to_vec())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        opaque_ke::ServerSetup::<VaultCipherSuite>::deserialize(bytes)
            .map(Self)
            .map_err(|e| CryptoError::Protocol(format!("server setup: {e:?}")))
    }

    pub(crate) fn inner(&self) -> &opaque_ke::ServerSetup<VaultCipherSuite> {
        &self.0
    }

    /// Keyed, deterministic pick in `0..n` for `identity`. Stable for the
    /// life of the setup and unpredictable without it.
    pub fn identity_choice(&self, identity: &Identity, n: usize) -> usize {
        if n <= 1 {
            return 0;
        }
        let secret = self.to_bytes();
        let hkdf = Hkdf::<Sha256>::new(Some(b"e2e-vault/identity-choice/v1"), &secret);
        let mut okm = [0u8; 8];
        // 8 bytes is always a valid HKDF-SHA256 output length
        if hkdf.expand(identity.as_bytes(), &mut okm).is_err() {
            return 0;
        }
        (u64::from_le_bytes(okm) % n as u64) as usize
    }
}

impl std::fmt::Debug for ServerSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServerSetup([REDACTED])")
    }
}

/// Key agreed by client and server at the end of a login. Proof of the
/// exchange only; it never encrypts vault content.
#[derive(PartialEq, Eq)]
pub struct SessionKey(Zeroizing<Vec<u8>>);

impl SessionKey {
    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        Self(Zeroizing::new(bytes.to_vec()))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}
