//! vault-crypto: client-side key hierarchy for e2e-vault
//!
//! Key hierarchy:
//! ```text
//! password ──OPAQUE (Argon2id KSF)──► export key (never leaves the client)
//!   ├── Master Key = HKDF-SHA256(export key, info="e2e-vault/master-key/v1")
//!   │   └── wraps File Key (per-file, 256-bit random)
//!   │       └── Content AEAD: AES-256-GCM (key=file_key, nonce=random_96bit, AAD=label||alg||file_id)
//!   └── Share Key  = HKDF-SHA256(share export key, info="e2e-vault/share-key/v1")
//!       └── wraps the same File Key, independently of the owner's master key
//! ```
//!
//! The server only ever sees OPAQUE messages, password files, wrapped keys
//! and ciphertext.

mod aead;
pub mod content;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod pake;

pub use content::{decrypt_content, encrypt_content, SealedContent};
pub use error::CryptoError;
pub use kdf::{derive_wrapping_key, ExportKey, KeyPurpose, WrappingKey};
pub use keys::{generate_file_key, unwrap_key, wrap_key, FileKey};
pub use pake::{ServerSetup, SessionKey};

/// Size of every symmetric key in the hierarchy (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM / ChaCha20-Poly1305 nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of the AEAD authentication tag
pub const TAG_SIZE: usize = 16;
