//! vault-server: the untrusted half of e2e-vault
//!
//! Everything here handles only OPAQUE messages, password files, wrapped
//! keys and ciphertext. No function in this crate can decrypt a file.

pub mod auth;
pub mod cleanup;
pub mod service;
pub mod sessions;
pub mod setup;

pub use auth::{AuthService, PakeResponse, SessionGrant};
pub use cleanup::{spawn_cleanup, CleanupStats};
pub use service::{NewFile, NewShare, RewrappedKey, RotationCommit, StoredFile, VaultServer};
pub use sessions::{SessionRegistry, SessionToken};
pub use setup::load_or_generate;
