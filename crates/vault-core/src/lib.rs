//! vault-core: shared data model, configuration schema and error taxonomy
//! for the e2e-vault key hierarchy.

pub mod config;
pub mod error;
pub mod types;

pub use error::{VaultError, VaultResult};
pub use types::{
    Algorithm, FileId, FileRecord, Identity, KsfParams, LoginState, RegistrationRecord, ShareId,
    ShareRecord, WrappedKey,
};

/// Current Unix time in seconds.
pub fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
