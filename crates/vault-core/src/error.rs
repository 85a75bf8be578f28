use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    /// Wrong password or unknown identity. The two are never distinguished.
    #[error("authentication failed")]
    AuthenticationFailure,

    /// Ephemeral login state missing, already consumed, or past its TTL.
    #[error("login state missing or expired")]
    ReplayOrExpiredState,

    /// AEAD tag mismatch on unwrap/decrypt. The detail is for local logs only.
    #[error("integrity check failed: {0}")]
    IntegrityFailure(String),

    /// A rotation was abandoned before commit; the pre-rotation state is intact.
    #[error("rotation aborted: {0}")]
    RotationAbort(String),

    /// Database / network failure. Retry the whole operation from the start.
    #[error("transient store failure: {0}")]
    TransientStoreFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A transaction precondition no longer holds.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VaultError {
    /// Whether the caller may retry the whole operation from the start.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VaultError::TransientStoreFailure(_) | VaultError::RotationAbort(_)
        )
    }

    /// Message safe to show a user or send over the network.
    ///
    /// Authentication, replay and integrity failures collapse into the same
    /// two generic messages so no oracle is exposed.
    pub fn public_message(&self) -> &'static str {
        match self {
            VaultError::AuthenticationFailure | VaultError::ReplayOrExpiredState => {
                "incorrect password"
            }
            VaultError::IntegrityFailure(_) => "unable to decrypt",
            VaultError::RotationAbort(_) | VaultError::TransientStoreFailure(_) => {
                "temporary failure, please try again"
            }
            VaultError::NotFound(_) => "not found",
            VaultError::Conflict(_) => "conflicting update, please try again",
            VaultError::InvalidInput(_) => "invalid request",
            VaultError::Config(_) | VaultError::Io(_) | VaultError::Other(_) => "internal error",
        }
    }
}
