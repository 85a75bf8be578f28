//! vault-client: the trusted half of e2e-vault
//!
//! Passwords, export keys, master keys, share keys and file keys exist only
//! here. The server receives OPAQUE messages, wrapped keys and ciphertext.
//!
//! ```text
//! login ──► VaultSession { token, master key }
//!             │
//!             ├─ upload / download ──► CryptoWorker (blocking pool)
//!             ├─ change_password   ──► rewrap plan ──► one server commit
//!             └─ create_share      ──► share key wraps one file key
//! ```

pub mod client;
pub mod rotation;
pub mod session;
pub mod shares;
pub mod worker;

pub use client::VaultClient;
pub use rotation::RotationPlan;
pub use session::VaultSession;
pub use worker::{CryptoWorker, SealedFile};
