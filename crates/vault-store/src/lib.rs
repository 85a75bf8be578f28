//! vault-store: persistence boundaries for e2e-vault
//!
//! - [`RecordStore`]: registrations, ephemeral login state, file and share
//!   records, and multi-row transactions with preconditions.
//! - [`BlobStore`]: opaque ciphertext blobs over an OpenDAL operator.
//!
//! Nothing stored through either boundary can decrypt content on its own.

pub mod blobs;
pub mod health;
pub mod operator;
pub mod records;

pub use blobs::BlobStore;
pub use health::check_health;
pub use operator::build_operator;
pub use records::{LocalRecordStore, RecordStore, TxOp};
