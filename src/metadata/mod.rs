//! Metadata Module - entities, queries and transactions
//!
//! Everything the cluster knows about files, versions, fragments,
//! permissions and servers lives here, in a sled-backed store that is
//! shared by every component of a node.

mod bootstrap;
mod entities;
pub mod lease;
mod queries;
mod store;

pub use bootstrap::{BootstrapOptions, BootstrapReport, DEFAULT_RETENTION_SECS, ROOT_FOLDER_NAME};
pub use entities::*;
pub use lease::{LeaseOutcome, REGISTRATION_LEASE};
pub use store::{abort, validate_name, KeyBuilder, MetadataStore, Record, TxResult, Txn};

/// Current wall clock as unix seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Fresh random identifier for files, data blobs and jobs
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
