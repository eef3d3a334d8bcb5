//! Versioning Module - the create/update/finalize protocol for content
//!
//! Content is written to a fresh dataId on every write, so a version's
//! shards are never overwritten in place. Superseded and deleted versions
//! are only marked; the garbage collector reclaims their fragments.

mod content;
mod keys;
mod manager;
mod session;
mod tree;

pub use content::{ContentIo, FetchedShards};
pub use keys::{open_content_key, resolve_content_key, resolve_data_key, seal_content_key};
pub use manager::{FileManager, NewFileOptions};
pub use session::{WriteKind, WriteSession, WriteState};
