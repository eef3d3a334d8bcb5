//! Storage Module - shard codec and local fragment storage
//!
//! Handles content encryption, erasure coding into framed shards, and the
//! on-disk shard directory each node offers to the cluster.

pub mod codec;
mod erasure;
mod fragment_store;

pub use codec::{ContentKey, EncodedBlob, ReedSolomonCodec, ShardCodec, ShardHeader};
pub use erasure::{
    ErasureCoder, ErasureConfig, DEFAULT_DATA_SHARDS, DEFAULT_KEY_THRESHOLD,
    DEFAULT_PARITY_SHARDS,
};
pub use fragment_store::{ByteRange, FragmentKey, FragmentStore, StoredShard};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("Not enough fragments available: have {have}, need {need}")]
    InsufficientFragments { have: usize, need: usize },

    #[error("Fragment integrity check failed")]
    IntegrityCheckFailed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Insufficient space: needed {needed}, available {available}")]
    InsufficientSpace { needed: u64, available: u64 },

    #[error("Invalid fragment path: {0}")]
    InvalidPath(String),

    #[error("Invalid shard: {0}")]
    InvalidShard(String),
}
