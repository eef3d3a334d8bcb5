//! ShardVault Core - erasure-coded distributed file store
//!
//! This crate provides the metadata and fragment lifecycle engine of a
//! cluster that splits files into encrypted data and parity shards spread
//! over independent storage nodes: versioned writes, permission
//! inheritance, reference-counted garbage collection, cluster membership,
//! and the maintenance jobs that detect and repair broken fragments.

pub mod cluster;
pub mod config;
pub mod crypto;
pub mod gc;
pub mod health;
pub mod metadata;
pub mod node;
pub mod permissions;
pub mod storage;
pub mod versioning;

#[cfg(test)]
pub(crate) mod testing;

pub use config::NodeConfig;
pub use node::StorageNode;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use thiserror::Error;

/// Main error type for ShardVault operations
#[derive(Error, Debug)]
pub enum ShardVaultError {
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] cluster::TransportError),

    #[error("Metadata store error: {0}")]
    Store(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Content {data_id} unrecoverable: {good} good fragments, {needed} needed")]
    ContentUnrecoverable {
        data_id: String,
        good: usize,
        needed: usize,
    },

    #[error("Password required for file {0}")]
    PasswordRequired(String),

    #[error("Job {job} already running on {holder} since {since}")]
    JobAlreadyRunning {
        job: String,
        holder: String,
        since: i64,
    },

    #[error("Job {job} held by {holder} since {since} is stale")]
    StaleJob {
        job: String,
        holder: String,
        since: i64,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ShardVaultError>;

/// Caller-facing classification of every failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Conflict,
    ContentUnrecoverable,
    PasswordRequired,
    JobAlreadyRunning,
    StaleJobWarning,
    TransportIo,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    /// Whether the failed operation may succeed if retried later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Conflict | ErrorKind::JobAlreadyRunning | ErrorKind::TransportIo
        )
    }
}

impl ShardVaultError {
    pub fn kind(&self) -> ErrorKind {
        use storage::StorageError as S;

        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::ContentUnrecoverable { .. } => ErrorKind::ContentUnrecoverable,
            Self::PasswordRequired(_) => ErrorKind::PasswordRequired,
            Self::JobAlreadyRunning { .. } => ErrorKind::JobAlreadyRunning,
            Self::StaleJob { .. } => ErrorKind::StaleJobWarning,
            Self::InvalidInput(_) | Self::Config(_) => ErrorKind::InvalidInput,
            Self::Transport(_) | Self::Io(_) => ErrorKind::TransportIo,
            Self::Storage(e) => match e {
                S::FileNotFound(_) => ErrorKind::NotFound,
                S::InsufficientFragments { .. } => ErrorKind::ContentUnrecoverable,
                S::Io(_) | S::InsufficientSpace { .. } | S::IntegrityCheckFailed => {
                    ErrorKind::TransportIo
                }
                S::InvalidPath(_) => ErrorKind::InvalidInput,
                _ => ErrorKind::Internal,
            },
            Self::Crypto(_) | Self::Store(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} {}", what, id))
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Structured failure handed to the controller layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&ShardVaultError> for ErrorReport {
    fn from(e: &ShardVaultError) -> Self {
        e.report()
    }
}

/// Run a request handler, turning errors and panics into an [`ErrorReport`]
pub async fn guarded<T, F>(fut: F) -> std::result::Result<T, ErrorReport>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.report()),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "request handler panicked".to_string());
            tracing::error!("Request handler panicked: {}", message);
            Err(ErrorReport {
                kind: ErrorKind::Internal,
                message: format!("Internal error: {}", message),
            })
        }
    }
}

/// Install the global fmt subscriber; `RUST_LOG` overrides `default_filter`
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
