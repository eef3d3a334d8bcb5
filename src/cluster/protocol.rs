//! Fragment Protocol - Request/Response messages between storage nodes

use crate::storage::{ByteRange, FragmentKey};
use serde::{Deserialize, Serialize};

/// Requests one node sends another
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FragmentRequest {
    /// Store a shard
    Store {
        key: FragmentKey,

        /// Framed shard bytes
        data: Vec<u8>,
    },

    /// Read a stored shard, optionally a byte range of it
    Fetch {
        path: String,
        range: Option<ByteRange>,
    },

    /// Delete a stored shard
    Delete { path: String },

    /// Liveness probe
    Ping,

    /// Fragment rows assigned to the node whose files are absent
    Missing,

    /// Shard files on the node with no matching fragment row
    Orphaned,

    /// Ask the node to stop gracefully
    Shutdown,
}

impl FragmentRequest {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            FragmentRequest::Store { .. } => "store",
            FragmentRequest::Fetch { .. } => "fetch",
            FragmentRequest::Delete { .. } => "delete",
            FragmentRequest::Ping => "ping",
            FragmentRequest::Missing => "missing",
            FragmentRequest::Orphaned => "orphaned",
            FragmentRequest::Shutdown => "shutdown",
        }
    }
}

/// Responses to [`FragmentRequest`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FragmentResponse {
    /// Shard stored at `path` on the responding node
    Stored { path: String },

    /// Shard bytes
    Data { data: Vec<u8> },

    /// Delete acknowledged; `existed` is false when the shard was already gone
    Deleted { existed: bool },

    /// Liveness answer with the node's current free space
    Pong { server: String, free_space: u64 },

    Missing { fragments: Vec<FragmentKey> },

    Orphaned { paths: Vec<String> },

    ShuttingDown,

    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Error codes for fragment operations
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// Shard not found
    NotFound,

    /// Not enough storage space
    InsufficientSpace,

    /// Invalid request
    InvalidRequest,

    /// Internal error
    InternalError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_survive_serde() {
        let request = FragmentRequest::Fetch {
            path: "fragments/ab/abcd_1_0.shard".into(),
            range: Some(ByteRange { offset: 56, length: 10 }),
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: FragmentRequest = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, FragmentRequest::Fetch { range: Some(r), .. } if r.offset == 56));
        assert_eq!(back.kind(), "fetch");

        let response = FragmentResponse::Error {
            code: ErrorCode::NotFound,
            message: "gone".into(),
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("NotFound"));
    }
}
