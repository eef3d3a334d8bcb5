//! Transport seam between storage nodes and its typed client

use super::protocol::{ErrorCode, FragmentRequest, FragmentResponse};
use super::TransportError;
use crate::metadata::Server;
use crate::storage::{ByteRange, FragmentKey};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Delivers one request to a peer node and returns its answer
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn request(
        &self,
        server: &Server,
        request: FragmentRequest,
    ) -> Result<FragmentResponse, TransportError>;
}

fn unexpected(server: &Server, response: FragmentResponse) -> TransportError {
    match response {
        FragmentResponse::Error { code, message } => TransportError::Remote {
            server: server.name.clone(),
            code,
            message,
        },
        other => TransportError::Protocol(format!(
            "unexpected response from {}: {:?}",
            server.name, other
        )),
    }
}

/// Typed calls over a [`NodeTransport`], each bounded by a deadline
#[derive(Clone)]
pub struct PeerClient {
    transport: Arc<dyn NodeTransport>,
    timeout: Duration,
}

impl PeerClient {
    pub fn new(transport: Arc<dyn NodeTransport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    async fn call(&self, server: &Server, request: FragmentRequest) -> Result<FragmentResponse, TransportError> {
        let kind = request.kind();
        match tokio::time::timeout(self.timeout, self.transport.request(server, request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("{} request to {} timed out", kind, server.name);
                Err(TransportError::Timeout(server.name.clone()))
            }
        }
    }

    /// Store a shard on `server`; returns its path there
    pub async fn put(&self, server: &Server, key: &FragmentKey, data: Vec<u8>) -> Result<String, TransportError> {
        let request = FragmentRequest::Store {
            key: key.clone(),
            data,
        };
        match self.call(server, request).await? {
            FragmentResponse::Stored { path } => Ok(path),
            other => Err(unexpected(server, other)),
        }
    }

    pub async fn fetch(
        &self,
        server: &Server,
        path: &str,
        range: Option<ByteRange>,
    ) -> Result<Vec<u8>, TransportError> {
        let request = FragmentRequest::Fetch {
            path: path.to_string(),
            range,
        };
        match self.call(server, request).await? {
            FragmentResponse::Data { data } => Ok(data),
            other => Err(unexpected(server, other)),
        }
    }

    pub async fn delete(&self, server: &Server, path: &str) -> Result<bool, TransportError> {
        let request = FragmentRequest::Delete {
            path: path.to_string(),
        };
        match self.call(server, request).await? {
            FragmentResponse::Deleted { existed } => Ok(existed),
            other => Err(unexpected(server, other)),
        }
    }

    /// Bare reachability probe
    pub async fn ping(&self, server: &Server) -> bool {
        match self.call(server, FragmentRequest::Ping).await {
            Ok(FragmentResponse::Pong { .. }) => true,
            Ok(other) => {
                tracing::debug!("Unexpected ping answer from {}: {:?}", server.name, other);
                false
            }
            Err(e) => {
                tracing::debug!("Ping to {} failed: {}", server.name, e);
                false
            }
        }
    }

    pub async fn missing(&self, server: &Server) -> Result<Vec<FragmentKey>, TransportError> {
        match self.call(server, FragmentRequest::Missing).await? {
            FragmentResponse::Missing { fragments } => Ok(fragments),
            other => Err(unexpected(server, other)),
        }
    }

    pub async fn orphaned(&self, server: &Server) -> Result<Vec<String>, TransportError> {
        match self.call(server, FragmentRequest::Orphaned).await? {
            FragmentResponse::Orphaned { paths } => Ok(paths),
            other => Err(unexpected(server, other)),
        }
    }

    pub async fn shutdown(&self, server: &Server) -> Result<(), TransportError> {
        match self.call(server, FragmentRequest::Shutdown).await? {
            FragmentResponse::ShuttingDown => Ok(()),
            other => Err(unexpected(server, other)),
        }
    }
}

impl TransportError {
    /// The remote node reported the shard as absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TransportError::Remote {
                code: ErrorCode::NotFound,
                ..
            }
        )
    }
}
