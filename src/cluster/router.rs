//! Local-or-remote shard I/O
//!
//! Shards hosted by this node are touched directly on disk; everything
//! else goes through the peer transport.

use super::transport::PeerClient;
use crate::metadata::MetadataStore;
use crate::storage::{ByteRange, FragmentKey, FragmentStore};
use crate::Result;

use std::sync::Arc;

#[derive(Clone)]
pub struct FragmentRouter {
    local_name: String,
    local: Arc<FragmentStore>,
    peers: PeerClient,
    store: Arc<MetadataStore>,
}

impl FragmentRouter {
    pub fn new(
        local_name: impl Into<String>,
        local: Arc<FragmentStore>,
        peers: PeerClient,
        store: Arc<MetadataStore>,
    ) -> Self {
        Self {
            local_name: local_name.into(),
            local,
            peers,
            store,
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn local_store(&self) -> &Arc<FragmentStore> {
        &self.local
    }

    pub fn peers(&self) -> &PeerClient {
        &self.peers
    }

    fn is_local(&self, server: &str) -> bool {
        server == self.local_name
    }

    /// Write a shard to `server`; returns its path there
    pub async fn put(&self, server: &str, key: &FragmentKey, data: Vec<u8>) -> Result<String> {
        if self.is_local(server) {
            return Ok(self.local.write(key, &data).await?);
        }
        let target = self.store.server(server)?;
        Ok(self.peers.put(&target, key, data).await?)
    }

    pub async fn fetch(&self, server: &str, path: &str, range: Option<ByteRange>) -> Result<Vec<u8>> {
        if self.is_local(server) {
            return Ok(self.local.read(path, range).await?);
        }
        let target = self.store.server(server)?;
        Ok(self.peers.fetch(&target, path, range).await?)
    }

    /// Delete a shard; false when it was already gone
    pub async fn delete(&self, server: &str, path: &str) -> Result<bool> {
        if self.is_local(server) {
            return Ok(self.local.delete(path).await?);
        }
        let target = self.store.server(server)?;
        Ok(self.peers.delete(&target, path).await?)
    }
}
