//! In-process transport for single-host clusters and tests

use super::protocol::{FragmentRequest, FragmentResponse};
use super::service::FragmentService;
use super::transport::NodeTransport;
use super::TransportError;
use crate::metadata::Server;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Routes requests straight to registered services by server name
#[derive(Default)]
pub struct MemoryTransport {
    services: RwLock<HashMap<String, Arc<FragmentService>>>,
    unreachable: RwLock<HashSet<String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: Arc<FragmentService>) {
        self.services
            .write()
            .insert(service.name().to_string(), service);
    }

    pub fn unregister(&self, name: &str) {
        self.services.write().remove(name);
    }

    /// Simulate a partition: requests to `name` fail until restored
    pub fn set_reachable(&self, name: &str, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(name);
        } else {
            unreachable.insert(name.to_string());
        }
    }
}

#[async_trait]
impl NodeTransport for MemoryTransport {
    async fn request(
        &self,
        server: &Server,
        request: FragmentRequest,
    ) -> Result<FragmentResponse, TransportError> {
        if self.unreachable.read().contains(&server.name) {
            return Err(TransportError::Unreachable(server.name.clone()));
        }
        let service = self
            .services
            .read()
            .get(&server.name)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(server.name.clone()))?;

        Ok(service.handle(request).await)
    }
}
