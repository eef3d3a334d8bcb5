//! In-process multi-node cluster for tests

use crate::cluster::{
    FragmentRouter, FragmentService, MemoryTransport, Membership, MembershipConfig, PeerClient,
};
use crate::gc::{GarbageCollector, GcConfig};
use crate::health::HealthMonitor;
use crate::metadata::{
    unix_now, BootstrapOptions, ClusterSettings, Fragment, MetadataStore, Server, ServerStatus,
    User,
};
use crate::permissions::PermissionEngine;
use crate::storage::{FragmentStore, ReedSolomonCodec};
use crate::versioning::{ContentIo, FileManager};
use crate::Result;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const ADMIN: &str = "admin";

const NODE_CAPACITY: u64 = 1 << 30;

pub struct TestNode {
    pub name: String,
    pub dir: TempDir,
    pub fragments: Arc<FragmentStore>,
    pub service: Arc<FragmentService>,
    pub router: FragmentRouter,
    pub membership: Membership,
}

pub struct TestCluster {
    pub store: Arc<MetadataStore>,
    pub transport: Arc<MemoryTransport>,
    pub nodes: Vec<TestNode>,
    pub settings: ClusterSettings,
}

impl TestCluster {
    /// `n` online nodes named s1..sn sharing one metadata store
    pub async fn new(n: usize) -> Self {
        Self::with_capacities(&vec![NODE_CAPACITY; n]).await
    }

    pub async fn with_capacities(capacities: &[u64]) -> Self {
        let store = Arc::new(MetadataStore::temporary().unwrap());
        let settings = store
            .bootstrap(&BootstrapOptions::default(), unix_now())
            .unwrap()
            .settings;
        let transport = Arc::new(MemoryTransport::new());
        let peers = PeerClient::new(transport.clone(), Duration::from_secs(5));

        let mut nodes = Vec::new();
        for (i, capacity) in capacities.iter().enumerate() {
            let name = format!("s{}", i + 1);
            let dir = TempDir::new().unwrap();
            let fragments = Arc::new(FragmentStore::open(dir.path(), *capacity).await.unwrap());
            let service = Arc::new(FragmentService::new(&name, fragments.clone(), store.clone()));
            transport.register(service.clone());

            let router = FragmentRouter::new(&name, fragments.clone(), peers.clone(), store.clone());
            let membership = Membership::new(
                store.clone(),
                &name,
                "127.0.0.1",
                7000 + i as u16,
                fragments.clone(),
                peers.clone(),
                MembershipConfig {
                    registration_backoff: Duration::from_millis(10),
                    ..Default::default()
                },
            );

            let server = Server {
                name: name.clone(),
                hostname: "127.0.0.1".to_string(),
                port: 7000 + i as u16,
                peer_id: None,
                status: ServerStatus::Online,
                free_space: fragments.free_space(),
                last_seen: unix_now(),
                started_at: unix_now(),
            };
            store.transaction(|txn| txn.put(&server)).unwrap();

            nodes.push(TestNode {
                name,
                dir,
                fragments,
                service,
                router,
                membership,
            });
        }

        Self {
            store,
            transport,
            nodes,
            settings,
        }
    }

    pub fn root_id(&self) -> String {
        self.settings.root_id.clone()
    }

    pub fn content(&self, i: usize) -> ContentIo {
        ContentIo::new(
            self.nodes[i].router.clone(),
            self.store.clone(),
            Arc::new(ReedSolomonCodec),
        )
    }

    pub fn files(&self, i: usize) -> FileManager {
        FileManager::new(self.store.clone(), self.content(i), &self.nodes[i].name)
    }

    pub fn collector(&self, i: usize) -> GarbageCollector {
        GarbageCollector::new(
            self.store.clone(),
            self.nodes[i].router.clone(),
            GcConfig::default(),
        )
    }

    pub fn health(&self, i: usize) -> HealthMonitor {
        HealthMonitor::new(
            self.files(i),
            self.collector(i),
            self.nodes[i].service.clone(),
        )
    }

    pub fn node(&self, name: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .unwrap_or_else(|| panic!("no node {}", name))
    }

    /// Remove a fragment's bytes behind the metadata's back
    pub async fn delete_shard(&self, fragment: &Fragment) {
        self.node(&fragment.server)
            .fragments
            .delete(&fragment.path)
            .await
            .unwrap();
    }

    /// Shard files on disk across every node
    pub async fn shard_count(&self) -> usize {
        let mut total = 0;
        for node in &self.nodes {
            total += node.fragments.list().await.unwrap().len();
        }
        total
    }

    pub fn add_user(&self, name: &str) -> Result<User> {
        PermissionEngine::new(self.store.clone()).create_user(ADMIN, name, false, Vec::new())
    }

    /// Overwrite a server's advertised free space
    pub fn set_free_space(&self, name: &str, free_space: u64) {
        let mut server = self.store.server(name).unwrap();
        server.free_space = free_space;
        self.store.transaction(|txn| txn.put(&server)).unwrap();
    }
}
