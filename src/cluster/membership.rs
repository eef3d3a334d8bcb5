//! Server roster maintenance
//!
//! Registration is gated by the registration lease so that at most one
//! server sits in `Starting` at a time. A lease left behind by a crashed
//! node expires and is taken over with a warning.

use super::transport::PeerClient;
use crate::metadata::{
    abort, unix_now, LeaseOutcome, MetadataStore, Server, ServerStatus, REGISTRATION_LEASE,
};
use crate::storage::FragmentStore;
use crate::{Result, ShardVaultError};

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Quick polls of the registration lease before waiting out its holder
    pub registration_attempts: u32,

    /// Sleep between registration attempts
    pub registration_backoff: Duration,

    /// Age after which a registration lease is considered stale
    pub registration_lease_secs: i64,

    pub heartbeat_interval: Duration,

    /// Concurrent liveness probes
    pub probe_width: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            registration_attempts: 30,
            registration_backoff: Duration::from_millis(500),
            registration_lease_secs: 60,
            heartbeat_interval: Duration::from_secs(30),
            probe_width: 10,
        }
    }
}

/// What one registration or heartbeat run did
#[derive(Debug, Clone)]
pub struct RegistrationReport {
    pub server: Server,

    /// Peers found unreachable and marked offline
    pub marked_offline: Vec<String>,

    /// The registration lease was taken over from a stale holder
    pub stale_takeover: Option<String>,
}

/// This node's view of and contribution to the roster
#[derive(Clone)]
pub struct Membership {
    store: Arc<MetadataStore>,
    name: String,
    hostname: String,
    port: u16,
    peer_id: Option<String>,
    fragments: Arc<FragmentStore>,
    peers: PeerClient,
    config: MembershipConfig,
}

impl Membership {
    pub fn new(
        store: Arc<MetadataStore>,
        name: impl Into<String>,
        hostname: impl Into<String>,
        port: u16,
        fragments: Arc<FragmentStore>,
        peers: PeerClient,
        config: MembershipConfig,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            hostname: hostname.into(),
            port,
            peer_id: None,
            fragments,
            peers,
            config,
        }
    }

    /// Advertise a libp2p peer id in the roster entry
    pub fn with_peer_id(mut self, peer_id: impl Into<String>) -> Self {
        self.peer_id = Some(peer_id.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    /// Join the roster (`initial_run`) or refresh this node's entry.
    ///
    /// The initial run waits for the registration lease, enters `Starting`,
    /// probes every online peer and finally flips to `Online`. Later runs
    /// only refresh free space, probe peers and restore `Online`.
    pub async fn register_server(&self, initial_run: bool) -> Result<RegistrationReport> {
        if !initial_run {
            match self.store.get::<Server>(&Server::key_for(&self.name))? {
                Some(server) if server.status != ServerStatus::Stopping => {
                    return self.heartbeat().await
                }
                Some(_) => {
                    return Err(ShardVaultError::Conflict(format!(
                        "server {} is stopping",
                        self.name
                    )))
                }
                None => {
                    tracing::info!("{} has no roster entry yet, registering", self.name);
                }
            }
        }

        let outcome = self.wait_for_registration_lease().await?;
        let stale_takeover = match &outcome {
            LeaseOutcome::TookOverStale { previous, .. } => {
                self.demote_stuck_starter(&previous.owner)?;
                Some(previous.owner.clone())
            }
            LeaseOutcome::Acquired(_) => None,
        };

        let result = self.register_holding_lease().await;

        if let Err(e) = self.store.release_lease(REGISTRATION_LEASE, &self.name) {
            tracing::warn!("Failed to release registration lease: {}", e);
        }

        let (server, marked_offline) = result?;
        tracing::info!(
            "Server {} online with {} bytes free ({} peers marked offline)",
            server.name,
            server.free_space,
            marked_offline.len()
        );

        Ok(RegistrationReport {
            server,
            marked_offline,
            stale_takeover,
        })
    }

    /// Poll for the registration lease.
    ///
    /// After `registration_attempts` quick polls the node waits out the
    /// holder's lease instead, so a holder that crashed while registering
    /// is always taken over once its lease is stale.
    async fn wait_for_registration_lease(&self) -> Result<LeaseOutcome> {
        let attempts = self.config.registration_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let holder = match self.store.acquire_lease(
                REGISTRATION_LEASE,
                &self.name,
                self.config.registration_lease_secs,
                unix_now(),
            ) {
                Ok(outcome) => return Ok(outcome),
                Err(ShardVaultError::JobAlreadyRunning { holder, .. }) => holder,
                Err(e) => return Err(e),
            };

            if attempt < attempts {
                tracing::debug!(
                    "{} waiting for {} to finish registering (attempt {}/{})",
                    self.name,
                    holder,
                    attempt,
                    attempts
                );
                tokio::time::sleep(self.config.registration_backoff).await;
                continue;
            }

            let remaining = match self.store.lease(REGISTRATION_LEASE)? {
                Some(lease) => (lease.expires_at - unix_now()).max(0) as u64,
                None => 0,
            };
            tracing::warn!(
                "{} still holds the registration lease; {} waits {}s for it to go stale",
                holder,
                self.name,
                remaining + 1
            );
            tokio::time::sleep(Duration::from_secs(remaining + 1)).await;
        }
    }

    /// A node whose lease went stale never left `Starting`
    fn demote_stuck_starter(&self, owner: &str) -> Result<()> {
        if owner == self.name {
            return Ok(());
        }
        self.store.transaction(|txn| {
            if let Some(mut server) = txn.get::<Server>(&Server::key_for(owner))? {
                if server.status == ServerStatus::Starting {
                    server.status = ServerStatus::Error;
                    txn.put(&server)?;
                }
            }
            Ok(())
        })?;
        tracing::warn!("Server {} was stuck starting; marked as error", owner);
        Ok(())
    }

    async fn register_holding_lease(&self) -> Result<(Server, Vec<String>)> {
        let now = unix_now();
        let starting = Server {
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            port: self.port,
            peer_id: self.peer_id.clone(),
            status: ServerStatus::Starting,
            free_space: self.fragments.free_space(),
            last_seen: now,
            started_at: now,
        };
        self.store.transaction(|txn| txn.put(&starting))?;

        let marked_offline = self.probe_peers().await?;
        let server = self.set_status(ServerStatus::Online)?;
        Ok((server, marked_offline))
    }

    async fn heartbeat(&self) -> Result<RegistrationReport> {
        let marked_offline = self.probe_peers().await?;
        let free_space = self.fragments.free_space();
        let now = unix_now();

        let server = self.store.transaction(|txn| {
            let mut server: Server = txn.require(&Server::key_for(&self.name), "server")?;
            if server.status != ServerStatus::Online {
                tracing::info!("{} back online (was {:?})", self.name, server.status);
            }
            server.status = ServerStatus::Online;
            server.free_space = free_space;
            server.last_seen = now;
            if self.peer_id.is_some() {
                server.peer_id = self.peer_id.clone();
            }
            txn.put(&server)?;
            Ok(server)
        })?;

        Ok(RegistrationReport {
            server,
            marked_offline,
            stale_takeover: None,
        })
    }

    /// Probe every other online peer; unreachable ones go offline
    async fn probe_peers(&self) -> Result<Vec<String>> {
        let peers: Vec<Server> = self
            .store
            .online_servers()?
            .into_iter()
            .filter(|s| s.name != self.name)
            .collect();

        let results: Vec<(Server, bool)> = stream::iter(peers)
            .map(|server| async move {
                let reachable = self.peers.ping(&server).await;
                (server, reachable)
            })
            .buffer_unordered(self.config.probe_width.max(1))
            .collect()
            .await;

        let mut marked = Vec::new();
        for (server, reachable) in results {
            if reachable {
                continue;
            }
            tracing::warn!("Peer {} unreachable, marking offline", server.name);
            let changed = self.store.transaction(|txn| {
                match txn.get::<Server>(&Server::key_for(&server.name))? {
                    Some(mut current) if current.status == ServerStatus::Online => {
                        current.status = ServerStatus::Offline;
                        txn.put(&current)?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })?;
            if changed {
                marked.push(server.name);
            }
        }
        marked.sort();
        Ok(marked)
    }

    fn set_status(&self, status: ServerStatus) -> Result<Server> {
        let now = unix_now();
        self.store.transaction(|txn| {
            let mut server: Server = txn.require(&Server::key_for(&self.name), "server")?;
            server.status = status;
            server.last_seen = now;
            txn.put(&server)?;
            Ok(server)
        })
    }

    /// Announce that this node is shutting down
    pub fn mark_stopping(&self) -> Result<Server> {
        self.set_status(ServerStatus::Stopping)
    }

    /// Take `server` out of rotation; its fragments stay where they are
    pub fn mark_server_offline(&self, server: &str) -> Result<Server> {
        let updated = self.store.transaction(|txn| {
            let mut row: Server = txn.require(&Server::key_for(server), "server")?;
            row.status = ServerStatus::Offline;
            txn.put(&row)?;
            Ok(row)
        })?;
        tracing::info!("Server {} marked offline", server);
        Ok(updated)
    }

    /// Drop `server` from the roster entirely
    pub fn remove_server(&self, server: &str) -> Result<()> {
        self.store.transaction(|txn| {
            let row: Server = txn.require(&Server::key_for(server), "server")?;
            if row.is_online() {
                return abort(ShardVaultError::Conflict(format!(
                    "server {} is online; mark it offline first",
                    server
                )));
            }
            txn.delete(&Server::key_for(server))?;
            Ok(())
        })?;
        tracing::info!("Server {} removed from roster", server);
        Ok(())
    }

    pub fn get_servers(&self) -> Result<Vec<Server>> {
        self.store.servers()
    }

    pub fn online_servers(&self) -> Result<Vec<Server>> {
        self.store.online_servers()
    }

    /// Heartbeat until `shutdown` flips to true
    pub async fn heartbeat_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.register_server(false).await {
                        tracing::warn!("Heartbeat for {} failed: {}", self.name, e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Heartbeat loop for {} stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestCluster;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_registration_marks_unreachable_peers_offline() {
        let cluster = TestCluster::new(3).await;
        cluster.transport.set_reachable("s3", false);

        let report = cluster.nodes[0].membership.register_server(true).await.unwrap();
        assert_eq!(report.server.status, ServerStatus::Online);
        assert_eq!(report.marked_offline, vec!["s3".to_string()]);
        assert_eq!(
            cluster.store.server("s3").unwrap().status,
            ServerStatus::Offline
        );

        // a heartbeat from s3 itself restores it
        cluster.transport.set_reachable("s3", true);
        let report = cluster.nodes[2].membership.register_server(false).await.unwrap();
        assert_eq!(report.server.status, ServerStatus::Online);
    }

    #[tokio::test]
    async fn test_registration_outlasts_a_crashed_holder() {
        let cluster = TestCluster::new(2).await;
        cluster
            .store
            .acquire_lease(REGISTRATION_LEASE, "crashed", 1, unix_now())
            .unwrap();

        let mut membership = cluster.nodes[0].membership.clone();
        membership.config.registration_attempts = 2;
        membership.config.registration_backoff = Duration::from_millis(5);

        let report = tokio::time::timeout(Duration::from_secs(10), membership.register_server(true))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.server.status, ServerStatus::Online);
        assert_eq!(report.stale_takeover.as_deref(), Some("crashed"));
        assert!(cluster.store.lease(REGISTRATION_LEASE).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registration_waits_for_a_live_holder() {
        let cluster = TestCluster::new(2).await;
        cluster
            .store
            .acquire_lease(REGISTRATION_LEASE, "s2", 600, unix_now())
            .unwrap();

        let mut membership = cluster.nodes[0].membership.clone();
        membership.config.registration_attempts = 2;
        membership.config.registration_backoff = Duration::from_millis(5);

        // the holder is healthy, so the caller is still waiting
        let waiting = tokio::time::timeout(Duration::from_millis(300), membership.register_server(true)).await;
        assert!(waiting.is_err());
        assert_eq!(
            cluster.store.lease(REGISTRATION_LEASE).unwrap().unwrap().owner,
            "s2"
        );
    }

    #[tokio::test]
    async fn test_stale_registration_lease_is_taken_over() {
        let cluster = TestCluster::new(2).await;
        let mut stuck = cluster.store.server("s2").unwrap();
        stuck.status = ServerStatus::Starting;
        cluster.store.transaction(|txn| txn.put(&stuck)).unwrap();
        cluster
            .store
            .acquire_lease(REGISTRATION_LEASE, "s2", 60, unix_now() - 3_600)
            .unwrap();

        let report = cluster.nodes[0].membership.register_server(true).await.unwrap();
        assert_eq!(report.stale_takeover.as_deref(), Some("s2"));
        assert_eq!(cluster.store.server("s2").unwrap().status, ServerStatus::Error);
        assert!(cluster.store.lease(REGISTRATION_LEASE).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_registration_keeps_one_starter() {
        let cluster = TestCluster::new(4).await;
        let store = cluster.store.clone();

        let sampler = tokio::spawn(async move {
            let mut worst = 0;
            for _ in 0..200 {
                let starting = store
                    .servers()
                    .unwrap()
                    .iter()
                    .filter(|s| s.status == ServerStatus::Starting)
                    .count();
                worst = worst.max(starting);
                tokio::task::yield_now().await;
            }
            worst
        });

        let mut tasks = Vec::new();
        for node in &cluster.nodes {
            let mut membership = node.membership.clone();
            membership.config.registration_backoff = Duration::from_millis(2);
            membership.config.registration_attempts = 500;
            tasks.push(tokio::spawn(async move { membership.register_server(true).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(sampler.await.unwrap() <= 1);
        assert!(cluster
            .store
            .servers()
            .unwrap()
            .iter()
            .all(|s| s.status == ServerStatus::Online));
    }

    #[tokio::test]
    async fn test_mark_offline_and_remove() {
        let cluster = TestCluster::new(2).await;
        let membership = &cluster.nodes[0].membership;

        assert!(membership.remove_server("s2").is_err());
        membership.mark_server_offline("s2").unwrap();
        assert_eq!(membership.online_servers().unwrap().len(), 1);

        membership.remove_server("s2").unwrap();
        assert_eq!(membership.get_servers().unwrap().len(), 1);
        assert_eq!(
            membership.mark_server_offline("s2").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
