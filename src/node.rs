//! A running storage node
//!
//! Wires the metadata store, the local shard directory, the fragment
//! transport and the background loops (heartbeat, automatic collection,
//! retention) together, and takes them down again in order.

use crate::cluster::{
    FragmentRouter, FragmentService, Membership, NodeTransport, P2pTransport, PeerClient,
};
use crate::config::NodeConfig;
use crate::gc::{GarbageCollector, GcMode, GcOutcome, WorkerPool};
use crate::health::HealthMonitor;
use crate::metadata::{unix_now, MetadataStore};
use crate::storage::{FragmentStore, ReedSolomonCodec};
use crate::versioning::{ContentIo, FileManager};
use crate::{ErrorKind, Result};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct StorageNode {
    config: NodeConfig,
    store: Arc<MetadataStore>,
    service: Arc<FragmentService>,
    membership: Membership,
    files: FileManager,
    collector: GarbageCollector,
    health: HealthMonitor,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StorageNode {
    /// Open the on-disk state under `config.data_path`, start the libp2p
    /// transport and join the cluster.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.data_path).await?;

        let store = Arc::new(MetadataStore::open(config.metadata_path())?);
        let fragments =
            Arc::new(FragmentStore::open(config.fragments_path(), config.storage_offered_bytes).await?);
        let service = Arc::new(FragmentService::new(
            &config.server_name,
            fragments,
            store.clone(),
        ));

        let transport = P2pTransport::start(config.transport_config()?, service.clone()).await?;
        let peer_id = transport.local_peer_id().to_string();
        Self::launch(config, store, service, Arc::new(transport), Some(peer_id)).await
    }

    /// Join the cluster with an already opened store and transport.
    ///
    /// Several nodes of one process can share `store`.
    pub async fn launch(
        config: NodeConfig,
        store: Arc<MetadataStore>,
        service: Arc<FragmentService>,
        transport: Arc<dyn NodeTransport>,
        peer_id: Option<String>,
    ) -> Result<Self> {
        let report = store.bootstrap(&config.bootstrap_options(), unix_now())?;
        if report.created {
            tracing::info!("Seeded an empty metadata store (root {})", report.settings.root_id);
        }
        for problem in &report.config_errors {
            tracing::warn!("Configuration corrected: {}", problem);
        }

        let name = config.server_name.clone();
        let peers = PeerClient::new(transport, config.request_timeout());
        let fragments = service.fragments().clone();
        let router = FragmentRouter::new(&name, fragments.clone(), peers.clone(), store.clone());

        let mut membership = Membership::new(
            store.clone(),
            &name,
            &config.hostname,
            config.port,
            fragments,
            peers,
            config.membership_config(),
        );
        if let Some(peer_id) = peer_id {
            membership = membership.with_peer_id(peer_id);
        }

        let content = ContentIo::new(router.clone(), store.clone(), Arc::new(ReedSolomonCodec));
        let files = FileManager::new(store.clone(), content, &name);
        let collector = GarbageCollector::new(store.clone(), router, config.gc.clone());
        let health = HealthMonitor::new(files.clone(), collector.clone(), service.clone())
            .with_pool(WorkerPool::new(config.gc.worker_width));

        let registration = membership.register_server(true).await?;
        if let Some(previous) = &registration.stale_takeover {
            tracing::warn!("Took over a stale registration from {}", previous);
        }
        tracing::info!(
            "Server {} online with {} bytes free",
            name,
            registration.server.free_space
        );

        let (stop, _) = watch::channel(false);
        let mut node = Self {
            config,
            store,
            service,
            membership,
            files,
            collector,
            health,
            stop,
            tasks: Vec::new(),
        };
        node.spawn_loops();
        Ok(node)
    }

    fn spawn_loops(&mut self) {
        let membership = self.membership.clone();
        let shutdown = self.stop.subscribe();
        self.tasks
            .push(tokio::spawn(async move { membership.heartbeat_loop(shutdown).await }));

        if self.config.gc_interval_secs > 0 {
            let collector = self.collector.clone();
            let every = Duration::from_secs(self.config.gc_interval_secs);
            self.tasks.push(tokio::spawn(periodic(
                "garbage collection",
                every,
                self.stop.subscribe(),
                move || {
                    let collector = collector.clone();
                    async move { collect_once(&collector).await }
                },
            )));
        }

        if self.config.retention_interval_secs > 0 {
            let collector = self.collector.clone();
            let store = self.store.clone();
            let every = Duration::from_secs(self.config.retention_interval_secs);
            self.tasks.push(tokio::spawn(periodic(
                "retention sweep",
                every,
                self.stop.subscribe(),
                move || {
                    let collector = collector.clone();
                    let store = store.clone();
                    async move {
                        let window = store.settings()?.retention_secs;
                        let retired = collector.mark_old_file_versions(window, unix_now())?;
                        if retired > 0 {
                            tracing::info!("Retention marked {} versions for deletion", retired);
                        }
                        Ok(())
                    }
                },
            )));
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.server_name
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn files(&self) -> &FileManager {
        &self.files
    }

    pub fn collector(&self) -> &GarbageCollector {
        &self.collector
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Resolves once a peer sent `Shutdown` to this node
    pub async fn remote_shutdown(&self) {
        let mut signal = self.service.shutdown_signal();
        while !*signal.borrow() {
            if signal.changed().await.is_err() {
                // sender lives as long as the service; never fire on drop
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run until Ctrl-C or a remote shutdown, then stop gracefully
    pub async fn run(self) -> Result<()> {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Interrupted, shutting down {}", self.name());
            }
            _ = self.remote_shutdown() => {
                tracing::info!("Shutdown requested by a peer, stopping {}", self.name());
            }
        }
        self.shutdown().await
    }

    /// Leave the roster and stop the background loops.
    ///
    /// A collector run in progress finishes its deletions before its loop
    /// exits.
    pub async fn shutdown(self) -> Result<()> {
        self.membership.mark_stopping()?;
        self.stop.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        self.membership.mark_server_offline(&self.config.server_name)?;
        tracing::info!("Server {} stopped", self.config.server_name);
        Ok(())
    }
}

async fn collect_once(collector: &GarbageCollector) -> Result<()> {
    match collector.run(GcMode::Automatic).await {
        Ok(GcOutcome::Completed(report)) => {
            if let Some(warning) = &report.stale_warning {
                tracing::warn!("{}", warning.message);
            }
            Ok(())
        }
        Ok(GcOutcome::AssignedToOtherServer { server, .. }) => {
            tracing::debug!("Collection left to {}", server);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::JobAlreadyRunning => {
            tracing::debug!("Skipping collection: {}", e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Call `job` every `every` until `shutdown` flips; a running job is never
/// interrupted.
async fn periodic<F, Fut>(what: &'static str, every: Duration, mut shutdown: watch::Receiver<bool>, job: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut interval = tokio::time::interval(every);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = job().await {
                    tracing::warn!("Periodic {} failed: {}", what, e);
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Periodic {} stopped", what);
}
