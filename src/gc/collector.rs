//! Reference-aware collection of unreferenced content
//!
//! Collection is two-phase. Shard bytes are removed first, then one
//! transaction per dataId drops its Fragment rows and retires the versions
//! that pointed at it. A crash between the phases leaves bytes without
//! metadata, which the orphaned-shards scan picks up, never metadata
//! pointing at missing bytes.

use super::pool::WorkerPool;
use crate::cluster::FragmentRouter;
use crate::metadata::{
    abort, lease::GC_LEASE, unix_now, DataCopies, File, FileStatus, FileVersion, Fragment,
    MetadataStore, Record, Txn, TxResult,
};
use crate::{ErrorKind, ErrorReport, Result, ShardVaultError};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    /// Concurrent deletion workers
    pub worker_width: usize,

    /// Age after which a held GC lease is considered stale (seconds)
    pub lease_secs: i64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            worker_width: 10,
            lease_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcMode {
    /// Requested by an operator; runs on whichever node received it
    Manual,

    /// Periodic trigger; only the online node with the least free space runs
    Automatic,
}

/// All fragments of one dataId, deleted by a single worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionGroup {
    pub data_id: String,
    pub fragments: Vec<Fragment>,
}

#[derive(Debug, Clone, Default)]
pub struct DeletionPlan {
    pub groups: Vec<DeletionGroup>,

    /// `(file_id, version_no)` of released versions without content
    pub contentless: Vec<(String, u64)>,

    /// DataIds skipped because a live version still references them
    pub still_live: Vec<String>,

    /// DataIds whose DataCopies marker was dropped in this pass
    pub released_copies: Vec<String>,
}

impl DeletionPlan {
    pub fn fragment_count(&self) -> usize {
        self.groups.iter().map(|g| g.fragments.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.contentless.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    /// DataIds whose fragments and metadata are gone
    pub collected: Vec<String>,

    /// Shard files actually removed from disk
    pub fragments_deleted: usize,

    pub versions_retired: usize,

    /// Groups that could not be finished; retried on the next run
    pub failed: Vec<(String, ErrorReport)>,

    pub still_live: usize,
    pub released_copies: usize,

    /// Set when the run took over a stale lease
    pub stale_warning: Option<ErrorReport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcOutcome {
    /// This node is not the one that should collect right now
    AssignedToOtherServer { server: String, free_space: u64 },

    Completed(GcReport),
}

/// Finds released content and removes it from the cluster
#[derive(Clone)]
pub struct GarbageCollector {
    store: Arc<MetadataStore>,
    router: FragmentRouter,
    pool: WorkerPool,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(store: Arc<MetadataStore>, router: FragmentRouter, config: GcConfig) -> Self {
        Self {
            pool: WorkerPool::new(config.worker_width),
            store,
            router,
            config,
        }
    }

    pub fn server_name(&self) -> &str {
        self.router.local_name()
    }

    pub(crate) fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Work out which content can go.
    ///
    /// Every `ToBeDeleted` version contributes its dataId once. A dataId that
    /// some `Good` version still references is skipped; its DataCopies
    /// marker, if any, survives. Otherwise the marker is dropped and all of
    /// the dataId's fragments are scheduled.
    pub fn get_to_be_deleted_fragments(&self) -> Result<DeletionPlan> {
        let mut plan = DeletionPlan::default();
        let mut seen = HashSet::new();

        for version in self.store.all_versions()? {
            if version.status != FileStatus::ToBeDeleted {
                continue;
            }
            let data_id = match version.data_id {
                Some(data_id) => data_id,
                None => {
                    plan.contentless.push((version.file_id, version.version_no));
                    continue;
                }
            };
            if !seen.insert(data_id.clone()) {
                continue;
            }

            let live = self
                .store
                .versions_referencing(&data_id)?
                .iter()
                .any(|v| matches!(v.status, FileStatus::Good | FileStatus::Rebuilding));
            if live {
                tracing::debug!("Data {} is still referenced, keeping it", data_id);
                plan.still_live.push(data_id);
                continue;
            }

            if self.store.data_copies(&data_id)?.is_some() {
                self.store
                    .transaction(|txn| txn.delete(&DataCopies::key_for(&data_id)))?;
                tracing::debug!("Released copy marker of {}", data_id);
                plan.released_copies.push(data_id.clone());
            }

            let fragments = self.store.fragments_of(&data_id)?;
            plan.groups.push(DeletionGroup { data_id, fragments });
        }

        tracing::debug!(
            "Collection plan: {} data ids, {} fragments, {} contentless versions, {} still live",
            plan.groups.len(),
            plan.fragment_count(),
            plan.contentless.len(),
            plan.still_live.len()
        );
        Ok(plan)
    }

    /// Commit the removal of one dataId whose bytes are gone.
    ///
    /// Drops its Fragment rows and DataCopies marker and marks every version
    /// pointing at it `Deleted`. A File whose versions are then all deleted
    /// is marked `Deleted` too. Refuses with `Conflict` if a live version
    /// references the dataId. Returns how many versions were retired.
    pub fn finish_delete_data_id(&self, data_id: &str) -> Result<usize> {
        let fragment_keys: Vec<Vec<u8>> = self
            .store
            .fragments_of(data_id)?
            .iter()
            .map(|f| f.key())
            .collect();
        let versions = self.store.versions_referencing(data_id)?;
        let siblings = self.sibling_version_keys(versions.iter().map(|v| v.file_id.as_str()))?;

        let now = unix_now();
        self.store.transaction(|txn| {
            let mut retired = 0;
            for version in &versions {
                let mut row: FileVersion = match txn.get(&version.key())? {
                    Some(row) => row,
                    None => continue,
                };
                match row.status {
                    FileStatus::Good | FileStatus::Rebuilding => {
                        return abort(ShardVaultError::Conflict(format!(
                            "data {} is referenced by version {} of file {}",
                            data_id, row.version_no, row.file_id
                        )))
                    }
                    FileStatus::ToBeDeleted => {
                        row.status = FileStatus::Deleted;
                        row.modified_at = now;
                        txn.save_version(&row)?;
                        retired += 1;
                    }
                    FileStatus::Deleted => {}
                }
            }

            for key in &fragment_keys {
                txn.delete(key)?;
            }
            txn.delete(&DataCopies::key_for(data_id))?;

            for (file_id, keys) in &siblings {
                retire_file_if_done(txn, file_id, keys, now)?;
            }
            Ok(retired)
        })
    }

    /// Retire a released version that never had content
    fn retire_contentless(&self, file_id: &str, version_no: u64) -> Result<bool> {
        let siblings = self.sibling_version_keys(std::iter::once(file_id))?;
        let now = unix_now();

        self.store.transaction(|txn| {
            let key = FileVersion::key_for(file_id, version_no);
            let mut row: FileVersion = match txn.get(&key)? {
                Some(row) => row,
                None => return Ok(false),
            };
            if row.status != FileStatus::ToBeDeleted || row.data_id.is_some() {
                return Ok(false);
            }
            row.status = FileStatus::Deleted;
            row.modified_at = now;
            txn.save_version(&row)?;

            for (file_id, keys) in &siblings {
                retire_file_if_done(txn, file_id, keys, now)?;
            }
            Ok(true)
        })
    }

    fn sibling_version_keys<'a>(
        &self,
        file_ids: impl Iterator<Item = &'a str>,
    ) -> Result<HashMap<String, Vec<Vec<u8>>>> {
        let mut siblings = HashMap::new();
        for file_id in file_ids {
            if siblings.contains_key(file_id) {
                continue;
            }
            let keys = self
                .store
                .versions(file_id)?
                .iter()
                .map(|v| v.key())
                .collect();
            siblings.insert(file_id.to_string(), keys);
        }
        Ok(siblings)
    }

    /// Remove every shard of one group; returns how many files were removed
    async fn delete_group(&self, group: &DeletionGroup) -> Result<usize> {
        let mut removed = 0;
        let mut first_error = None;

        for fragment in &group.fragments {
            match self.router.delete(&fragment.server, &fragment.path).await {
                Ok(true) => removed += 1,
                Ok(false) => {
                    tracing::debug!("Shard {} on {} was already gone", fragment.path, fragment.server)
                }
                // the server left the roster; its bytes went with it
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::debug!("Skipping shard on unknown server {}", fragment.server)
                }
                Err(e) => {
                    tracing::error!(
                        "Could not delete shard {} of {} on {}: {}",
                        fragment.frag_id,
                        group.data_id,
                        fragment.server,
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    /// Execute a plan: bytes first through the worker pool, then metadata
    /// per finished dataId. A failed group leaves its metadata untouched.
    pub async fn delete_fragments(&self, plan: DeletionPlan) -> GcReport {
        let mut report = GcReport {
            still_live: plan.still_live.len(),
            released_copies: plan.released_copies.len(),
            ..Default::default()
        };

        let results = self
            .pool
            .run(plan.groups, |group| async move {
                let outcome = self.delete_group(&group).await;
                (group.data_id, outcome)
            })
            .await;

        for (data_id, outcome) in results {
            let committed = match outcome {
                Ok(removed) => self
                    .finish_delete_data_id(&data_id)
                    .map(|retired| (removed, retired)),
                Err(e) => Err(e),
            };
            match committed {
                Ok((removed, retired)) => {
                    report.fragments_deleted += removed;
                    report.versions_retired += retired;
                    report.collected.push(data_id);
                }
                Err(e) => {
                    tracing::error!("Collection of {} failed: {}", data_id, e);
                    report.failed.push((data_id, e.report()));
                }
            }
        }

        for (file_id, version_no) in plan.contentless {
            match self.retire_contentless(&file_id, version_no) {
                Ok(true) => report.versions_retired += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Could not retire version {} of {}: {}", version_no, file_id, e);
                    report
                        .failed
                        .push((format!("{}@{}", file_id, version_no), e.report()));
                }
            }
        }

        report.collected.sort();
        report
    }

    /// Online server that should collect instead of this one, if any
    fn assigned_elsewhere(&self) -> Result<Option<(String, u64)>> {
        let online = self.store.online_servers()?;
        let least = online
            .iter()
            .min_by(|a, b| a.free_space.cmp(&b.free_space).then_with(|| a.name.cmp(&b.name)))
            .ok_or_else(|| ShardVaultError::Conflict("no online server to collect garbage".into()))?;

        if least.name == self.server_name() {
            Ok(None)
        } else {
            Ok(Some((least.name.clone(), least.free_space)))
        }
    }

    /// One full collection pass under the cluster-wide GC lease
    pub async fn run(&self, mode: GcMode) -> Result<GcOutcome> {
        if mode == GcMode::Automatic {
            if let Some((server, free_space)) = self.assigned_elsewhere()? {
                tracing::debug!(
                    "Garbage collection assigned to {} ({} bytes free)",
                    server,
                    free_space
                );
                return Ok(GcOutcome::AssignedToOtherServer { server, free_space });
            }
        }

        let lease = self.store.acquire_lease(
            GC_LEASE,
            self.server_name(),
            self.config.lease_secs,
            unix_now(),
        )?;

        let result = match self.get_to_be_deleted_fragments() {
            Ok(plan) => Ok(self.delete_fragments(plan).await),
            Err(e) => Err(e),
        };
        if let Err(e) = self.store.release_lease(GC_LEASE, self.server_name()) {
            tracing::warn!("Could not release the collection lease: {}", e);
        }

        let mut report = result?;
        report.stale_warning = lease.stale_warning().map(|e| e.report());
        tracing::info!(
            "Garbage collection on {}: {} data ids, {} shards removed, {} failed",
            self.server_name(),
            report.collected.len(),
            report.fragments_deleted,
            report.failed.len()
        );
        Ok(GcOutcome::Completed(report))
    }
}

/// Mark a released File `Deleted` once none of its versions remain
fn retire_file_if_done(txn: &Txn<'_>, file_id: &str, version_keys: &[Vec<u8>], now: i64) -> TxResult<bool> {
    let mut file: File = match txn.get(&File::key_for(file_id))? {
        Some(file) => file,
        None => return Ok(false),
    };
    if file.status != FileStatus::ToBeDeleted {
        return Ok(false);
    }
    for key in version_keys {
        if let Some(version) = txn.get::<FileVersion>(key)? {
            if version.status != FileStatus::Deleted {
                return Ok(false);
            }
        }
    }

    file.status = FileStatus::Deleted;
    file.modified_at = now;
    txn.save_file(&file)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ServerStatus, VersioningMode};
    use crate::testing::{TestCluster, ADMIN};
    use crate::versioning::NewFileOptions;

    fn unwrap_report(outcome: GcOutcome) -> GcReport {
        match outcome {
            GcOutcome::Completed(report) => report,
            other => panic!("expected a completed run, got {:?}", other),
        }
    }

    fn set_status(cluster: &TestCluster, name: &str, status: ServerStatus) {
        let mut server = cluster.store.server(name).unwrap();
        server.status = status;
        cluster.store.transaction(|txn| txn.put(&server)).unwrap();
    }

    #[tokio::test]
    async fn test_collects_superseded_version_once() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let root = cluster.root_id();
        let options = NewFileOptions {
            versioning: VersioningMode::KeepAll,
            ..Default::default()
        };

        let file = files.write_file(ADMIN, &root, "A", b"hello", options).await.unwrap();
        let old_data = file.data_id.clone().unwrap();
        let updated = files.update_file(ADMIN, &file.id, b"hello, again", None).await.unwrap();
        let new_data = updated.data_id.clone().unwrap();
        assert_eq!(cluster.shard_count().await, 10);

        let collector = cluster.collector(0);
        assert_eq!(collector.mark_old_file_versions(0, unix_now()).unwrap(), 1);

        let report = unwrap_report(collector.run(GcMode::Manual).await.unwrap());
        assert_eq!(report.collected, vec![old_data.clone()]);
        assert_eq!(report.fragments_deleted, 5);
        assert!(report.failed.is_empty());

        assert!(cluster.store.fragments_of(&old_data).unwrap().is_empty());
        assert_eq!(cluster.store.fragments_of(&new_data).unwrap().len(), 5);
        assert_eq!(cluster.shard_count().await, 5);
        assert_eq!(cluster.store.version(&file.id, 1).unwrap().status, FileStatus::Deleted);
        assert_eq!(
            files.read_file(ADMIN, &file.id, None, None).await.unwrap(),
            b"hello, again"
        );

        let again = unwrap_report(collector.run(GcMode::Manual).await.unwrap());
        assert!(again.collected.is_empty());
        assert_eq!(again.fragments_deleted, 0);
    }

    #[tokio::test]
    async fn test_copies_keep_content_alive() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let root = cluster.root_id();
        let collector = cluster.collector(0);

        let original = files
            .write_file(ADMIN, &root, "a.txt", b"shared bytes", NewFileOptions::default())
            .await
            .unwrap();
        let data_id = original.data_id.clone().unwrap();
        let copy = files.copy_file(ADMIN, &original.id, &root, Some("b.txt")).unwrap();

        files.delete_file(ADMIN, &original.id).unwrap();
        let report = unwrap_report(collector.run(GcMode::Manual).await.unwrap());
        assert!(report.collected.is_empty());
        assert_eq!(report.still_live, 1);
        assert_eq!(cluster.shard_count().await, 5);
        assert_eq!(
            files.read_file(ADMIN, &copy.id, None, None).await.unwrap(),
            b"shared bytes"
        );

        files.delete_file(ADMIN, &copy.id).unwrap();
        let report = unwrap_report(collector.run(GcMode::Manual).await.unwrap());
        assert_eq!(report.collected, vec![data_id.clone()]);
        assert_eq!(report.fragments_deleted, 5);
        assert_eq!(report.released_copies, 1);
        assert!(cluster.store.data_copies(&data_id).unwrap().is_none());
        assert_eq!(cluster.shard_count().await, 0);
        assert_eq!(cluster.store.file(&original.id).unwrap().status, FileStatus::Deleted);
        assert_eq!(cluster.store.file(&copy.id).unwrap().status, FileStatus::Deleted);

        let again = unwrap_report(collector.run(GcMode::Manual).await.unwrap());
        assert!(again.collected.is_empty());
    }

    #[tokio::test]
    async fn test_live_reference_blocks_finish() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let file = files
            .write_file(ADMIN, &cluster.root_id(), "a.txt", b"keep", NewFileOptions::default())
            .await
            .unwrap();

        let err = cluster
            .collector(0)
            .finish_delete_data_id(file.data_id.as_deref().unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(cluster.store.fragments_of(file.data_id.as_deref().unwrap()).unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_failed_group_is_isolated_and_retried() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let root = cluster.root_id();

        let spread = files
            .write_file(ADMIN, &root, "spread", b"on every node", NewFileOptions::default())
            .await
            .unwrap();

        // only s1 is a placement candidate for the second file
        set_status(&cluster, "s2", ServerStatus::Offline);
        set_status(&cluster, "s3", ServerStatus::Offline);
        let local = files
            .write_file(ADMIN, &root, "local", b"only on s1", NewFileOptions::default())
            .await
            .unwrap();
        set_status(&cluster, "s2", ServerStatus::Online);
        set_status(&cluster, "s3", ServerStatus::Online);

        files.delete_file(ADMIN, &spread.id).unwrap();
        files.delete_file(ADMIN, &local.id).unwrap();
        cluster.transport.set_reachable("s2", false);

        let collector = cluster.collector(0);
        let report = unwrap_report(collector.run(GcMode::Manual).await.unwrap());
        assert_eq!(report.collected, vec![local.data_id.clone().unwrap()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, spread.data_id.clone().unwrap());
        assert_eq!(report.failed[0].1.kind, ErrorKind::TransportIo);
        assert_eq!(
            cluster.store.fragments_of(spread.data_id.as_deref().unwrap()).unwrap().len(),
            5
        );

        cluster.transport.set_reachable("s2", true);
        let report = unwrap_report(collector.run(GcMode::Manual).await.unwrap());
        assert_eq!(report.collected, vec![spread.data_id.clone().unwrap()]);
        assert_eq!(cluster.shard_count().await, 0);
    }

    #[tokio::test]
    async fn test_automatic_runs_on_least_free_server() {
        let cluster = TestCluster::new(3).await;
        cluster.set_free_space("s1", 10);
        cluster.set_free_space("s2", 5);
        cluster.set_free_space("s3", 5);

        let mut collecting = Vec::new();
        for i in 0..3 {
            match cluster.collector(i).run(GcMode::Automatic).await.unwrap() {
                GcOutcome::Completed(_) => collecting.push(cluster.nodes[i].name.clone()),
                GcOutcome::AssignedToOtherServer { server, free_space } => {
                    assert_eq!(server, "s2");
                    assert_eq!(free_space, 5);
                }
            }
        }
        // s2 and s3 tie; the name breaks the tie
        assert_eq!(collecting, vec!["s2".to_string()]);

        // manual runs ignore the election
        assert!(matches!(
            cluster.collector(0).run(GcMode::Manual).await.unwrap(),
            GcOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_lease_guards_concurrent_runs() {
        let cluster = TestCluster::new(2).await;
        let collector = cluster.collector(0);

        cluster
            .store
            .acquire_lease(GC_LEASE, "s2", 600, unix_now())
            .unwrap();
        let err = collector.run(GcMode::Manual).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::JobAlreadyRunning);
        cluster.store.release_lease(GC_LEASE, "s2").unwrap();

        cluster
            .store
            .acquire_lease(GC_LEASE, "s2", 60, unix_now() - 3_600)
            .unwrap();
        let report = unwrap_report(collector.run(GcMode::Manual).await.unwrap());
        assert_eq!(
            report.stale_warning.map(|w| w.kind),
            Some(ErrorKind::StaleJobWarning)
        );
        assert!(cluster.store.lease(GC_LEASE).unwrap().is_none());
    }
}
