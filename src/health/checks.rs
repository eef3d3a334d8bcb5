//! The individual maintenance checks

use super::job::{CheckLine, Finding};
use super::monitor::{CheckProgress, HealthMonitor};
use crate::gc::{GcMode, GcOutcome};
use crate::metadata::{unix_now, FileStatus, Fragment, FragmentStatus, Record, Server};
use crate::storage::{ContentKey, FragmentKey, StorageError};
use crate::versioning::resolve_data_key;
use crate::{ErrorKind, Result};

use std::collections::BTreeSet;

/// Findings of one check plus how many items it looked at
#[derive(Debug, Default)]
pub(crate) struct CheckOutcome {
    pub examined: u64,
    pub lines: Vec<CheckLine>,
}

impl HealthMonitor {
    /// Read every shard this node is supposed to hold and validate its
    /// header. Broken ones are marked `Bad` and their content repaired.
    pub(crate) async fn quick_check(
        &self,
        progress: &CheckProgress<'_>,
        password: Option<&str>,
    ) -> Result<CheckOutcome> {
        let mut outcome = CheckOutcome::default();
        let mut damaged = BTreeSet::new();
        let mut healthy = Vec::new();
        let codec = self.files.content().codec();

        let fragments = self.store().fragments_on_server(self.server_name())?;
        let total = fragments.len() as u64;
        for fragment in fragments {
            outcome.examined += 1;
            let problem = match self.local.fragments().read(&fragment.path, None).await {
                Ok(shard) => match codec.inspect(&shard) {
                    Ok(header)
                        if header.index as u32 == fragment.frag_id
                            && u32::from(header.data_shards) + u32::from(header.parity_shards)
                                == fragment.total_shards =>
                    {
                        None
                    }
                    Ok(_) => Some((Finding::CorruptShard, "header does not match its row".to_string())),
                    Err(e) => Some((Finding::CorruptShard, e.to_string())),
                },
                Err(StorageError::FileNotFound(_)) => {
                    Some((Finding::MissingShard, "shard file is absent".to_string()))
                }
                Err(e) => Some((Finding::CorruptShard, e.to_string())),
            };

            match problem {
                None => healthy.push(fragment),
                Some((finding, detail)) => {
                    self.repairer.mark_bad(&fragment)?;
                    damaged.insert(fragment.data_id.clone());
                    outcome
                        .lines
                        .push(CheckLine::new(fragment.path.clone(), finding, detail).on(self.server_name()));
                }
            }
            progress.update(total, outcome.examined, &outcome.lines);
        }

        self.touch(&healthy)?;
        outcome.lines.extend(self.repair_all(damaged, password).await);
        Ok(outcome)
    }

    /// Ask every online node which of its fragments are absent
    pub(crate) async fn missing_check(
        &self,
        progress: &CheckProgress<'_>,
        password: Option<&str>,
    ) -> Result<CheckOutcome> {
        let mut outcome = CheckOutcome::default();
        let mut damaged = BTreeSet::new();

        let servers = self.store().online_servers()?;
        let total = servers.len() as u64;
        for server in servers {
            outcome.examined += 1;
            let missing = match self.missing_on(&server).await {
                Ok(missing) => missing,
                Err(e) => {
                    tracing::warn!("Missing-shard scan of {} failed: {}", server.name, e);
                    outcome
                        .lines
                        .push(CheckLine::new(server.name.clone(), Finding::CheckFailed, e.to_string()).on(&server.name));
                    Vec::new()
                }
            };

            for key in missing {
                let row = self.store().get::<Fragment>(&Fragment::key_for(
                    &key.data_id,
                    key.version_no,
                    key.frag_id,
                ))?;
                if let Some(fragment) = row {
                    self.repairer.mark_bad(&fragment)?;
                    damaged.insert(fragment.data_id.clone());
                    outcome.lines.push(
                        CheckLine::new(fragment.path.clone(), Finding::MissingShard, "shard file is absent")
                            .on(&server.name),
                    );
                }
            }
            progress.update(total, outcome.examined, &outcome.lines);
        }

        outcome.lines.extend(self.repair_all(damaged, password).await);
        Ok(outcome)
    }

    async fn missing_on(&self, server: &Server) -> Result<Vec<FragmentKey>> {
        if server.name == self.server_name() {
            return self.local.missing_fragments().await;
        }
        Ok(self.files.content().router().peers().missing(server).await?)
    }

    /// Decode every live blob end to end and compare its checksum
    pub(crate) async fn full_check(
        &self,
        progress: &CheckProgress<'_>,
        password: Option<&str>,
    ) -> Result<CheckOutcome> {
        let mut outcome = CheckOutcome::default();
        let mut damaged = BTreeSet::new();

        let mut blobs: BTreeSet<String> = BTreeSet::new();
        for version in self.store().all_versions()? {
            if version.status == FileStatus::Good {
                if let Some(data_id) = version.data_id {
                    blobs.insert(data_id);
                }
            }
        }

        let total = blobs.len() as u64;
        for data_id in blobs {
            outcome.examined += 1;
            match self.verify_blob(&data_id, password).await {
                Ok(broken) if broken.is_empty() => {}
                Ok(broken) => {
                    for (fragment, error) in broken {
                        self.repairer.mark_bad(&fragment)?;
                        outcome.lines.push(
                            CheckLine::new(fragment.path.clone(), Finding::CorruptShard, error).on(&fragment.server),
                        );
                    }
                    damaged.insert(data_id);
                }
                Err(e) => outcome.lines.push(repair_failure_line(&data_id, &e)),
            }
            progress.update(total, outcome.examined, &outcome.lines);
        }

        outcome.lines.extend(self.repair_all(damaged, password).await);
        Ok(outcome)
    }

    /// Fragments of `data_id` that failed to read or validate; the blob
    /// itself must still decode
    async fn verify_blob(&self, data_id: &str, password: Option<&str>) -> Result<Vec<(Fragment, String)>> {
        let live: Vec<_> = self
            .store()
            .versions_referencing(data_id)?
            .into_iter()
            .filter(|v| v.status == FileStatus::Good)
            .collect();
        let reference = match live.first() {
            Some(version) => version,
            None => return Ok(Vec::new()),
        };

        let good: Vec<Fragment> = self
            .store()
            .fragments_of(data_id)?
            .into_iter()
            .filter(|f| f.version_no == reference.data_version && f.status == FragmentStatus::Good)
            .collect();
        let content = self.files.content();
        let fetched = content.fetch(&good, reference.layout).await;

        let file_ids: Vec<String> = live.iter().map(|v| v.file_id.clone()).collect();
        let key = ContentKey::new(resolve_data_key(self.store(), &file_ids, password)?, reference.iv);
        content.decode_verified(
            data_id,
            fetched.shards,
            reference.layout,
            &key,
            reference.checksum.as_ref(),
        )?;
        Ok(fetched.failures)
    }

    /// Shard files on any online node that no fragment row points at
    pub(crate) async fn orphaned_check(&self, progress: &CheckProgress<'_>) -> Result<CheckOutcome> {
        let mut outcome = CheckOutcome::default();

        let servers = self.store().online_servers()?;
        let total = servers.len() as u64;
        for server in servers {
            outcome.examined += 1;
            let orphaned = if server.name == self.server_name() {
                self.local.orphaned_paths().await
            } else {
                self.files
                    .content()
                    .router()
                    .peers()
                    .orphaned(&server)
                    .await
                    .map_err(Into::into)
            };
            match orphaned {
                Ok(paths) => outcome.lines.extend(paths.into_iter().map(|path| {
                    CheckLine::new(path, Finding::OrphanedShard, "no fragment row refers to this file")
                        .on(&server.name)
                })),
                Err(e) => {
                    tracing::warn!("Orphan scan of {} failed: {}", server.name, e);
                    outcome
                        .lines
                        .push(CheckLine::new(server.name.clone(), Finding::CheckFailed, e.to_string()).on(&server.name));
                }
            }
            progress.update(total, outcome.examined, &outcome.lines);
        }
        Ok(outcome)
    }

    /// Grants wider than what their parent currently allows
    pub(crate) fn permission_check(&self) -> Result<CheckOutcome> {
        let violations = self.files.permissions().narrowing_violations()?;
        let examined = self.store().all_permissions()?.len() as u64;

        let lines = violations
            .into_iter()
            .map(|(row, ceiling)| {
                CheckLine::new(
                    row.permission_id.clone(),
                    Finding::NarrowingViolation,
                    format!(
                        "{:?} holds {} on {} but the parent allows {}",
                        row.principal, row.capabilities, row.file_id, ceiling
                    ),
                )
            })
            .collect();
        Ok(CheckOutcome { examined, lines })
    }

    pub(crate) async fn delete_fragments_check(&self) -> Result<CheckOutcome> {
        let report = match self.collector.run(GcMode::Manual).await? {
            GcOutcome::Completed(report) => report,
            GcOutcome::AssignedToOtherServer { server, .. } => {
                return Ok(CheckOutcome {
                    examined: 0,
                    lines: vec![CheckLine::new(
                        self.server_name(),
                        Finding::CheckFailed,
                        format!("collection assigned to {}", server),
                    )],
                })
            }
        };
        if let Some(warning) = &report.stale_warning {
            tracing::warn!("{}", warning.message);
        }

        let mut lines: Vec<CheckLine> = report
            .collected
            .iter()
            .map(|data_id| CheckLine::new(data_id.clone(), Finding::Collected, "fragments removed"))
            .collect();
        lines.extend(
            report
                .failed
                .iter()
                .map(|(data_id, error)| CheckLine::new(data_id.clone(), Finding::CheckFailed, error.message.clone())),
        );
        Ok(CheckOutcome {
            examined: (report.collected.len() + report.failed.len()) as u64,
            lines,
        })
    }

    /// Record a fresh successful check on healthy fragments
    fn touch(&self, fragments: &[Fragment]) -> Result<()> {
        let now = unix_now();
        self.store().transaction(|txn| {
            for fragment in fragments {
                if let Some(mut row) = txn.get::<Fragment>(&fragment.key())? {
                    if row.server == fragment.server && row.path == fragment.path {
                        row.last_checked = Some(now);
                        txn.put(&row)?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Repair each damaged blob through the worker pool
    async fn repair_all(&self, data_ids: BTreeSet<String>, password: Option<&str>) -> Vec<CheckLine> {
        let results = self
            .pool
            .run(data_ids, |data_id| async move {
                let result = self.repairer.repair_data(&data_id, password).await;
                (data_id, result)
            })
            .await;

        let mut lines = Vec::new();
        for (data_id, result) in results {
            match result {
                Ok(report) if report.restored.is_empty() => {}
                Ok(report) => lines.push(CheckLine::new(
                    data_id,
                    Finding::Repaired,
                    format!("restored shards {:?} onto {:?}", report.restored, report.targets),
                )),
                // released meanwhile; the collector owns it now
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => lines.push(repair_failure_line(&data_id, &e)),
            }
        }
        lines.sort_by(|a, b| a.subject.cmp(&b.subject));
        lines
    }
}

fn repair_failure_line(data_id: &str, error: &crate::ShardVaultError) -> CheckLine {
    match error.kind() {
        ErrorKind::ContentUnrecoverable => {
            tracing::error!("{}", error);
            CheckLine::new(data_id, Finding::Unrecoverable, error.to_string()).fatal()
        }
        ErrorKind::PasswordRequired | ErrorKind::PermissionDenied => {
            CheckLine::new(data_id, Finding::PasswordRequired, error.to_string())
        }
        _ => CheckLine::new(data_id, Finding::CheckFailed, error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use crate::health::{CheckKind, Finding, JobOptions, JobState};
    use crate::metadata::{Capabilities, FragmentStatus, Principal};
    use crate::storage::FragmentKey;
    use crate::testing::{TestCluster, ADMIN};
    use crate::versioning::NewFileOptions;
    use crate::ErrorKind;

    #[tokio::test]
    async fn test_clean_cluster_reports_no_errors() {
        let cluster = TestCluster::new(3).await;
        cluster
            .files(0)
            .write_file(ADMIN, &cluster.root_id(), "a", b"alpha", NewFileOptions::default())
            .await
            .unwrap();

        let health = cluster.health(0);
        let job = health.start_job(JobOptions::all()).unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(health.job_progress(&job.id).unwrap().len(), 6);

        let done = health.run_job(&job.id, None).await.unwrap();
        assert_eq!(done.state, JobState::CompletedNoErrors);
        assert!(done.finished_at.is_some());
        assert!(health.job_progress(&job.id).unwrap().iter().all(|p| p.finished));
        assert!(health.job_results(&job.id).unwrap().is_empty());

        // a finished job cannot be re-run
        assert_eq!(
            health.run_job(&job.id, None).await.unwrap_err().kind(),
            ErrorKind::Conflict
        );
        assert_eq!(health.list_jobs().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_shard_is_found_and_repaired() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let file = files
            .write_file(ADMIN, &cluster.root_id(), "a", b"alpha beta", NewFileOptions::default())
            .await
            .unwrap();
        let data_id = file.data_id.clone().unwrap();
        let lost = cluster.store.fragments_of(&data_id).unwrap()[1].clone();
        cluster.delete_shard(&lost).await;

        let health = cluster.health(0);
        let job = health
            .start_job(JobOptions {
                missing: true,
                ..Default::default()
            })
            .unwrap();
        let done = health.run_job(&job.id, None).await.unwrap();
        assert_eq!(done.state, JobState::CompletedWithErrors);

        let results = health.job_results(&job.id).unwrap();
        let findings: Vec<Finding> = results.iter().map(|r| r.finding).collect();
        assert_eq!(findings, vec![Finding::MissingShard, Finding::Repaired]);
        assert_eq!(results[0].server.as_deref(), Some(lost.server.as_str()));
        assert!(results.iter().all(|r| r.check == CheckKind::Missing));

        assert!(cluster
            .store
            .fragments_of(&data_id)
            .unwrap()
            .iter()
            .all(|f| f.status == FragmentStatus::Good));
        assert_eq!(cluster.shard_count().await, 5);
    }

    #[tokio::test]
    async fn test_unrecoverable_content_is_fatal() {
        let cluster = TestCluster::new(5).await;
        let files = cluster.files(0);
        let file = files
            .write_file(ADMIN, &cluster.root_id(), "a", b"gone soon", NewFileOptions::default())
            .await
            .unwrap();
        for fragment in &cluster.store.fragments_of(file.data_id.as_deref().unwrap()).unwrap()[..3] {
            cluster.delete_shard(fragment).await;
        }

        let health = cluster.health(0);
        let job = health
            .start_job(JobOptions {
                full: true,
                ..Default::default()
            })
            .unwrap();
        health.run_job(&job.id, None).await.unwrap();

        let results = health.job_results(&job.id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].finding, Finding::Unrecoverable);
        assert!(results[0].fatal);
    }

    #[tokio::test]
    async fn test_full_check_needs_password_for_sealed_content() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let options = NewFileOptions {
            password: Some("pw".into()),
            ..Default::default()
        };
        files
            .write_file(ADMIN, &cluster.root_id(), "s", b"sealed", options)
            .await
            .unwrap();

        let health = cluster.health(0);
        let full = JobOptions {
            full: true,
            ..Default::default()
        };
        let job = health.start_job(full).unwrap();
        health.run_job(&job.id, None).await.unwrap();
        let results = health.job_results(&job.id).unwrap();
        assert_eq!(results[0].finding, Finding::PasswordRequired);
        assert!(!results[0].fatal);

        let job = health.start_job(full).unwrap();
        let done = health.run_job(&job.id, Some("pw")).await.unwrap();
        assert_eq!(done.state, JobState::CompletedNoErrors);
    }

    #[tokio::test]
    async fn test_orphans_and_narrowing_are_reported() {
        let cluster = TestCluster::new(2).await;
        let stray = cluster.nodes[1]
            .fragments
            .write(&FragmentKey::new("stray", 1, 0), b"junk")
            .await
            .unwrap();

        // a grant written behind the engine's back
        let files = cluster.files(0);
        let folder = files.create_folder(ADMIN, &cluster.root_id(), "f").unwrap();
        cluster.add_user("eve").unwrap();
        let now = crate::metadata::unix_now();
        let sneaky = crate::metadata::Permission {
            file_id: folder.id.clone(),
            permission_id: "sneaky".into(),
            principal: Principal::User("eve".into()),
            capabilities: Capabilities::ALL,
            status: crate::metadata::PermissionStatus::Active,
            created_at: now,
            modified_at: now,
        };
        cluster.store.transaction(|txn| txn.put(&sneaky)).unwrap();

        let health = cluster.health(0);
        let job = health
            .start_job(JobOptions {
                orphaned: true,
                permission: true,
                ..Default::default()
            })
            .unwrap();
        health.run_job(&job.id, None).await.unwrap();

        let results = health.job_results(&job.id).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].finding, Finding::OrphanedShard);
        assert_eq!(results[0].subject, stray);
        assert_eq!(results[0].server.as_deref(), Some("s2"));
        assert_eq!(results[1].finding, Finding::NarrowingViolation);
        assert_eq!(results[1].subject, "sneaky");
    }

    #[tokio::test]
    async fn test_unreachable_node_is_isolated() {
        let cluster = TestCluster::new(3).await;
        cluster.transport.set_reachable("s3", false);

        let health = cluster.health(0);
        let job = health
            .start_job(JobOptions {
                orphaned: true,
                ..Default::default()
            })
            .unwrap();
        let done = health.run_job(&job.id, None).await.unwrap();
        assert_eq!(done.state, JobState::CompletedWithErrors);

        let results = health.job_results(&job.id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].finding, Finding::CheckFailed);
        assert_eq!(results[0].server.as_deref(), Some("s3"));
    }

    #[tokio::test]
    async fn test_delete_fragments_check_runs_collector() {
        let cluster = TestCluster::new(3).await;
        let files = cluster.files(0);
        let file = files
            .write_file(ADMIN, &cluster.root_id(), "a", b"bye", NewFileOptions::default())
            .await
            .unwrap();
        files.delete_file(ADMIN, &file.id).unwrap();

        let health = cluster.health(0);
        let job = health
            .start_job(JobOptions {
                delete_fragments: true,
                ..Default::default()
            })
            .unwrap();
        let done = health.run_job(&job.id, None).await.unwrap();
        assert_eq!(done.state, JobState::CompletedNoErrors);

        let results = health.job_results(&job.id).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].finding, Finding::Collected);
        assert_eq!(cluster.shard_count().await, 0);
    }
}
