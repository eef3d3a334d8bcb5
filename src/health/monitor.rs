//! Maintenance job lifecycle
//!
//! A job is persisted as `Queued` with one progress row per enabled check.
//! Running it flips it to `Running`, executes the checks in order and
//! appends their findings as numbered result rows, so the outcome stays
//! queryable from any node after the run.

use super::checks::CheckOutcome;
use super::job::{CheckKind, CheckLine, Finding, Job, JobOptions, JobProgress, JobResult, JobState};
use super::repair::Repairer;
use crate::cluster::FragmentService;
use crate::gc::{GarbageCollector, WorkerPool};
use crate::metadata::{abort, lease::MAINTENANCE_LEASE, new_id, unix_now, MetadataStore};
use crate::versioning::FileManager;
use crate::{Result, ShardVaultError};

use std::sync::Arc;

/// Live progress of the check being run
pub(crate) struct CheckProgress<'a> {
    store: &'a MetadataStore,
    job_id: &'a str,
    check: CheckKind,
}

impl CheckProgress<'_> {
    /// Persist `done` of `total` items; errors count the findings so far
    pub(crate) fn update(&self, total: u64, done: u64, lines: &[CheckLine]) {
        let row = JobProgress {
            job_id: self.job_id.to_string(),
            check: self.check,
            total,
            done,
            errors: lines.iter().filter(|l| l.finding.is_error()).count() as u64,
            finished: false,
        };
        if let Err(e) = self.store.transaction(|txn| txn.put(&row)) {
            tracing::warn!("Could not update progress of job {}: {}", self.job_id, e);
        }
    }
}

/// Runs maintenance jobs from one node
#[derive(Clone)]
pub struct HealthMonitor {
    pub(crate) files: FileManager,
    pub(crate) collector: GarbageCollector,
    pub(crate) local: Arc<FragmentService>,
    pub(crate) repairer: Repairer,
    pub(crate) pool: WorkerPool,
    lease_secs: i64,
    #[cfg(test)]
    pub(crate) fail_record: Arc<std::sync::atomic::AtomicBool>,
}

impl HealthMonitor {
    pub fn new(files: FileManager, collector: GarbageCollector, local: Arc<FragmentService>) -> Self {
        Self {
            repairer: Repairer::new(files.clone()),
            files,
            collector,
            local,
            pool: WorkerPool::default(),
            lease_secs: 6 * 3600,
            #[cfg(test)]
            fail_record: Default::default(),
        }
    }

    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn repairer(&self) -> &Repairer {
        &self.repairer
    }

    pub(crate) fn store(&self) -> &Arc<MetadataStore> {
        self.files.store()
    }

    pub fn server_name(&self) -> &str {
        self.local.name()
    }

    /// Persist a new job in `Queued`
    pub fn start_job(&self, options: JobOptions) -> Result<Job> {
        options.validate()?;

        let job = Job {
            id: new_id(),
            options,
            state: JobState::Queued,
            server: self.server_name().to_string(),
            created_at: unix_now(),
            started_at: None,
            finished_at: None,
        };
        self.store().transaction(|txn| {
            txn.put(&job)?;
            for check in options.enabled_checks() {
                txn.put(&JobProgress {
                    job_id: job.id.clone(),
                    check,
                    total: 0,
                    done: 0,
                    errors: 0,
                    finished: false,
                })?;
            }
            Ok(())
        })?;

        tracing::info!(
            "Queued maintenance job {} ({})",
            job.id,
            options
                .enabled_checks()
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(job)
    }

    /// Execute a queued job to completion.
    ///
    /// Only one job runs across the cluster at a time. The password, if
    /// given, unlocks password-sealed content for the full check and for
    /// repairs; it is never persisted.
    pub async fn run_job(&self, job_id: &str, password: Option<&str>) -> Result<Job> {
        let lease = self.store().acquire_lease(
            MAINTENANCE_LEASE,
            self.server_name(),
            self.lease_secs,
            unix_now(),
        )?;
        if let Some(warning) = lease.stale_warning() {
            tracing::warn!("{}", warning);
        }

        let result = self.execute(job_id, password).await;
        if let Err(e) = self.store().release_lease(MAINTENANCE_LEASE, self.server_name()) {
            tracing::warn!("Could not release the maintenance lease: {}", e);
        }
        result
    }

    async fn execute(&self, job_id: &str, password: Option<&str>) -> Result<Job> {
        let now = unix_now();
        let server = self.server_name().to_string();
        let mut job = self.store().transaction(|txn| {
            let mut job: Job = txn.require(&Job::key_for(job_id), "job")?;
            if job.state != JobState::Queued {
                return abort(ShardVaultError::Conflict(format!(
                    "job {} is already {:?}",
                    job_id, job.state
                )));
            }
            job.state = JobState::Running;
            job.started_at = Some(now);
            job.server = server.clone();
            txn.put(&job)?;
            Ok(job)
        })?;
        tracing::info!("Running maintenance job {}", job.id);

        let mut seq = 0;
        let checked = self.run_checks(&job, password, &mut seq).await;

        job.finished_at = Some(unix_now());
        let failure = match checked {
            Ok(errors) => {
                job.state = if errors == 0 {
                    JobState::CompletedNoErrors
                } else {
                    JobState::CompletedWithErrors
                };
                match self.store().transaction(|txn| txn.put(&job)) {
                    Ok(()) => {
                        tracing::info!(
                            "Maintenance job {} finished: {:?}, {} findings",
                            job.id,
                            job.state,
                            errors
                        );
                        return Ok(job);
                    }
                    Err(e) => {
                        let last = job.options.enabled_checks().last().copied();
                        (last.unwrap_or(CheckKind::Quick), e)
                    }
                }
            }
            Err(failure) => failure,
        };

        let (check, error) = failure;
        self.abandon(&mut job, check, seq, &error);
        Err(error)
    }

    /// Close a job whose bookkeeping failed so it never stays `Running`
    fn abandon(&self, job: &mut Job, check: CheckKind, seq: u64, error: &ShardVaultError) {
        tracing::error!("Maintenance job {} aborted during {}: {}", job.id, check, error);
        job.state = JobState::CompletedWithErrors;

        let line = JobResult {
            job_id: job.id.clone(),
            seq,
            check,
            subject: check.to_string(),
            server: Some(self.server_name().to_string()),
            finding: Finding::CheckFailed,
            detail: error.to_string(),
            fatal: false,
        };
        let job = &*job;
        if let Err(e) = self.store().transaction(|txn| {
            txn.put(&line)?;
            txn.put(job)
        }) {
            tracing::error!("Could not close maintenance job {}: {}", job.id, e);
        }
    }

    /// Run every enabled check; returns the number of error findings
    async fn run_checks(
        &self,
        job: &Job,
        password: Option<&str>,
        seq: &mut u64,
    ) -> std::result::Result<usize, (CheckKind, ShardVaultError)> {
        let mut errors = 0;
        for check in job.options.enabled_checks() {
            let progress = CheckProgress {
                store: self.store(),
                job_id: &job.id,
                check,
            };
            let outcome = match self.run_check(check, &progress, password).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Check {} of job {} failed: {}", check, job.id, e);
                    CheckOutcome {
                        examined: 0,
                        lines: vec![CheckLine::new(check.to_string(), Finding::CheckFailed, e.to_string())
                            .on(self.server_name())],
                    }
                }
            };
            errors += outcome.lines.iter().filter(|l| l.finding.is_error()).count();
            self.record(&job.id, check, seq, outcome).map_err(|e| (check, e))?;
        }
        Ok(errors)
    }

    async fn run_check(
        &self,
        check: CheckKind,
        progress: &CheckProgress<'_>,
        password: Option<&str>,
    ) -> Result<CheckOutcome> {
        match check {
            CheckKind::Quick => self.quick_check(progress, password).await,
            CheckKind::Missing => self.missing_check(progress, password).await,
            CheckKind::Full => self.full_check(progress, password).await,
            CheckKind::Orphaned => self.orphaned_check(progress).await,
            CheckKind::Permission => self.permission_check(),
            CheckKind::DeleteFragments => self.delete_fragments_check().await,
        }
    }

    /// Append a check's findings and close its progress row
    fn record(&self, job_id: &str, check: CheckKind, seq: &mut u64, outcome: CheckOutcome) -> Result<()> {
        #[cfg(test)]
        if self.fail_record.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ShardVaultError::Internal("result store unavailable".into()));
        }

        let first = *seq;
        let results: Vec<JobResult> = outcome
            .lines
            .into_iter()
            .zip(first..)
            .map(|(line, seq)| JobResult {
                job_id: job_id.to_string(),
                seq,
                check,
                subject: line.subject,
                server: line.server,
                finding: line.finding,
                detail: line.detail,
                fatal: line.fatal,
            })
            .collect();
        *seq += results.len() as u64;

        let progress = JobProgress {
            job_id: job_id.to_string(),
            check,
            total: outcome.examined,
            done: outcome.examined,
            errors: results.iter().filter(|r| r.finding.is_error()).count() as u64,
            finished: true,
        };
        self.store().transaction(|txn| {
            for result in &results {
                txn.put(result)?;
            }
            txn.put(&progress)
        })
    }

    pub fn get_job(&self, job_id: &str) -> Result<Job> {
        self.store().require(&Job::key_for(job_id), &format!("job {}", job_id))
    }

    /// Every job, newest first
    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.store().scan_table()?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    pub fn job_progress(&self, job_id: &str) -> Result<Vec<JobProgress>> {
        self.get_job(job_id)?;
        self.store().scan(&JobProgress::prefix_for(job_id))
    }

    /// Result rows of a job in the order they were found
    pub fn job_results(&self, job_id: &str) -> Result<Vec<JobResult>> {
        self.get_job(job_id)?;
        self.store().scan(&JobResult::prefix_for(job_id))
    }
}
