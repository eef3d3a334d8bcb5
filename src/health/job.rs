//! Maintenance job records and their options

use crate::metadata::{KeyBuilder, Record};
use crate::{Result, ShardVaultError};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which checks a maintenance job runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Every fragment row's shard is present on its server
    pub missing: bool,

    /// Shard files no fragment row points at
    pub orphaned: bool,

    /// Headers of this node's shards are intact
    pub quick: bool,

    /// Every live blob decodes and matches its checksum
    pub full: bool,

    /// No grant exceeds what its parent allows
    pub permission: bool,

    /// Run the garbage collector
    pub delete_fragments: bool,
}

impl JobOptions {
    pub fn all() -> Self {
        Self {
            missing: true,
            orphaned: true,
            quick: true,
            full: true,
            permission: true,
            delete_fragments: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.enabled_checks().is_empty() {
            return Err(ShardVaultError::InvalidInput(
                "a maintenance job needs at least one check".into(),
            ));
        }
        Ok(())
    }

    /// Enabled checks in execution order
    pub fn enabled_checks(&self) -> Vec<CheckKind> {
        [
            (self.quick, CheckKind::Quick),
            (self.missing, CheckKind::Missing),
            (self.full, CheckKind::Full),
            (self.orphaned, CheckKind::Orphaned),
            (self.permission, CheckKind::Permission),
            (self.delete_fragments, CheckKind::DeleteFragments),
        ]
        .into_iter()
        .filter_map(|(enabled, check)| enabled.then_some(check))
        .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckKind {
    Quick,
    Missing,
    Orphaned,
    Full,
    Permission,
    DeleteFragments,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckKind::Quick => "quick",
            CheckKind::Missing => "missing",
            CheckKind::Orphaned => "orphaned",
            CheckKind::Full => "full",
            CheckKind::Permission => "permission",
            CheckKind::DeleteFragments => "delete-fragments",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    CompletedNoErrors,
    CompletedWithErrors,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::CompletedNoErrors | JobState::CompletedWithErrors)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub options: JobOptions,
    pub state: JobState,

    /// Server that ran (or will run) the job
    pub server: String,

    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

impl Job {
    pub fn key_for(id: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(id).build()
    }
}

impl Record for Job {
    const TABLE: &'static str = "job";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.id)
    }
}

/// Progress of one check within a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    pub check: CheckKind,
    pub total: u64,
    pub done: u64,
    pub errors: u64,
    pub finished: bool,
}

impl JobProgress {
    pub fn key_for(job_id: &str, check: CheckKind) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE)
            .str(job_id)
            .str(&check.to_string())
            .build()
    }

    pub fn prefix_for(job_id: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(job_id).build()
    }
}

impl Record for JobProgress {
    const TABLE: &'static str = "jobp";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.job_id, self.check)
    }
}

/// What a check concluded about one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Finding {
    Healthy,
    MissingShard,
    CorruptShard,
    OrphanedShard,
    Repaired,
    Unrecoverable,
    PasswordRequired,
    NarrowingViolation,
    Collected,

    /// The check itself could not examine the item
    CheckFailed,
}

impl Finding {
    pub fn is_error(&self) -> bool {
        !matches!(self, Finding::Healthy | Finding::Repaired | Finding::Collected)
    }
}

/// One persisted line of a job's result set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub seq: u64,
    pub check: CheckKind,

    /// Fragment path, dataId, file id or permission id the line is about
    pub subject: String,

    pub server: Option<String>,
    pub finding: Finding,
    pub detail: String,

    /// Not worth retrying automatically
    pub fatal: bool,
}

impl JobResult {
    pub fn key_for(job_id: &str, seq: u64) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(job_id).u64(seq).build()
    }

    pub fn prefix_for(job_id: &str) -> Vec<u8> {
        KeyBuilder::table(Self::TABLE).str(job_id).build()
    }
}

impl Record for JobResult {
    const TABLE: &'static str = "jobr";

    fn key(&self) -> Vec<u8> {
        Self::key_for(&self.job_id, self.seq)
    }
}

/// A finding before it is numbered and persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckLine {
    pub subject: String,
    pub server: Option<String>,
    pub finding: Finding,
    pub detail: String,
    pub fatal: bool,
}

impl CheckLine {
    pub fn new(subject: impl Into<String>, finding: Finding, detail: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            server: None,
            finding,
            detail: detail.into(),
            fatal: false,
        }
    }

    pub fn on(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_validation() {
        assert_eq!(
            JobOptions::default().validate().unwrap_err().kind(),
            crate::ErrorKind::InvalidInput
        );

        let options = JobOptions {
            orphaned: true,
            quick: true,
            ..Default::default()
        };
        options.validate().unwrap();
        assert_eq!(
            options.enabled_checks(),
            vec![CheckKind::Quick, CheckKind::Orphaned]
        );
        assert_eq!(JobOptions::all().enabled_checks().len(), 6);
    }

    #[test]
    fn test_result_keys_keep_order() {
        assert!(JobResult::key_for("j", 2) < JobResult::key_for("j", 10));
        assert!(JobResult::key_for("j", 2).starts_with(&JobResult::prefix_for("j")));
        assert!(!JobProgress::key_for("j2", CheckKind::Full).starts_with(&JobProgress::prefix_for("j")));
    }
}
