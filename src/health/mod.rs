//! Health Module - maintenance jobs and shard repair
//!
//! Jobs scan the cluster for missing, corrupt and orphaned shards, audit
//! permission grants and trigger collection. Damaged content is rebuilt
//! from its surviving shards while enough of them remain.

mod checks;
mod job;
mod monitor;
mod repair;

pub use job::{CheckKind, CheckLine, Finding, Job, JobOptions, JobProgress, JobResult, JobState};
pub use monitor::HealthMonitor;
pub use repair::{RepairReport, Repairer};
