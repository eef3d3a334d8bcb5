//! GC Module - garbage collection of released content
//!
//! Released versions are only marked `ToBeDeleted` by the write path; this
//! module decides which content blobs have no live reference left, removes
//! their shards from every node, and then commits the metadata removal.

mod collector;
mod pool;
mod retention;

pub use collector::{
    DeletionGroup, DeletionPlan, GarbageCollector, GcConfig, GcMode, GcOutcome, GcReport,
};
pub use pool::WorkerPool;
