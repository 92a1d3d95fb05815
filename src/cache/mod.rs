//! Cache Module
//!
//! Cluster-backed cache core: mirrored buckets kept in sync with a slow
//! backing resource through debounced load and save tasks.

mod backend;
mod changes;
mod cluster_cache;
mod task;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use backend::{BucketData, CacheBackend};
pub use changes::Changes;
pub use cluster_cache::ClusterCache;
pub(crate) use cluster_cache::WorkerStep;
pub use task::{CacheTask, TaskKind};

// == Public Constants ==
/// A deferred task never runs later than this many debounce windows after creation
pub const MAX_DEFER_WINDOWS: i64 = 4;

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
