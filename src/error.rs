//! Error types for the cluster cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cluster Error Enum ==
/// Failures reported by the cluster transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// The cluster is reconfiguring and the operation could not complete
    #[error("Cluster topology changed: {0}")]
    Topology(String),

    /// Unlock attempted by a caller that does not hold the lock
    #[error("Lock not held by caller: {0}")]
    NotLockOwner(String),

    /// Object is in use and cannot be destroyed right now
    #[error("Distributed object busy: {0}")]
    Busy(String),
}

// == Cache Error Enum ==
/// Unified error type for the cache core.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Operation attempted on a closed cache instance
    #[error("Cache closed: {0}")]
    Closed(String),

    /// Bucket name not declared by the backend
    #[error("Unknown bucket: {0}")]
    UnknownBucket(String),

    /// Distributed lock could not be acquired within the configured wait
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Transport failure
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Key, value or task payload could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Backing resource failure raised by a backend hook
    #[error("Backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl CacheError {
    /// Returns true for errors the worker should retry after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Cluster(_) | CacheError::LockTimeout(_))
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache core.
pub type Result<T> = std::result::Result<T, CacheError>;
