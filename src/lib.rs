//! Cluster Cache - A cluster-backed cache core
//!
//! Keeps named buckets of entries mirrored on every attached process and in
//! sync with a slow backing resource through debounced loads and saves.

pub mod backends;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod mirror;
mod tasks;

pub use backends::JsonFileBackend;
pub use cache::{CacheBackend, ClusterCache};
pub use cluster::{Cluster, InMemoryCluster};
pub use config::CacheConfig;
pub use error::{CacheError, ClusterError};
pub use mirror::{LocalMap, LocalMultiMap};
