//! Cluster Module
//!
//! The distributed primitives the cache core is built on: named locks, atomic
//! longs and references, replicated maps and multi-maps, and change events.
//! Every operation is assumed linearizable on its own; nothing is atomic
//! across operations.

mod events;
mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ClusterError;

pub use events::{EntryEvent, EntryEventKind, EntryListener, Subscription};
pub use memory::InMemoryCluster;

/// Result type for transport operations.
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

// == Cluster ==
/// Entry point to the cluster transport.
///
/// Handles are cheap proxies resolved by name; the underlying object is
/// created on first use and recreated empty after `destroy`.
#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    fn lock(&self, name: &str) -> Arc<dyn DistributedLock>;

    fn atomic_long(&self, name: &str) -> Arc<dyn AtomicLong>;

    fn atomic_reference(&self, name: &str) -> Arc<dyn AtomicReference>;

    fn map(&self, name: &str) -> Arc<dyn ReplicatedMap>;

    fn multi_map(&self, name: &str) -> Arc<dyn ReplicatedMultiMap>;

    /// Deletes the named object cluster-wide.
    async fn destroy(&self, name: &str) -> ClusterResult<()>;
}

// == Distributed Lock ==
/// Named, owner-tagged, non-reentrant mutual exclusion.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    fn name(&self) -> &str;

    /// Tries to take the lock for `owner`, waiting at most `wait`.
    ///
    /// Returns false when the wait elapsed without acquiring it.
    async fn try_lock(&self, owner: &str, wait: Duration) -> ClusterResult<bool>;

    async fn unlock(&self, owner: &str) -> ClusterResult<()>;
}

// == Atomic Long ==
#[async_trait]
pub trait AtomicLong: Send + Sync {
    async fn get(&self) -> ClusterResult<i64>;

    async fn set(&self, value: i64) -> ClusterResult<()>;

    /// Adds `delta` and returns the new value.
    async fn add(&self, delta: i64) -> ClusterResult<i64>;

    async fn compare_and_set(&self, expect: i64, update: i64) -> ClusterResult<bool>;

    async fn increment(&self) -> ClusterResult<i64> {
        self.add(1).await
    }

    async fn decrement(&self) -> ClusterResult<i64> {
        self.add(-1).await
    }
}

// == Atomic Reference ==
#[async_trait]
pub trait AtomicReference: Send + Sync {
    async fn get(&self) -> ClusterResult<Option<Value>>;

    async fn set(&self, value: Option<Value>) -> ClusterResult<()>;

    async fn compare_and_set(
        &self,
        expect: Option<Value>,
        update: Option<Value>,
    ) -> ClusterResult<bool>;
}

// == Replicated Map ==
/// Replicated key-value map. Keys are strings, values JSON documents.
#[async_trait]
pub trait ReplicatedMap: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> ClusterResult<Option<Value>>;

    async fn entries(&self) -> ClusterResult<Vec<(String, Value)>>;

    /// Stores the value and returns the previous one.
    async fn put(&self, key: String, value: Value) -> ClusterResult<Option<Value>>;

    /// Stores the value only if the key is absent; returns the existing value otherwise.
    async fn put_if_absent(&self, key: String, value: Value) -> ClusterResult<Option<Value>>;

    async fn remove(&self, key: &str) -> ClusterResult<Option<Value>>;

    async fn put_all(&self, entries: Vec<(String, Value)>) -> ClusterResult<()>;

    async fn clear(&self) -> ClusterResult<()>;

    async fn lock_key(&self, key: &str, owner: &str, wait: Duration) -> ClusterResult<bool>;

    async fn unlock_key(&self, key: &str, owner: &str) -> ClusterResult<()>;

    fn subscribe(&self, listener: Arc<dyn EntryListener>) -> Subscription;
}

// == Replicated Multi-Map ==
/// Replicated map of key to a collection of distinct values.
///
/// Change events carry the whole value collection of a key as a JSON array.
#[async_trait]
pub trait ReplicatedMultiMap: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> ClusterResult<Vec<Value>>;

    async fn entries(&self) -> ClusterResult<Vec<(String, Vec<Value>)>>;

    /// Adds a value; returns false if it was already present.
    async fn put(&self, key: String, value: Value) -> ClusterResult<bool>;

    /// Removes one value; returns false if it was not present.
    async fn remove(&self, key: &str, value: &Value) -> ClusterResult<bool>;

    async fn remove_all(&self, key: &str) -> ClusterResult<Vec<Value>>;

    async fn clear(&self) -> ClusterResult<()>;

    fn subscribe(&self, listener: Arc<dyn EntryListener>) -> Subscription;
}
