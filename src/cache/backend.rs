//! Cache Backend Module
//!
//! The hooks a concrete cache supplies: how to read and write the backing
//! resource, and how debounced requests merge.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::mirror::{MapKey, MapValue};

/// Per-bucket contents: bucket name to entries.
pub type BucketData<K, V> = HashMap<String, HashMap<K, V>>;

// == Cache Backend ==
/// Backing-resource hooks for a `ClusterCache`.
///
/// `do_load` and `do_save` only ever run with the cache lock held, so they need
/// no locking or staleness checks of their own.
#[async_trait]
pub trait CacheBackend: Send + Sync + 'static {
    type Key: MapKey;
    type Value: MapValue;
    /// What callers pass to `notify`
    type Event: Send + 'static;
    /// Payload of a load task
    type LoadData: Serialize + DeserializeOwned + Send + Sync + 'static;
    /// Payload of a save task
    type SaveData: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Names of the buckets this cache mirrors.
    fn buckets(&self) -> Vec<String>;

    /// Reads the backing resource.
    ///
    /// Returns the replacement content of every bucket; a bucket missing from
    /// the result is emptied.
    async fn do_load(
        &self,
        initializing: bool,
        data: Option<Self::LoadData>,
    ) -> anyhow::Result<BucketData<Self::Key, Self::Value>>;

    /// Persists the current content. Failures are logged by the caller and not retried.
    async fn do_save(
        &self,
        data: Option<Self::SaveData>,
        snapshot: &BucketData<Self::Key, Self::Value>,
    ) -> anyhow::Result<()>;

    fn get_load_data(&self, _event: Option<Self::Event>) -> Option<Self::LoadData> {
        None
    }

    fn get_save_data(
        &self,
        _snapshot: &BucketData<Self::Key, Self::Value>,
    ) -> Option<Self::SaveData> {
        None
    }

    /// Merges two debounced load payloads. Keeps the latest by default.
    fn reduce_load_data(
        &self,
        _previous: Option<Self::LoadData>,
        current: Option<Self::LoadData>,
    ) -> Option<Self::LoadData> {
        current
    }

    /// Merges two debounced save payloads. Keeps the latest by default.
    fn reduce_save_data(
        &self,
        _previous: Option<Self::SaveData>,
        current: Option<Self::SaveData>,
    ) -> Option<Self::SaveData> {
        current
    }
}
