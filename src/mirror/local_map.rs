//! Local Map Module
//!
//! A zero-latency mirror of one replicated map.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use super::{decode_key, encode_key, MapKey, MapValue};
use crate::cluster::{Cluster, EntryEvent, EntryEventKind, EntryListener, ReplicatedMap, Subscription};
use crate::error::Result;

// == Local Map ==
/// Local mirror of a replicated map.
///
/// Mutations update the local copy and then the cluster, so the caller sees
/// its own write immediately. Reads only touch the local copy. Change events
/// from any process overwrite or delete local entries, last write wins.
pub struct LocalMap<K, V> {
    name: String,
    local: Arc<RwLock<HashMap<K, V>>>,
    remote: Arc<dyn ReplicatedMap>,
    subscription: Mutex<Option<Subscription>>,
}

impl<K: MapKey, V: MapValue> LocalMap<K, V> {
    // == Constructor ==
    /// Seeds a mirror from the full replicated map, then subscribes to its events.
    pub async fn open(cluster: &dyn Cluster, name: &str) -> Result<Self> {
        let remote = cluster.map(name);

        let mut seeded = HashMap::new();
        for (raw_key, raw_value) in remote.entries().await? {
            seeded.insert(decode_key(&raw_key)?, serde_json::from_value(raw_value)?);
        }
        let count = seeded.len();

        let local = Arc::new(RwLock::new(seeded));
        let listener = Arc::new(MirrorListener {
            name: name.to_string(),
            local: Arc::downgrade(&local),
        });
        let subscription = remote.subscribe(listener);

        debug!("Opened mirror {} with {} entries", name, count);
        Ok(Self {
            name: name.to_string(),
            local,
            remote,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // == Reads ==
    pub fn get(&self, key: &K) -> Option<V> {
        self.local.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.local.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.local.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.read().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.local.read().keys().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.local
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Copy of the whole mirror.
    pub fn snapshot(&self) -> HashMap<K, V> {
        self.local.read().clone()
    }

    // == Writes ==
    /// Stores a value locally and in the cluster; returns the previous local value.
    pub async fn put(&self, key: K, value: V) -> Result<Option<V>> {
        let raw_key = encode_key(&key)?;
        let raw_value = serde_json::to_value(&value)?;

        let previous = self.local.write().insert(key, value);
        self.remote.put(raw_key, raw_value).await?;
        Ok(previous)
    }

    pub async fn remove(&self, key: &K) -> Result<Option<V>> {
        let raw_key = encode_key(key)?;

        let previous = self.local.write().remove(key);
        self.remote.remove(&raw_key).await?;
        Ok(previous)
    }

    pub async fn put_all(&self, entries: HashMap<K, V>) -> Result<()> {
        let raw = encode_entries(&entries)?;

        self.local.write().extend(entries);
        self.remote.put_all(raw).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.local.write().clear();
        self.remote.clear().await?;
        Ok(())
    }

    /// Stores the value only if the key is already present.
    pub async fn replace(&self, key: K, value: V) -> Result<Option<V>> {
        if !self.contains_key(&key) {
            return Ok(None);
        }
        self.put(key, value).await
    }

    /// Stores the value only if the key is absent.
    ///
    /// Returns the existing value otherwise. A value present in the cluster but
    /// not yet mirrored wins over the local attempt.
    pub async fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        let raw_key = encode_key(&key)?;
        let raw_value = serde_json::to_value(&value)?;

        {
            let mut local = self.local.write();
            if let Some(existing) = local.get(&key) {
                return Ok(Some(existing.clone()));
            }
            local.insert(key.clone(), value);
        }

        match self.remote.put_if_absent(raw_key, raw_value).await? {
            None => Ok(None),
            Some(raw_existing) => {
                let existing: V = serde_json::from_value(raw_existing)?;
                self.local.write().insert(key, existing.clone());
                Ok(Some(existing))
            }
        }
    }

    /// Replaces the whole content with `entries`, locally and in the cluster.
    ///
    /// Keys kept across the replacement never disappear from the mirror.
    pub(crate) async fn replace_all(&self, entries: HashMap<K, V>) -> Result<()> {
        let raw = encode_entries(&entries)?;
        let current = self.remote.entries().await?;
        let stale: Vec<String> = {
            let kept: HashSet<&str> = raw.iter().map(|(k, _)| k.as_str()).collect();
            current
                .into_iter()
                .map(|(k, _)| k)
                .filter(|k| !kept.contains(k.as_str()))
                .collect()
        };

        *self.local.write() = entries;
        for key in &stale {
            self.remote.remove(key).await?;
        }
        self.remote.put_all(raw).await?;
        Ok(())
    }

    // == Key Locks ==
    pub async fn lock_key(&self, key: &K, owner: &str, wait: Duration) -> Result<bool> {
        Ok(self.remote.lock_key(&encode_key(key)?, owner, wait).await?)
    }

    pub async fn unlock_key(&self, key: &K, owner: &str) -> Result<()> {
        Ok(self.remote.unlock_key(&encode_key(key)?, owner).await?)
    }

    // == Close ==
    /// Stops listening for changes. The replicated map itself is left alone.
    pub fn close(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
            debug!("Closed mirror {}", self.name);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.subscription.lock().is_none()
    }
}

fn encode_entries<K: MapKey, V: MapValue>(
    entries: &HashMap<K, V>,
) -> Result<Vec<(String, serde_json::Value)>> {
    entries
        .iter()
        .map(|(k, v)| Ok((encode_key(k)?, serde_json::to_value(v)?)))
        .collect()
}

// == Mirror Listener ==
struct MirrorListener<K, V> {
    name: String,
    local: Weak<RwLock<HashMap<K, V>>>,
}

impl<K: MapKey, V: MapValue> EntryListener for MirrorListener<K, V> {
    fn on_event(&self, event: &EntryEvent) {
        let Some(local) = self.local.upgrade() else {
            return;
        };
        let key: K = match decode_key(&event.key) {
            Ok(key) => key,
            Err(e) => {
                warn!("Ignoring event on {} for key {}: {}", self.name, event.key, e);
                return;
            }
        };

        match (event.kind, &event.new_value) {
            (EntryEventKind::Removed, _) | (_, None) => {
                local.write().remove(&key);
            }
            (_, Some(raw)) => match serde_json::from_value::<V>(raw.clone()) {
                Ok(value) => {
                    local.write().insert(key, value);
                }
                Err(e) => warn!("Ignoring event on {} for key {}: {}", self.name, event.key, e),
            },
        }
    }
}
