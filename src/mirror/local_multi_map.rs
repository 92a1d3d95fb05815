//! Local Multi-Map Module
//!
//! Mirror of a replicated multi-map. Multi-map events carry the full value
//! collection of a key rather than a delta, so every event is reconciled
//! against the local collection.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};

use super::{decode_key, encode_key, MapKey, MapValue};
use crate::cluster::{Cluster, EntryEvent, EntryListener, ReplicatedMultiMap, Subscription};
use crate::error::Result;

// == Local Multi-Map ==
pub struct LocalMultiMap<K, V> {
    name: String,
    local: Arc<RwLock<HashMap<K, Vec<V>>>>,
    remote: Arc<dyn ReplicatedMultiMap>,
    subscription: Mutex<Option<Subscription>>,
}

impl<K: MapKey, V: MapValue + PartialEq> LocalMultiMap<K, V> {
    pub async fn open(cluster: &dyn Cluster, name: &str) -> Result<Self> {
        let remote = cluster.multi_map(name);

        let mut seeded = HashMap::new();
        for (raw_key, raw_values) in remote.entries().await? {
            seeded.insert(decode_key(&raw_key)?, decode_values(raw_values)?);
        }

        let local = Arc::new(RwLock::new(seeded));
        let listener = Arc::new(MultiMirrorListener {
            name: name.to_string(),
            local: Arc::downgrade(&local),
        });
        let subscription = remote.subscribe(listener);

        debug!("Opened multi-map mirror {}", name);
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
    pub fn get(&self, key: &K) -> Vec<V> {
        self.local.read().get(key).cloned().unwrap_or_default()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.local.read().contains_key(key)
    }

    pub fn contains_entry(&self, key: &K, value: &V) -> bool {
        self.local
            .read()
            .get(key)
            .map(|values| values.contains(value))
            .unwrap_or(false)
    }

    pub fn keys(&self) -> Vec<K> {
        self.local.read().keys().cloned().collect()
    }

    /// Total number of values across all keys.
    pub fn len(&self) -> usize {
        self.local.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.local.read().is_empty()
    }

    // == Writes ==
    /// Adds a value; returns false if the key already held it.
    pub async fn put(&self, key: K, value: V) -> Result<bool> {
        let raw_key = encode_key(&key)?;
        let raw_value = serde_json::to_value(&value)?;

        {
            let mut local = self.local.write();
            let values = local.entry(key).or_default();
            if !values.contains(&value) {
                values.push(value);
            }
        }
        Ok(self.remote.put(raw_key, raw_value).await?)
    }

    pub async fn remove(&self, key: &K, value: &V) -> Result<bool> {
        let raw_key = encode_key(key)?;
        let raw_value = serde_json::to_value(value)?;

        {
            let mut local = self.local.write();
            if let Some(values) = local.get_mut(key) {
                values.retain(|v| v != value);
                if values.is_empty() {
                    local.remove(key);
                }
            }
        }
        Ok(self.remote.remove(&raw_key, &raw_value).await?)
    }

    pub async fn remove_all(&self, key: &K) -> Result<Vec<V>> {
        let raw_key = encode_key(key)?;

        let previous = self.local.write().remove(key).unwrap_or_default();
        self.remote.remove_all(&raw_key).await?;
        Ok(previous)
    }

    pub async fn clear(&self) -> Result<()> {
        self.local.write().clear();
        self.remote.clear().await?;
        Ok(())
    }

    pub fn close(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
            debug!("Closed multi-map mirror {}", self.name);
        }
    }
}

fn decode_values<V: MapValue>(raw: Vec<Value>) -> Result<Vec<V>> {
    raw.into_iter()
        .map(|v| Ok(serde_json::from_value(v)?))
        .collect()
}

// == Multi Mirror Listener ==
struct MultiMirrorListener<K, V> {
    name: String,
    local: Weak<RwLock<HashMap<K, Vec<V>>>>,
}

impl<K: MapKey, V: MapValue + PartialEq> MultiMirrorListener<K, V> {
    fn reconcile(&self, event: &EntryEvent) -> Result<()> {
        let Some(local) = self.local.upgrade() else {
            return Ok(());
        };
        let key: K = decode_key(&event.key)?;
        let incoming: Vec<V> = match &event.new_value {
            Some(Value::Array(values)) => decode_values(values.clone())?,
            Some(single) => vec![serde_json::from_value(single.clone())?],
            None => Vec::new(),
        };

        let mut local = local.write();
        let values = local.entry(key.clone()).or_default();
        // Values missing from the snapshot were removed elsewhere.
        values.retain(|v| incoming.contains(v));
        for value in incoming {
            if !values.contains(&value) {
                values.push(value);
            }
        }
        if values.is_empty() {
            local.remove(&key);
        }
        Ok(())
    }
}

impl<K: MapKey, V: MapValue + PartialEq> EntryListener for MultiMirrorListener<K, V> {
    fn on_event(&self, event: &EntryEvent) {
        if let Err(e) = self.reconcile(event) {
            warn!("Ignoring event on {} for key {}: {}", self.name, event.key, e);
        }
    }
}
