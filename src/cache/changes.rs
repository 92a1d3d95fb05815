//! Change Set Module
//!
//! Records the mutations a `modify` closure makes so they can be written
//! through to the mirrors once the closure returns.

use std::collections::HashMap;

use crate::error::{CacheError, Result};
use crate::mirror::{LocalMap, MapKey, MapValue};

enum Change<K, V> {
    Put { bucket: String, key: K, value: V },
    Remove { bucket: String, key: K },
    Clear { bucket: String },
}

impl<K, V> Change<K, V> {
    fn bucket(&self) -> &str {
        match self {
            Change::Put { bucket, .. } | Change::Remove { bucket, .. } | Change::Clear { bucket } => {
                bucket
            }
        }
    }
}

// == Changes ==
/// Mutations staged by a `modify` call.
///
/// Reads see the staged changes on top of the current mirror content, so a
/// closure can read-modify-write the same key several times.
pub struct Changes<'a, K, V> {
    buckets: &'a HashMap<String, LocalMap<K, V>>,
    ops: Vec<Change<K, V>>,
}

impl<'a, K: MapKey, V: MapValue> Changes<'a, K, V> {
    pub(crate) fn new(buckets: &'a HashMap<String, LocalMap<K, V>>) -> Self {
        Self {
            buckets,
            ops: Vec::new(),
        }
    }

    pub fn get(&self, bucket: &str, key: &K) -> Option<V> {
        for op in self.ops.iter().rev() {
            match op {
                Change::Put { bucket: b, key: k, value } if b == bucket && k == key => {
                    return Some(value.clone())
                }
                Change::Remove { bucket: b, key: k } if b == bucket && k == key => return None,
                Change::Clear { bucket: b } if b == bucket => return None,
                _ => {}
            }
        }
        self.buckets.get(bucket).and_then(|map| map.get(key))
    }

    pub fn contains_key(&self, bucket: &str, key: &K) -> bool {
        self.get(bucket, key).is_some()
    }

    pub fn put(&mut self, bucket: &str, key: K, value: V) {
        self.ops.push(Change::Put {
            bucket: bucket.to_string(),
            key,
            value,
        });
    }

    pub fn remove(&mut self, bucket: &str, key: K) {
        self.ops.push(Change::Remove {
            bucket: bucket.to_string(),
            key,
        });
    }

    pub fn clear(&mut self, bucket: &str) {
        self.ops.push(Change::Clear {
            bucket: bucket.to_string(),
        });
    }

    /// Number of staged mutations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    // == Apply ==
    /// Writes every staged mutation through, in order.
    ///
    /// Nothing is written if any mutation names an unknown bucket.
    pub(crate) async fn apply(self) -> Result<usize> {
        if let Some(op) = self
            .ops
            .iter()
            .find(|op| !self.buckets.contains_key(op.bucket()))
        {
            return Err(CacheError::UnknownBucket(op.bucket().to_string()));
        }

        let count = self.ops.len();
        for op in self.ops {
            let map = &self.buckets[op.bucket()];
            match op {
                Change::Put { key, value, .. } => {
                    map.put(key, value).await?;
                }
                Change::Remove { key, .. } => {
                    map.remove(&key).await?;
                }
                Change::Clear { .. } => map.clear().await?,
            }
        }
        Ok(count)
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;

    async fn buckets(cluster: &InMemoryCluster) -> HashMap<String, LocalMap<String, i64>> {
        let mut buckets = HashMap::new();
        buckets.insert(
            "counters".to_string(),
            LocalMap::open(cluster, "t.bucket.counters").await.unwrap(),
        );
        buckets
    }

    #[tokio::test]
    async fn test_reads_see_staged_changes() {
        let cluster = InMemoryCluster::new();
        let buckets = buckets(&cluster).await;
        buckets["counters"].put("a".into(), 1).await.unwrap();

        let mut changes = Changes::new(&buckets);
        let a = "a".to_string();
        assert_eq!(changes.get("counters", &a), Some(1));

        changes.put("counters", a.clone(), 2);
        assert_eq!(changes.get("counters", &a), Some(2));

        changes.remove("counters", a.clone());
        assert!(!changes.contains_key("counters", &a));

        changes.put("counters", a.clone(), 3);
        changes.clear("counters");
        assert_eq!(changes.get("counters", &a), None);
        assert_eq!(changes.len(), 5);

        // Nothing written until applied
        assert_eq!(buckets["counters"].get(&a), Some(1));
    }

    #[tokio::test]
    async fn test_apply_writes_in_order() {
        let cluster = InMemoryCluster::new();
        let buckets = buckets(&cluster).await;

        let mut changes = Changes::new(&buckets);
        changes.put("counters", "a".into(), 1);
        changes.put("counters", "b".into(), 2);
        changes.remove("counters", "a".into());
        assert_eq!(changes.apply().await.unwrap(), 3);

        let map = &buckets["counters"];
        assert_eq!(map.get(&"a".to_string()), None);
        assert_eq!(map.get(&"b".to_string()), Some(2));
    }

    #[tokio::test]
    async fn test_unknown_bucket_writes_nothing() {
        let cluster = InMemoryCluster::new();
        let buckets = buckets(&cluster).await;

        let mut changes = Changes::new(&buckets);
        changes.put("counters", "a".into(), 1);
        changes.put("missing", "b".into(), 2);

        let result = changes.apply().await;
        assert!(matches!(result, Err(CacheError::UnknownBucket(name)) if name == "missing"));
        assert!(buckets["counters"].is_empty());
    }
}
