//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check mirror equivalence against a plain map model and
//! the debounce fold of merged save requests.

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cache::{BucketData, CacheBackend, CacheTask, ClusterCache, TaskKind, MAX_DEFER_WINDOWS};
use crate::cluster::InMemoryCluster;
use crate::config::CacheConfig;
use crate::mirror::{LocalMap, LocalMultiMap};

// == Strategies ==
fn key_strategy() -> impl Strategy<Value = String> {
    "[a-e]".prop_map(|s| s)
}

#[derive(Debug, Clone)]
enum MapOp {
    Put { key: String, value: i64 },
    Remove { key: String },
    PutIfAbsent { key: String, value: i64 },
    Clear,
}

fn map_op_strategy() -> impl Strategy<Value = MapOp> {
    prop_oneof![
        4 => (key_strategy(), any::<i64>()).prop_map(|(key, value)| MapOp::Put { key, value }),
        2 => key_strategy().prop_map(|key| MapOp::Remove { key }),
        2 => (key_strategy(), any::<i64>()).prop_map(|(key, value)| MapOp::PutIfAbsent { key, value }),
        1 => Just(MapOp::Clear),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// == Debounce Backend ==
/// Save payload is the list of values written, so the fold is observable.
struct FoldBackend {
    saves: Mutex<Vec<Option<Vec<i64>>>>,
}

#[async_trait]
impl CacheBackend for FoldBackend {
    type Key = String;
    type Value = i64;
    type Event = ();
    type LoadData = ();
    type SaveData = Vec<i64>;

    fn buckets(&self) -> Vec<String> {
        vec!["main".to_string()]
    }

    async fn do_load(
        &self,
        _initializing: bool,
        _data: Option<()>,
    ) -> anyhow::Result<BucketData<String, i64>> {
        Ok(HashMap::new())
    }

    async fn do_save(
        &self,
        data: Option<Vec<i64>>,
        _snapshot: &BucketData<String, i64>,
    ) -> anyhow::Result<()> {
        self.saves.lock().push(data);
        Ok(())
    }

    fn get_save_data(&self, snapshot: &BucketData<String, i64>) -> Option<Vec<i64>> {
        snapshot
            .get("main")
            .and_then(|main| main.get("x"))
            .map(|x| vec![*x])
    }

    fn reduce_save_data(
        &self,
        previous: Option<Vec<i64>>,
        current: Option<Vec<i64>>,
    ) -> Option<Vec<i64>> {
        let mut folded = previous.unwrap_or_default();
        folded.extend(current.unwrap_or_default());
        Some(folded)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    // A mirror always equals a plain map receiving the same operations, and a
    // second mirror of the same distributed map converges to it.
    #[test]
    fn prop_local_map_matches_model(ops in prop::collection::vec(map_op_strategy(), 1..40)) {
        let rt = runtime();
        rt.block_on(async {
            let cluster = InMemoryCluster::new();
            let writer: LocalMap<String, i64> = LocalMap::open(&cluster, "prop.map").await.unwrap();
            let reader: LocalMap<String, i64> = LocalMap::open(&cluster, "prop.map").await.unwrap();
            let mut model: HashMap<String, i64> = HashMap::new();

            for op in ops {
                match op {
                    MapOp::Put { key, value } => {
                        let old = writer.put(key.clone(), value).await.unwrap();
                        assert_eq!(old, model.insert(key, value));
                    }
                    MapOp::Remove { key } => {
                        let old = writer.remove(&key).await.unwrap();
                        assert_eq!(old, model.remove(&key));
                    }
                    MapOp::PutIfAbsent { key, value } => {
                        let existing = writer.put_if_absent(key.clone(), value).await.unwrap();
                        assert_eq!(existing, model.get(&key).copied());
                        model.entry(key).or_insert(value);
                    }
                    MapOp::Clear => {
                        writer.clear().await.unwrap();
                        model.clear();
                    }
                }
                assert_eq!(writer.snapshot(), model);
            }
            assert_eq!(reader.snapshot(), model);
        });
    }

    // Multi-map mirrors reconcile whole-collection events, including shrinking ones.
    #[test]
    fn prop_local_multi_map_converges(
        ops in prop::collection::vec((key_strategy(), 0i64..4, any::<bool>()), 1..40)
    ) {
        let rt = runtime();
        rt.block_on(async {
            let cluster = InMemoryCluster::new();
            let writer: LocalMultiMap<String, i64> = LocalMultiMap::open(&cluster, "prop.multi").await.unwrap();
            let reader: LocalMultiMap<String, i64> = LocalMultiMap::open(&cluster, "prop.multi").await.unwrap();

            for (key, value, add) in ops {
                if add {
                    writer.put(key.clone(), value).await.unwrap();
                } else {
                    writer.remove(&key, &value).await.unwrap();
                }
                assert_eq!(writer.contains_entry(&key, &value), add);
                assert_eq!(reader.contains_entry(&key, &value), add);
            }
            assert_eq!(reader.len(), writer.len());
            for key in writer.keys() {
                let mut expected = writer.get(&key);
                let mut actual = reader.get(&key);
                expected.sort();
                actual.sort();
                assert_eq!(actual, expected);
            }
        });
    }

    // Deferring never moves the due time backwards or past the cap.
    #[test]
    fn prop_defer_bounded(delay_ms in 1u64..1000, merges in 1usize..20) {
        let delay = Duration::from_millis(delay_ms);
        let mut task = CacheTask::new(TaskKind::Save, None, delay, 0);
        let cap = task.created_at + delay_ms as i64 * MAX_DEFER_WINDOWS;

        for _ in 0..merges {
            let before = task.due_at;
            task.defer(delay, None, 0);
            prop_assert!(task.due_at >= before);
            prop_assert!(task.due_at <= cap.max(before));
        }
        prop_assert_eq!(task.merged as usize, merges);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    // N modifies inside one window produce one save whose payload is the fold
    // of every modify's payload.
    #[test]
    fn prop_debounce_folds_saves(values in prop::collection::vec(any::<i64>(), 1..8)) {
        let rt = runtime();
        rt.block_on(async {
            let config = CacheConfig {
                save_delay: Duration::from_secs(60),
                ..CacheConfig::new("prop.")
            };
            let backend = FoldBackend { saves: Mutex::new(Vec::new()) };
            let cache = ClusterCache::attach(Arc::new(InMemoryCluster::new()), backend, config)
                .await
                .unwrap();
            cache.initialize().await.unwrap();

            for value in &values {
                let value = *value;
                cache
                    .modify(move |changes| changes.put("main", "x".to_string(), value))
                    .await
                    .unwrap();
            }
            assert!(cache.backend().saves.lock().is_empty());

            // The last close flushes the pending save.
            cache.close().await.unwrap();
            let saves = cache.backend().saves.lock().clone();
            assert_eq!(saves, vec![Some(values.clone())]);
        });
    }
}
