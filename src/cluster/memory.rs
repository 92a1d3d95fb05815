//! In-Memory Cluster
//!
//! A process-local implementation of every cluster primitive. Clones share the
//! same state, so several cache instances attached to clones behave like
//! processes sharing one cluster. Also carries the fault-injection and
//! accounting hooks the tests rely on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{
    AtomicLong, AtomicReference, Cluster, ClusterResult, DistributedLock, EntryEvent,
    EntryEventKind, EntryListener, ReplicatedMap, ReplicatedMultiMap, Subscription,
};
use crate::error::ClusterError;

type Listeners = Vec<(u64, Arc<dyn EntryListener>)>;

#[derive(Default)]
struct LockSlot {
    holder: Mutex<Option<String>>,
    released: Notify,
}

#[derive(Default)]
struct State {
    locks: Mutex<HashMap<String, Arc<LockSlot>>>,
    longs: Mutex<HashMap<String, i64>>,
    references: Mutex<HashMap<String, Value>>,
    maps: Mutex<HashMap<String, HashMap<String, Value>>>,
    multi_maps: Mutex<HashMap<String, HashMap<String, Vec<Value>>>>,
    listeners: Mutex<HashMap<String, Listeners>>,
    next_listener: AtomicU64,
    destroyed: Mutex<HashMap<String, usize>>,
    lock_faults: Mutex<HashMap<String, u32>>,
    destroy_faults: Mutex<HashMap<String, u32>>,
}

impl State {
    fn lock_slot(&self, name: &str) -> Arc<LockSlot> {
        self.locks.lock().entry(name.to_string()).or_default().clone()
    }

    fn take_fault(faults: &Mutex<HashMap<String, u32>>, name: &str) -> bool {
        let mut faults = faults.lock();
        match faults.get_mut(name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    async fn acquire(&self, name: &str, owner: &str, wait: Duration) -> ClusterResult<bool> {
        if Self::take_fault(&self.lock_faults, name) {
            return Err(ClusterError::Topology(format!("lock {} unavailable", name)));
        }

        let deadline = Instant::now() + wait;
        loop {
            // Resolved every round: a destroyed lock is replaced by a fresh slot.
            let slot = self.lock_slot(name);
            let released = slot.released.notified();
            {
                let mut holder = slot.holder.lock();
                if holder.is_none() {
                    *holder = Some(owner.to_string());
                    return Ok(true);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let _ = tokio::time::timeout(deadline - now, released).await;
        }
    }

    fn release(&self, name: &str, owner: &str) -> ClusterResult<()> {
        let slot = self.locks.lock().get(name).cloned();
        let Some(slot) = slot else {
            return Err(ClusterError::NotLockOwner(name.to_string()));
        };

        {
            let mut holder = slot.holder.lock();
            if holder.as_deref() != Some(owner) {
                return Err(ClusterError::NotLockOwner(format!("{} ({})", name, owner)));
            }
            *holder = None;
        }
        slot.released.notify_waiters();
        Ok(())
    }

    fn fire(&self, map: &str, events: Vec<EntryEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn EntryListener>> = self
            .listeners
            .lock()
            .get(map)
            .map(|registered| registered.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default();

        for event in &events {
            for listener in &listeners {
                listener.on_event(event);
            }
        }
    }

    fn subscribe(self: &Arc<Self>, map: &str, listener: Arc<dyn EntryListener>) -> Subscription {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .entry(map.to_string())
            .or_default()
            .push((id, listener));

        let state = Arc::downgrade(self);
        let map = map.to_string();
        Subscription::new(move || {
            if let Some(state) = state.upgrade() {
                if let Some(registered) = state.listeners.lock().get_mut(&map) {
                    registered.retain(|(listener_id, _)| *listener_id != id);
                }
            }
        })
    }
}

// == In-Memory Cluster ==
/// Shared in-process cluster. Clone it to hand the same cluster to several caches.
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<State>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `destroy` calls for the named object.
    pub fn destroy_count(&self, name: &str) -> usize {
        self.state.destroyed.lock().get(name).copied().unwrap_or(0)
    }

    /// Every destroyed name with its destroy count.
    pub fn destroyed(&self) -> HashMap<String, usize> {
        self.state.destroyed.lock().clone()
    }

    /// Makes the next `attempts` acquisitions of the named lock fail with a topology error.
    pub fn fail_lock_attempts(&self, name: &str, attempts: u32) {
        self.state.lock_faults.lock().insert(name.to_string(), attempts);
    }

    /// Makes the next `attempts` destroys of the named object fail as busy.
    pub fn fail_destroy_attempts(&self, name: &str, attempts: u32) {
        self.state
            .destroy_faults
            .lock()
            .insert(name.to_string(), attempts);
    }

    /// Current holder of the named lock, if any.
    pub fn lock_holder(&self, name: &str) -> Option<String> {
        let slot = self.state.locks.lock().get(name).cloned();
        slot.and_then(|slot| slot.holder.lock().clone())
    }

    /// Returns true if any object with this name currently exists.
    pub fn exists(&self, name: &str) -> bool {
        let s = &self.state;
        s.locks.lock().contains_key(name)
            || s.longs.lock().contains_key(name)
            || s.references.lock().contains_key(name)
            || s.maps.lock().contains_key(name)
            || s.multi_maps.lock().contains_key(name)
    }
}

#[async_trait]
impl Cluster for InMemoryCluster {
    fn lock(&self, name: &str) -> Arc<dyn DistributedLock> {
        Arc::new(MemoryLock {
            name: name.to_string(),
            state: self.state.clone(),
        })
    }

    fn atomic_long(&self, name: &str) -> Arc<dyn AtomicLong> {
        Arc::new(MemoryAtomicLong {
            name: name.to_string(),
            state: self.state.clone(),
        })
    }

    fn atomic_reference(&self, name: &str) -> Arc<dyn AtomicReference> {
        Arc::new(MemoryAtomicReference {
            name: name.to_string(),
            state: self.state.clone(),
        })
    }

    fn map(&self, name: &str) -> Arc<dyn ReplicatedMap> {
        Arc::new(MemoryMap {
            name: name.to_string(),
            state: self.state.clone(),
        })
    }

    fn multi_map(&self, name: &str) -> Arc<dyn ReplicatedMultiMap> {
        Arc::new(MemoryMultiMap {
            name: name.to_string(),
            state: self.state.clone(),
        })
    }

    async fn destroy(&self, name: &str) -> ClusterResult<()> {
        let s = &self.state;
        if State::take_fault(&s.destroy_faults, name) {
            return Err(ClusterError::Busy(name.to_string()));
        }

        {
            let mut locks = s.locks.lock();
            let held = locks
                .get(name)
                .map(|slot| slot.holder.lock().is_some())
                .unwrap_or(false);
            if held {
                return Err(ClusterError::Busy(name.to_string()));
            }
            if let Some(slot) = locks.remove(name) {
                slot.released.notify_waiters();
            }
            let key_lock_prefix = format!("{}[", name);
            locks.retain(|lock_name, slot| {
                !(lock_name.starts_with(&key_lock_prefix) && slot.holder.lock().is_none())
            });
        }
        s.longs.lock().remove(name);
        s.references.lock().remove(name);
        s.maps.lock().remove(name);
        s.multi_maps.lock().remove(name);
        s.listeners.lock().remove(name);
        *s.destroyed.lock().entry(name.to_string()).or_insert(0) += 1;

        debug!("Destroyed distributed object {}", name);
        Ok(())
    }
}

// == Lock ==
struct MemoryLock {
    name: String,
    state: Arc<State>,
}

#[async_trait]
impl DistributedLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_lock(&self, owner: &str, wait: Duration) -> ClusterResult<bool> {
        self.state.acquire(&self.name, owner, wait).await
    }

    async fn unlock(&self, owner: &str) -> ClusterResult<()> {
        self.state.release(&self.name, owner)
    }
}

// == Atomics ==
struct MemoryAtomicLong {
    name: String,
    state: Arc<State>,
}

#[async_trait]
impl AtomicLong for MemoryAtomicLong {
    async fn get(&self) -> ClusterResult<i64> {
        Ok(self.state.longs.lock().get(&self.name).copied().unwrap_or(0))
    }

    async fn set(&self, value: i64) -> ClusterResult<()> {
        self.state.longs.lock().insert(self.name.clone(), value);
        Ok(())
    }

    async fn add(&self, delta: i64) -> ClusterResult<i64> {
        let mut longs = self.state.longs.lock();
        let value = longs.entry(self.name.clone()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn compare_and_set(&self, expect: i64, update: i64) -> ClusterResult<bool> {
        let mut longs = self.state.longs.lock();
        let value = longs.entry(self.name.clone()).or_insert(0);
        if *value == expect {
            *value = update;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

struct MemoryAtomicReference {
    name: String,
    state: Arc<State>,
}

#[async_trait]
impl AtomicReference for MemoryAtomicReference {
    async fn get(&self) -> ClusterResult<Option<Value>> {
        Ok(self.state.references.lock().get(&self.name).cloned())
    }

    async fn set(&self, value: Option<Value>) -> ClusterResult<()> {
        let mut references = self.state.references.lock();
        match value {
            Some(value) => references.insert(self.name.clone(), value),
            None => references.remove(&self.name),
        };
        Ok(())
    }

    async fn compare_and_set(
        &self,
        expect: Option<Value>,
        update: Option<Value>,
    ) -> ClusterResult<bool> {
        let mut references = self.state.references.lock();
        if references.get(&self.name) != expect.as_ref() {
            return Ok(false);
        }
        match update {
            Some(value) => references.insert(self.name.clone(), value),
            None => references.remove(&self.name),
        };
        Ok(true)
    }
}

// == Map ==
struct MemoryMap {
    name: String,
    state: Arc<State>,
}

impl MemoryMap {
    fn key_lock(&self, key: &str) -> String {
        format!("{}[{}]", self.name, key)
    }
}

#[async_trait]
impl ReplicatedMap for MemoryMap {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> ClusterResult<Option<Value>> {
        Ok(self
            .state
            .maps
            .lock()
            .get(&self.name)
            .and_then(|map| map.get(key).cloned()))
    }

    async fn entries(&self) -> ClusterResult<Vec<(String, Value)>> {
        Ok(self
            .state
            .maps
            .lock()
            .get(&self.name)
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn put(&self, key: String, value: Value) -> ClusterResult<Option<Value>> {
        let old = self
            .state
            .maps
            .lock()
            .entry(self.name.clone())
            .or_default()
            .insert(key.clone(), value.clone());
        self.state.fire(
            &self.name,
            vec![EntryEvent::written(&self.name, &key, old.clone(), value)],
        );
        Ok(old)
    }

    async fn put_if_absent(&self, key: String, value: Value) -> ClusterResult<Option<Value>> {
        let existing = {
            let mut maps = self.state.maps.lock();
            let map = maps.entry(self.name.clone()).or_default();
            match map.get(&key) {
                Some(existing) => Some(existing.clone()),
                None => {
                    map.insert(key.clone(), value.clone());
                    None
                }
            }
        };
        if existing.is_none() {
            self.state.fire(
                &self.name,
                vec![EntryEvent::written(&self.name, &key, None, value)],
            );
        }
        Ok(existing)
    }

    async fn remove(&self, key: &str) -> ClusterResult<Option<Value>> {
        let old = self
            .state
            .maps
            .lock()
            .get_mut(&self.name)
            .and_then(|map| map.remove(key));
        if let Some(old) = &old {
            self.state.fire(
                &self.name,
                vec![EntryEvent::removed(&self.name, key, old.clone())],
            );
        }
        Ok(old)
    }

    async fn put_all(&self, entries: Vec<(String, Value)>) -> ClusterResult<()> {
        let events: Vec<EntryEvent> = {
            let mut maps = self.state.maps.lock();
            let map = maps.entry(self.name.clone()).or_default();
            entries
                .into_iter()
                .map(|(key, value)| {
                    let old = map.insert(key.clone(), value.clone());
                    EntryEvent::written(&self.name, &key, old, value)
                })
                .collect()
        };
        self.state.fire(&self.name, events);
        Ok(())
    }

    async fn clear(&self) -> ClusterResult<()> {
        let removed: Vec<(String, Value)> = self
            .state
            .maps
            .lock()
            .get_mut(&self.name)
            .map(|map| map.drain().collect())
            .unwrap_or_default();
        let events = removed
            .into_iter()
            .map(|(key, old)| EntryEvent::removed(&self.name, &key, old))
            .collect();
        self.state.fire(&self.name, events);
        Ok(())
    }

    async fn lock_key(&self, key: &str, owner: &str, wait: Duration) -> ClusterResult<bool> {
        self.state.acquire(&self.key_lock(key), owner, wait).await
    }

    async fn unlock_key(&self, key: &str, owner: &str) -> ClusterResult<()> {
        self.state.release(&self.key_lock(key), owner)
    }

    fn subscribe(&self, listener: Arc<dyn EntryListener>) -> Subscription {
        self.state.subscribe(&self.name, listener)
    }
}

// == Multi-Map ==
struct MemoryMultiMap {
    name: String,
    state: Arc<State>,
}

/// Event carrying the whole value collection of a key before and after a change.
fn collection_event(map: &str, key: &str, old: Vec<Value>, new: Vec<Value>) -> EntryEvent {
    let kind = match (old.is_empty(), new.is_empty()) {
        (true, _) => EntryEventKind::Added,
        (false, true) => EntryEventKind::Removed,
        (false, false) => EntryEventKind::Updated,
    };
    EntryEvent {
        map: map.to_string(),
        key: key.to_string(),
        kind,
        old_value: (!old.is_empty()).then(|| Value::Array(old)),
        new_value: (!new.is_empty()).then(|| Value::Array(new)),
    }
}

#[async_trait]
impl ReplicatedMultiMap for MemoryMultiMap {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> ClusterResult<Vec<Value>> {
        Ok(self
            .state
            .multi_maps
            .lock()
            .get(&self.name)
            .and_then(|map| map.get(key).cloned())
            .unwrap_or_default())
    }

    async fn entries(&self) -> ClusterResult<Vec<(String, Vec<Value>)>> {
        Ok(self
            .state
            .multi_maps
            .lock()
            .get(&self.name)
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn put(&self, key: String, value: Value) -> ClusterResult<bool> {
        let change = {
            let mut maps = self.state.multi_maps.lock();
            let values = maps
                .entry(self.name.clone())
                .or_default()
                .entry(key.clone())
                .or_default();
            if values.contains(&value) {
                None
            } else {
                let old = values.clone();
                values.push(value);
                Some((old, values.clone()))
            }
        };
        match change {
            Some((old, new)) => {
                self.state
                    .fire(&self.name, vec![collection_event(&self.name, &key, old, new)]);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, key: &str, value: &Value) -> ClusterResult<bool> {
        let change = {
            let mut maps = self.state.multi_maps.lock();
            let Some(map) = maps.get_mut(&self.name) else {
                return Ok(false);
            };
            let Some(values) = map.get_mut(key) else {
                return Ok(false);
            };
            let Some(position) = values.iter().position(|v| v == value) else {
                return Ok(false);
            };
            let old = values.clone();
            values.remove(position);
            let new = values.clone();
            if new.is_empty() {
                map.remove(key);
            }
            (old, new)
        };
        let (old, new) = change;
        self.state
            .fire(&self.name, vec![collection_event(&self.name, key, old, new)]);
        Ok(true)
    }

    async fn remove_all(&self, key: &str) -> ClusterResult<Vec<Value>> {
        let old = self
            .state
            .multi_maps
            .lock()
            .get_mut(&self.name)
            .and_then(|map| map.remove(key))
            .unwrap_or_default();
        if !old.is_empty() {
            self.state.fire(
                &self.name,
                vec![collection_event(&self.name, key, old.clone(), Vec::new())],
            );
        }
        Ok(old)
    }

    async fn clear(&self) -> ClusterResult<()> {
        let removed: Vec<(String, Vec<Value>)> = self
            .state
            .multi_maps
            .lock()
            .get_mut(&self.name)
            .map(|map| map.drain().collect())
            .unwrap_or_default();
        let events = removed
            .into_iter()
            .map(|(key, old)| collection_event(&self.name, &key, old, Vec::new()))
            .collect();
        self.state.fire(&self.name, events);
        Ok(())
    }

    fn subscribe(&self, listener: Arc<dyn EntryListener>) -> Subscription {
        self.state.subscribe(&self.name, listener)
    }
}
