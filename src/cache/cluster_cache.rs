//! Cluster Cache Module
//!
//! Orchestrates the mirrored buckets of one logical cache: debounced loads and
//! saves, the shared task slot, reference counting across attached instances,
//! and teardown of the shared resources.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{current_timestamp_ms, BucketData, CacheBackend, CacheTask, Changes, TaskKind};
use crate::cluster::{AtomicLong, AtomicReference, Cluster, DistributedLock};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::mirror::LocalMap;
use crate::tasks::{spawn_flush_task, spawn_worker};

// == Distributed Object Names ==
// Every name is prefixed with `CacheConfig::prefix`.
const LOCK: &str = "lock";
const TASK_LOCK: &str = "taskLock";
const TIMESTAMP: &str = "timestamp";
const LAST_LOAD: &str = "lastLoad";
const LOADING: &str = "loading";
const SAVING: &str = "saving";
const REFS: &str = "refs";
const TASK: &str = "task";
const BUCKET: &str = "bucket.";

/// Outcome of one worker iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerStep {
    /// No task outstanding
    Idle,
    /// A task is outstanding but not due yet
    Wait(Duration),
    /// A task was taken and executed
    Ran,
    /// The cache is closed
    Stop,
}

// == Cluster Cache ==
/// One attached instance of a cluster-wide logical cache.
///
/// All instances attached with the same prefix share buckets, timestamps,
/// counters and the outstanding task through the cluster. Each instance reads
/// its own local mirrors and runs one background worker.
pub struct ClusterCache<B: CacheBackend> {
    config: CacheConfig,
    instance_id: String,
    cluster: Arc<dyn Cluster>,
    backend: B,
    buckets: HashMap<String, LocalMap<B::Key, B::Value>>,
    lock: Arc<dyn DistributedLock>,
    task_lock: Arc<dyn DistributedLock>,
    timestamp: Arc<dyn AtomicLong>,
    last_load: Arc<dyn AtomicLong>,
    loading: Arc<dyn AtomicLong>,
    saving: Arc<dyn AtomicLong>,
    refs: Arc<dyn AtomicLong>,
    task: Arc<dyn AtomicReference>,
    local_lock: AsyncMutex<()>,
    closed: AtomicBool,
    started: AtomicBool,
    last_init: Mutex<Option<Instant>>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: CacheBackend> ClusterCache<B> {
    // == Attach ==
    /// Attaches a new instance to the logical cache named by `config.prefix`.
    ///
    /// Increments the cluster-wide reference count and opens a mirror per
    /// bucket. Nothing is loaded until `initialize()`.
    ///
    /// Every attached instance must be `close()`d. Dropping one without closing
    /// stops its background tasks but keeps its reference counted, so the
    /// shared resources of the cache are never torn down.
    pub async fn attach(cluster: Arc<dyn Cluster>, backend: B, config: CacheConfig) -> Result<Arc<Self>> {
        let prefix = config.prefix.clone();
        let name = |suffix: &str| format!("{}{}", prefix, suffix);
        let instance_id = Uuid::new_v4().to_string();

        let lock = cluster.lock(&name(LOCK));
        let refs = cluster.atomic_long(&name(REFS));
        if !lock.try_lock(&instance_id, config.lock_wait).await? {
            return Err(CacheError::LockTimeout(lock.name().to_string()));
        }
        let attached = async {
            let buckets = Self::open_buckets(cluster.as_ref(), &prefix, &backend).await?;
            let count = refs.increment().await?;
            Ok::<_, CacheError>((buckets, count))
        }
        .await;
        if let Err(e) = lock.unlock(&instance_id).await {
            warn!("Failed to release {}: {}", lock.name(), e);
        }
        let (buckets, count) = attached?;

        info!(
            "Attached instance {} to cache {} ({} attached)",
            instance_id, prefix, count
        );
        Ok(Arc::new(Self {
            task_lock: cluster.lock(&name(TASK_LOCK)),
            timestamp: cluster.atomic_long(&name(TIMESTAMP)),
            last_load: cluster.atomic_long(&name(LAST_LOAD)),
            loading: cluster.atomic_long(&name(LOADING)),
            saving: cluster.atomic_long(&name(SAVING)),
            task: cluster.atomic_reference(&name(TASK)),
            lock,
            refs,
            buckets,
            instance_id,
            cluster,
            backend,
            config,
            local_lock: AsyncMutex::new(()),
            closed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            last_init: Mutex::new(None),
            wake: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }))
    }

    async fn open_buckets(
        cluster: &dyn Cluster,
        prefix: &str,
        backend: &B,
    ) -> Result<HashMap<String, LocalMap<B::Key, B::Value>>> {
        let mut buckets = HashMap::new();
        for bucket in backend.buckets() {
            let map_name = format!("{}{}{}", prefix, BUCKET, bucket);
            buckets.insert(bucket, LocalMap::open(cluster, &map_name).await?);
        }
        Ok(buckets)
    }

    // == Initialize ==
    /// Performs the first load if the cache was never loaded, then starts the
    /// background worker and the periodic flush.
    ///
    /// Calls closer together than `init_throttle` return immediately. A
    /// foreground load error is returned to the caller, and the next call is
    /// not throttled.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.ensure_open()?;
        {
            let mut last_init = self.last_init.lock();
            if let Some(at) = *last_init {
                if at.elapsed() < self.config.init_throttle {
                    debug!("Initialize of {} throttled", self.config.prefix);
                    return Ok(());
                }
            }
            *last_init = Some(Instant::now());
        }

        let result = self.initialize_pass().await;
        if result.is_err() {
            *self.last_init.lock() = None;
        }
        result
    }

    async fn initialize_pass(self: &Arc<Self>) -> Result<()> {
        if self.timestamp.get().await? == 0 {
            if self.config.background_init {
                info!("Scheduling initial load of {}", self.config.prefix);
                self.schedule(TaskKind::Load, None, None).await?;
            } else {
                self.load_foreground().await?;
            }
        }
        self.start_tasks();
        Ok(())
    }

    async fn load_foreground(&self) -> Result<()> {
        let _local = self.local_lock.lock().await;
        self.ensure_open()?;
        self.lock_cluster().await?;
        let result = match self.timestamp.get().await {
            Ok(0) => self.load_locked(None).await,
            Ok(_) => Ok(()),
            Err(e) => Err(e.into()),
        };
        self.unlock_cluster().await;
        result
    }

    fn start_tasks(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut handles = self.handles.lock();
        handles.push(spawn_worker(
            Arc::downgrade(self),
            self.wake.clone(),
            self.shutdown.clone(),
            self.config.poll_interval,
            self.config.retry_backoff,
        ));
        if let Some(interval) = self.config.flush_interval {
            handles.push(spawn_flush_task(
                Arc::downgrade(self),
                interval,
                self.shutdown.clone(),
            ));
        }
    }

    // == Load / Notify ==
    /// Requests a reload from the backing resource.
    pub async fn load(&self) -> Result<()> {
        let payload = encode_payload(self.backend.get_load_data(None))?;
        self.schedule(TaskKind::Load, payload, None).await?;
        Ok(())
    }

    /// Requests a reload carrying a description of what changed.
    pub async fn notify(&self, event: B::Event) -> Result<()> {
        let payload = encode_payload(self.backend.get_load_data(Some(event)))?;
        self.schedule(TaskKind::Load, payload, None).await?;
        Ok(())
    }

    /// Like `notify`, but does nothing unless `event_timestamp` (Unix millis)
    /// is newer than the current generation. Returns whether a load was scheduled.
    pub async fn notify_at(&self, event: B::Event, event_timestamp: i64) -> Result<bool> {
        if event_timestamp <= self.timestamp.get().await? {
            debug!(
                "Ignoring event at {} for {}: not newer than current generation",
                event_timestamp, self.config.prefix
            );
            return Ok(false);
        }
        let payload = encode_payload(self.backend.get_load_data(Some(event)))?;
        self.schedule(TaskKind::Load, payload, Some(event_timestamp))
            .await
    }

    async fn schedule(
        &self,
        kind: TaskKind,
        payload: Option<Value>,
        newer_than: Option<i64>,
    ) -> Result<bool> {
        self.ensure_open()?;
        let _local = self.local_lock.lock().await;
        self.ensure_open()?;
        self.lock_cluster().await?;
        let result = self.schedule_locked(kind, payload, newer_than).await;
        self.unlock_cluster().await;

        if matches!(result, Ok(true)) {
            self.wake.notify_one();
        }
        result
    }

    async fn schedule_locked(
        &self,
        kind: TaskKind,
        payload: Option<Value>,
        newer_than: Option<i64>,
    ) -> Result<bool> {
        let generation = self.timestamp.get().await?;
        if let Some(event_timestamp) = newer_than {
            if event_timestamp <= generation {
                debug!(
                    "Ignoring event at {} for {}: generation moved to {}",
                    event_timestamp, self.config.prefix, generation
                );
                return Ok(false);
            }
        }

        let delay = self.config.delay_for(kind);
        let task = match self.read_task().await? {
            Some(mut pending) if pending.kind == kind => {
                let merged = self.reduce(kind, pending.payload.take(), payload)?;
                pending.defer(delay, merged, generation);
                debug!(
                    "Merged {:?} request into pending task of {} ({} merged)",
                    kind, self.config.prefix, pending.merged
                );
                pending
            }
            Some(pending) => {
                debug!(
                    "Flushing pending {:?} of {} before scheduling {:?}",
                    pending.kind, self.config.prefix, kind
                );
                self.write_task(None).await?;
                if let Err(e) = self.run_task(&pending).await {
                    error!(
                        "Flushed {:?} of {} failed: {}",
                        pending.kind, self.config.prefix, e
                    );
                }
                CacheTask::new(kind, payload, delay, self.timestamp.get().await?)
            }
            None => {
                debug!("Scheduled {:?} of {} in {:?}", kind, self.config.prefix, delay);
                CacheTask::new(kind, payload, delay, generation)
            }
        };
        self.write_task(Some(&task)).await?;
        Ok(true)
    }

    fn reduce(
        &self,
        kind: TaskKind,
        previous: Option<Value>,
        current: Option<Value>,
    ) -> Result<Option<Value>> {
        match kind {
            TaskKind::Load => encode_payload(self.backend.reduce_load_data(
                decode_payload(previous)?,
                decode_payload(current)?,
            )),
            TaskKind::Save => encode_payload(self.backend.reduce_save_data(
                decode_payload(previous)?,
                decode_payload(current)?,
            )),
        }
    }

    // == Modify ==
    /// Applies `changes` to the buckets right away and schedules a save.
    ///
    /// A pending load is run first so the closure reads fresh data. The
    /// closure's staged writes are visible to `get` as soon as this returns.
    pub async fn modify<F, R>(&self, changes: F) -> Result<R>
    where
        F: FnOnce(&mut Changes<'_, B::Key, B::Value>) -> R + Send,
        R: Send,
    {
        self.ensure_open()?;
        let _local = self.local_lock.lock().await;
        self.ensure_open()?;
        self.lock_cluster().await?;
        let result = self.modify_locked(changes).await;
        self.unlock_cluster().await;

        if result.is_ok() {
            self.wake.notify_one();
        }
        result
    }

    async fn modify_locked<F, R>(&self, changes: F) -> Result<R>
    where
        F: FnOnce(&mut Changes<'_, B::Key, B::Value>) -> R + Send,
        R: Send,
    {
        if let Some(pending) = self.read_task().await? {
            if pending.kind == TaskKind::Load {
                debug!("Flushing pending load of {} before modify", self.config.prefix);
                self.write_task(None).await?;
                if let Err(e) = self.run_task(&pending).await {
                    error!("Flushed load of {} failed: {}", self.config.prefix, e);
                }
            }
        }

        let mut staged = Changes::new(&self.buckets);
        let output = changes(&mut staged);
        let count = staged.apply().await?;

        let payload = encode_payload(self.backend.get_save_data(&self.snapshot()))?;
        self.schedule_locked(TaskKind::Save, payload, None).await?;
        debug!("Applied {} changes to {}", count, self.config.prefix);
        Ok(output)
    }

    // == Bucket Access ==
    pub fn get(&self, bucket: &str, key: &B::Key) -> Option<B::Value> {
        self.buckets.get(bucket)?.get(key)
    }

    pub fn contains_key(&self, bucket: &str, key: &B::Key) -> bool {
        self.buckets
            .get(bucket)
            .map(|map| map.contains_key(key))
            .unwrap_or(false)
    }

    /// Writes straight through the mirror without scheduling a save.
    pub async fn put(&self, bucket: &str, key: B::Key, value: B::Value) -> Result<Option<B::Value>> {
        self.ensure_open()?;
        self.bucket_or_err(bucket)?.put(key, value).await
    }

    pub async fn remove(&self, bucket: &str, key: &B::Key) -> Result<Option<B::Value>> {
        self.ensure_open()?;
        self.bucket_or_err(bucket)?.remove(key).await
    }

    pub fn bucket(&self, name: &str) -> Option<&LocalMap<B::Key, B::Value>> {
        self.buckets.get(name)
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.keys().cloned().collect()
    }

    fn bucket_or_err(&self, name: &str) -> Result<&LocalMap<B::Key, B::Value>> {
        self.buckets
            .get(name)
            .ok_or_else(|| CacheError::UnknownBucket(name.to_string()))
    }

    /// Copy of every bucket's content.
    pub fn snapshot(&self) -> BucketData<B::Key, B::Value> {
        self.buckets
            .iter()
            .map(|(name, map)| (name.clone(), map.snapshot()))
            .collect()
    }

    // == Reset ==
    /// Empties every bucket and marks the cache as never loaded.
    pub async fn reset(&self) -> Result<()> {
        self.ensure_open()?;
        let _local = self.local_lock.lock().await;
        self.ensure_open()?;
        self.lock_cluster().await?;
        let result = self.reset_locked().await;
        self.unlock_cluster().await;
        result
    }

    async fn reset_locked(&self) -> Result<()> {
        for map in self.buckets.values() {
            map.clear().await?;
        }
        self.timestamp.set(0).await?;
        // Loads queued from here on compare against a fresh history.
        self.last_load.set(0).await?;
        info!("Reset cache {}", self.config.prefix);
        Ok(())
    }

    // == Task Execution ==
    async fn read_task(&self) -> Result<Option<CacheTask>> {
        match self.task.get().await? {
            Some(raw) => Ok(Some(CacheTask::from_value(raw)?)),
            None => Ok(None),
        }
    }

    async fn write_task(&self, task: Option<&CacheTask>) -> Result<()> {
        let raw = task.map(CacheTask::to_value).transpose()?;
        self.task.set(raw).await?;
        Ok(())
    }

    /// Runs a task that was already removed from the slot. Cache lock held.
    async fn run_task(&self, task: &CacheTask) -> Result<()> {
        let generation = self.timestamp.get().await?;
        let last_load = self.last_load.get().await?;
        if task.is_stale(generation, last_load) {
            match task.kind {
                TaskKind::Load => debug!(
                    "Skipping load of {}: reloaded after it was requested",
                    self.config.prefix
                ),
                TaskKind::Save => warn!(
                    "Dropping save of {}: cache was reset after it was requested",
                    self.config.prefix
                ),
            }
            return Ok(());
        }

        match task.kind {
            TaskKind::Load => self.load_locked(decode_payload(task.payload.clone())?).await,
            TaskKind::Save => self.save_locked(decode_payload(task.payload.clone())?).await,
        }
    }

    async fn load_locked(&self, data: Option<B::LoadData>) -> Result<()> {
        let initializing = self.timestamp.get().await? == 0;
        self.loading.increment().await?;
        let result = self.fetch_and_apply(initializing, data).await;
        if let Err(e) = self.loading.decrement().await {
            warn!("Failed to update loading counter of {}: {}", self.config.prefix, e);
        }
        result
    }

    async fn fetch_and_apply(&self, initializing: bool, data: Option<B::LoadData>) -> Result<()> {
        let started = Instant::now();
        let mut loaded = self.backend.do_load(initializing, data).await?;

        for (name, map) in &self.buckets {
            map.replace_all(loaded.remove(name).unwrap_or_default())
                .await?;
        }
        if !loaded.is_empty() {
            warn!(
                "Load of {} returned undeclared buckets {:?}",
                self.config.prefix,
                loaded.keys().collect::<Vec<_>>()
            );
        }

        let generation = self.advance_generation().await?;
        self.last_load.set(generation).await?;
        info!(
            "Loaded {} in {:?} (generation {})",
            self.config.prefix,
            started.elapsed(),
            generation
        );
        Ok(())
    }

    async fn save_locked(&self, data: Option<B::SaveData>) -> Result<()> {
        self.saving.increment().await?;
        match self.backend.do_save(data, &self.snapshot()).await {
            Ok(()) => debug!("Saved {}", self.config.prefix),
            Err(e) => error!("Save of {} failed: {:#}", self.config.prefix, e),
        }
        let result = self.advance_generation().await.map(|_| ());
        if let Err(e) = self.saving.decrement().await {
            warn!("Failed to update saving counter of {}: {}", self.config.prefix, e);
        }
        result
    }

    /// Moves the generation to now, strictly forward. Cache lock held.
    async fn advance_generation(&self) -> Result<i64> {
        let current = self.timestamp.get().await?;
        let next = current_timestamp_ms().max(current + 1);
        self.timestamp.set(next).await?;
        Ok(next)
    }

    // == Worker ==
    /// One worker iteration: take the task lock, then run the outstanding task if due.
    pub(crate) async fn worker_step(&self) -> Result<WorkerStep> {
        if self.is_closed() {
            return Ok(WorkerStep::Stop);
        }
        if !self.task_lock.try_lock(&self.instance_id, Duration::ZERO).await? {
            // Another instance is draining.
            return Ok(WorkerStep::Idle);
        }
        let step = self.drain_task().await;
        if let Err(e) = self.task_lock.unlock(&self.instance_id).await {
            warn!("Failed to release {}: {}", self.task_lock.name(), e);
        }
        step
    }

    async fn drain_task(&self) -> Result<WorkerStep> {
        let Some(task) = self.read_task().await? else {
            return Ok(WorkerStep::Idle);
        };
        if !task.is_due() {
            return Ok(WorkerStep::Wait(task.remaining()));
        }

        let _local = self.local_lock.lock().await;
        if self.is_closed() {
            return Ok(WorkerStep::Stop);
        }
        self.lock_cluster().await?;
        let step = self.take_due_task().await;
        self.unlock_cluster().await;
        step
    }

    async fn take_due_task(&self) -> Result<WorkerStep> {
        // The task may have been flushed or deferred while we waited for the lock.
        let Some(raw) = self.task.get().await? else {
            return Ok(WorkerStep::Idle);
        };
        let task = CacheTask::from_value(raw.clone())?;
        if !task.is_due() {
            return Ok(WorkerStep::Wait(task.remaining()));
        }
        if !self.task.compare_and_set(Some(raw), None).await? {
            return Ok(WorkerStep::Wait(Duration::ZERO));
        }

        debug!(
            "Running {:?} of {} ({} merged requests)",
            task.kind, self.config.prefix, task.merged
        );
        if let Err(e) = self.run_task(&task).await {
            error!("{:?} of {} failed: {}", task.kind, self.config.prefix, e);
        }
        Ok(WorkerStep::Ran)
    }

    // == Close ==
    /// Detaches this instance. The last instance to detach flushes the pending
    /// task and destroys every shared resource of the cache.
    ///
    /// Idempotent; safe to call concurrently from several instances.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Instance {} of {} already closed", self.instance_id, self.config.prefix);
            return Ok(());
        }
        self.shutdown.cancel();

        let detached = {
            let _local = self.local_lock.lock().await;
            let locked = match self
                .lock
                .try_lock(&self.instance_id, self.config.lock_wait)
                .await
            {
                Ok(locked) => locked,
                Err(e) => {
                    warn!("Could not lock {} for close: {}", self.config.prefix, e);
                    false
                }
            };
            if !locked {
                warn!(
                    "Closing {} without the cache lock, shared resources stay in place",
                    self.config.prefix
                );
            }
            let detached = self.detach_locked(locked).await;
            for map in self.buckets.values() {
                map.close();
            }
            if locked {
                self.unlock_cluster().await;
            }
            detached
        };

        self.join_tasks().await;
        if let Ok(true) = detached {
            self.destroy_with_retry(self.task_lock.name()).await;
            self.destroy_with_retry(self.lock.name()).await;
            info!("Destroyed shared resources of {}", self.config.prefix);
        }
        detached.map(|_| ())
    }

    /// Drops the reference; returns true when this instance must finish the teardown.
    async fn detach_locked(&self, locked: bool) -> Result<bool> {
        let remaining = self.refs.decrement().await?;
        info!(
            "Detached instance {} from {} ({} still attached)",
            self.instance_id, self.config.prefix, remaining
        );
        if remaining > 0 || !locked {
            return Ok(false);
        }

        if let Some(pending) = self.read_task().await? {
            info!(
                "Flushing pending {:?} of {} before teardown",
                pending.kind, self.config.prefix
            );
            self.write_task(None).await?;
            if let Err(e) = self.run_task(&pending).await {
                error!("Final {:?} of {} failed: {}", pending.kind, self.config.prefix, e);
            }
        }

        let prefix = &self.config.prefix;
        let mut names: Vec<String> = self
            .buckets
            .values()
            .map(|map| map.name().to_string())
            .collect();
        names.extend(
            [TIMESTAMP, LAST_LOAD, LOADING, SAVING, REFS, TASK]
                .iter()
                .map(|suffix| format!("{}{}", prefix, suffix)),
        );
        for name in &names {
            if let Err(e) = self.cluster.destroy(name).await {
                warn!("Failed to destroy {}: {}", name, e);
            }
        }
        Ok(true)
    }

    async fn join_tasks(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task of {} ended abnormally: {}", self.config.prefix, e);
            }
        }
    }

    async fn destroy_with_retry(&self, name: &str) {
        let mut backoff = self.config.teardown_backoff;
        for attempt in 1..=self.config.teardown_attempts {
            match self.cluster.destroy(name).await {
                Ok(()) => return,
                Err(e) if attempt < self.config.teardown_attempts => {
                    debug!("Destroy of {} failed (attempt {}): {}", name, attempt, e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => error!(
                    "Giving up destroying {} after {} attempts: {}",
                    name, attempt, e
                ),
            }
        }
    }

    // == Locking ==
    async fn lock_cluster(&self) -> Result<()> {
        if self
            .lock
            .try_lock(&self.instance_id, self.config.lock_wait)
            .await?
        {
            Ok(())
        } else {
            Err(CacheError::LockTimeout(self.lock.name().to_string()))
        }
    }

    async fn unlock_cluster(&self) {
        if let Err(e) = self.lock.unlock(&self.instance_id).await {
            warn!("Failed to release {}: {}", self.lock.name(), e);
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(CacheError::Closed(self.config.prefix.clone()))
        } else {
            Ok(())
        }
    }

    // == Observers ==
    pub async fn is_initialized(&self) -> Result<bool> {
        Ok(self.timestamp.get().await? > 0)
    }

    pub async fn is_loading(&self) -> Result<bool> {
        Ok(self.loading.get().await? > 0)
    }

    pub async fn is_saving(&self) -> Result<bool> {
        Ok(self.saving.get().await? > 0)
    }

    /// Current generation timestamp, 0 when never loaded.
    pub async fn generation(&self) -> Result<i64> {
        Ok(self.timestamp.get().await?)
    }

    pub async fn last_loaded(&self) -> Result<Option<DateTime<Utc>>> {
        let millis = self.last_load.get().await?;
        Ok(if millis > 0 {
            DateTime::from_timestamp_millis(millis)
        } else {
            None
        })
    }

    /// Time since the last completed load, None when never loaded.
    pub async fn age(&self) -> Result<Option<Duration>> {
        let millis = self.last_load.get().await?;
        if millis <= 0 {
            return Ok(None);
        }
        let elapsed = (current_timestamp_ms() - millis).max(0);
        Ok(Some(Duration::from_millis(elapsed as u64)))
    }

    /// True while this instance is open and the cache is attached cluster-wide.
    pub async fn is_active(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.refs.get().await {
            Ok(count) => count > 0,
            Err(e) => {
                debug!("Cache {} not active: {}", self.config.prefix, e);
                false
            }
        }
    }

    /// The outstanding task, if any.
    pub async fn pending_task(&self) -> Result<Option<CacheTask>> {
        self.read_task().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: CacheBackend> Drop for ClusterCache<B> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            warn!(
                "Instance {} of {} dropped without close, its reference stays counted",
                self.instance_id, self.config.prefix
            );
            self.shutdown.cancel();
        }
    }
}

fn encode_payload<T: Serialize>(data: Option<T>) -> Result<Option<Value>> {
    Ok(data.map(serde_json::to_value).transpose()?)
}

fn decode_payload<T: DeserializeOwned>(raw: Option<Value>) -> Result<Option<T>> {
    Ok(raw.map(serde_json::from_value).transpose()?)
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::InMemoryCluster;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const COUNTERS: &str = "counters";

    #[derive(Default)]
    struct CounterBackend {
        loads: AtomicUsize,
        saves: Mutex<Vec<Option<u32>>>,
        fail_loads: AtomicBool,
        stored: Mutex<HashMap<String, i64>>,
    }

    #[async_trait]
    impl CacheBackend for CounterBackend {
        type Key = String;
        type Value = i64;
        type Event = String;
        type LoadData = String;
        type SaveData = u32;

        fn buckets(&self) -> Vec<String> {
            vec![COUNTERS.to_string()]
        }

        async fn do_load(
            &self,
            _initializing: bool,
            _data: Option<String>,
        ) -> anyhow::Result<BucketData<String, i64>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail_loads.load(Ordering::SeqCst) {
                anyhow::bail!("backing store offline");
            }
            Ok(HashMap::from([(COUNTERS.to_string(), self.stored.lock().clone())]))
        }

        async fn do_save(
            &self,
            data: Option<u32>,
            snapshot: &BucketData<String, i64>,
        ) -> anyhow::Result<()> {
            self.saves.lock().push(data);
            *self.stored.lock() = snapshot.get(COUNTERS).cloned().unwrap_or_default();
            Ok(())
        }

        fn get_save_data(&self, _snapshot: &BucketData<String, i64>) -> Option<u32> {
            Some(1)
        }

        fn reduce_save_data(&self, previous: Option<u32>, current: Option<u32>) -> Option<u32> {
            Some(previous.unwrap_or(0) + current.unwrap_or(0))
        }
    }

    fn config() -> CacheConfig {
        CacheConfig {
            load_delay: Duration::from_millis(50),
            save_delay: Duration::from_millis(50),
            init_throttle: Duration::from_millis(100),
            poll_interval: Duration::from_millis(20),
            retry_backoff: Duration::from_millis(20),
            lock_wait: Duration::from_secs(2),
            teardown_backoff: Duration::from_millis(5),
            ..CacheConfig::new("unit.")
        }
    }

    async fn attach(cluster: &InMemoryCluster, backend: CounterBackend) -> Arc<ClusterCache<CounterBackend>> {
        ClusterCache::attach(Arc::new(cluster.clone()), backend, config())
            .await
            .unwrap()
    }

    fn key(name: &str) -> String {
        name.to_string()
    }

    #[tokio::test]
    async fn test_foreground_initialize_loads_once() {
        let cluster = InMemoryCluster::new();
        let backend = CounterBackend::default();
        backend.stored.lock().insert(key("a"), 1);
        let cache = attach(&cluster, backend).await;

        assert!(!cache.is_initialized().await.unwrap());
        cache.initialize().await.unwrap();
        cache.initialize().await.unwrap();

        assert!(cache.is_initialized().await.unwrap());
        assert_eq!(cache.backend().loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(COUNTERS, &key("a")), Some(1));
        assert!(cache.last_loaded().await.unwrap().is_some());
        assert!(cache.age().await.unwrap().is_some());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_is_throttled() {
        let cluster = InMemoryCluster::new();
        let cache = attach(&cluster, CounterBackend::default()).await;

        cache.initialize().await.unwrap();
        cache.reset().await.unwrap();
        cache.initialize().await.unwrap();
        assert_eq!(cache.backend().loads.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        cache.initialize().await.unwrap();
        assert_eq!(cache.backend().loads.load(Ordering::SeqCst), 2);
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreground_load_error_propagates() {
        let cluster = InMemoryCluster::new();
        let backend = CounterBackend::default();
        backend.fail_loads.store(true, Ordering::SeqCst);
        let cache = attach(&cluster, backend).await;

        let result = cache.initialize().await;
        assert!(matches!(result, Err(CacheError::Backend(_))));
        assert!(!cache.is_initialized().await.unwrap());
        assert!(!cache.is_loading().await.unwrap());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_initialize_is_not_throttled() {
        let cluster = InMemoryCluster::new();
        let backend = CounterBackend::default();
        backend.fail_loads.store(true, Ordering::SeqCst);
        backend.stored.lock().insert(key("a"), 1);
        let cache = attach(&cluster, backend).await;

        assert!(cache.initialize().await.is_err());
        cache.backend().fail_loads.store(false, Ordering::SeqCst);
        cache.initialize().await.unwrap();

        assert_eq!(cache.backend().loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get(COUNTERS, &key("a")), Some(1));
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_survives_failed_load() {
        let cluster = InMemoryCluster::new();
        let backend = CounterBackend::default();
        backend.fail_loads.store(true, Ordering::SeqCst);
        let cache = ClusterCache::attach(
            Arc::new(cluster.clone()),
            backend,
            CacheConfig {
                background_init: true,
                ..config()
            },
        )
        .await
        .unwrap();

        cache.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.backend().loads.load(Ordering::SeqCst), 1);
        assert!(!cache.is_initialized().await.unwrap());

        cache.backend().fail_loads.store(false, Ordering::SeqCst);
        cache.load().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.backend().loads.load(Ordering::SeqCst), 2);
        assert!(cache.is_initialized().await.unwrap());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_flushes_pending_save() {
        let cluster = InMemoryCluster::new();
        let cache = attach(&cluster, CounterBackend::default()).await;
        cache.initialize().await.unwrap();

        cache
            .modify(|changes| changes.put(COUNTERS, key("a"), 5))
            .await
            .unwrap();
        assert_eq!(
            cache.pending_task().await.unwrap().map(|t| t.kind),
            Some(TaskKind::Save)
        );

        cache.load().await.unwrap();
        assert_eq!(cache.backend().saves.lock().len(), 1);
        assert_eq!(
            cache.pending_task().await.unwrap().map(|t| t.kind),
            Some(TaskKind::Load)
        );
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_drops_pending_save() {
        let cluster = InMemoryCluster::new();
        let cache = attach(&cluster, CounterBackend::default()).await;
        cache.initialize().await.unwrap();

        cache
            .modify(|changes| changes.put(COUNTERS, key("a"), 5))
            .await
            .unwrap();
        cache.reset().await.unwrap();

        assert_eq!(cache.generation().await.unwrap(), 0);
        assert!(cache.get(COUNTERS, &key("a")).is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.backend().saves.lock().is_empty());
        assert!(cache.pending_task().await.unwrap().is_none());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_after_reset_refetches() {
        let cluster = InMemoryCluster::new();
        let backend = CounterBackend::default();
        backend.stored.lock().insert(key("a"), 1);
        let cache = attach(&cluster, backend).await;
        cache.initialize().await.unwrap();

        cache.reset().await.unwrap();
        assert!(cache.last_loaded().await.unwrap().is_none());
        cache.load().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(cache.backend().loads.load(Ordering::SeqCst), 2);
        assert!(cache.is_initialized().await.unwrap());
        assert_eq!(cache.get(COUNTERS, &key("a")), Some(1));
        assert!(cache.pending_task().await.unwrap().is_none());
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_background_initialize_after_reset_refetches() {
        let cluster = InMemoryCluster::new();
        let backend = CounterBackend::default();
        backend.stored.lock().insert(key("a"), 1);
        let cache = ClusterCache::attach(
            Arc::new(cluster.clone()),
            backend,
            CacheConfig {
                background_init: true,
                ..config()
            },
        )
        .await
        .unwrap();

        cache.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.backend().loads.load(Ordering::SeqCst), 1);

        cache.reset().await.unwrap();
        assert!(cache.get(COUNTERS, &key("a")).is_none());
        tokio::time::sleep(Duration::from_millis(120)).await;
        cache.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(cache.backend().loads.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get(COUNTERS, &key("a")), Some(1));
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_modify_returns_closure_output() {
        let cluster = InMemoryCluster::new();
        let cache = attach(&cluster, CounterBackend::default()).await;
        cache.initialize().await.unwrap();

        let previous = cache
            .modify(|changes| {
                let previous = changes.get(COUNTERS, &key("hits")).unwrap_or(0);
                changes.put(COUNTERS, key("hits"), previous + 1);
                previous
            })
            .await
            .unwrap();
        assert_eq!(previous, 0);
        assert_eq!(cache.get(COUNTERS, &key("hits")), Some(1));
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_bucket() {
        let cluster = InMemoryCluster::new();
        let cache = attach(&cluster, CounterBackend::default()).await;

        let result = cache.put("missing", key("a"), 1).await;
        assert!(matches!(result, Err(CacheError::UnknownBucket(_))));
        assert!(cache.get("missing", &key("a")).is_none());
        assert!(!cache.contains_key("missing", &key("a")));
        cache.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let cluster = InMemoryCluster::new();
        let cache = attach(&cluster, CounterBackend::default()).await;
        assert!(cache.is_active().await);

        cache.close().await.unwrap();
        cache.close().await.unwrap();

        assert!(!cache.is_active().await);
        assert!(matches!(cache.initialize().await, Err(CacheError::Closed(_))));
        assert!(matches!(cache.load().await, Err(CacheError::Closed(_))));
        let result = cache.modify(|changes| changes.put(COUNTERS, key("a"), 1)).await;
        assert!(matches!(result, Err(CacheError::Closed(_))));
    }

    #[tokio::test]
    async fn test_periodic_flush_reloads() {
        let cluster = InMemoryCluster::new();
        let cache = ClusterCache::attach(
            Arc::new(cluster.clone()),
            CounterBackend::default(),
            CacheConfig {
                flush_interval: Some(Duration::from_millis(40)),
                load_delay: Duration::ZERO,
                ..config()
            },
        )
        .await
        .unwrap();

        cache.initialize().await.unwrap();
        cache.backend().stored.lock().insert(key("external"), 9);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(cache.backend().loads.load(Ordering::SeqCst) >= 2);
        assert_eq!(cache.get(COUNTERS, &key("external")), Some(9));
        cache.close().await.unwrap();
    }
}
