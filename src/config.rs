//! Configuration Module
//!
//! Handles loading and managing cache configuration from environment variables.

use std::env;
use std::time::Duration;

use crate::cache::TaskKind;

/// Default debounce window for both loads and saves
pub const DEFAULT_DELAY_MS: u64 = 500;

/// Cache core configuration parameters.
///
/// The debounce and flush knobs can be configured via environment variables;
/// the rest are tuning values with sensible defaults.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Namespace for every distributed object owned by this logical cache
    pub prefix: String,
    /// Enqueue the first load instead of running it on the caller
    pub background_init: bool,
    /// Debounce window for load requests
    pub load_delay: Duration,
    /// Debounce window for save requests
    pub save_delay: Duration,
    /// Periodic reload interval, None = disabled
    pub flush_interval: Option<Duration>,
    /// Minimum spacing between two effective `initialize()` calls
    pub init_throttle: Duration,
    /// How often an idle worker checks the shared task slot
    pub poll_interval: Duration,
    /// Backoff after a cluster failure in the worker
    pub retry_backoff: Duration,
    /// Bounded wait when acquiring the cache lock
    pub lock_wait: Duration,
    /// Attempts made to destroy a lock during teardown
    pub teardown_attempts: u32,
    /// Base backoff between teardown attempts, doubled each retry
    pub teardown_backoff: Duration,
}

impl CacheConfig {
    /// Creates a config with default values for the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            background_init: false,
            load_delay: Duration::from_millis(DEFAULT_DELAY_MS),
            save_delay: Duration::from_millis(DEFAULT_DELAY_MS),
            flush_interval: None,
            init_throttle: Duration::from_secs(2),
            poll_interval: Duration::from_millis(500),
            retry_backoff: Duration::from_secs(1),
            lock_wait: Duration::from_secs(10),
            teardown_attempts: 5,
            teardown_backoff: Duration::from_millis(100),
        }
    }

    /// Creates a new CacheConfig by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHE_BACKGROUND_INIT` - Load in the background on initialize (default: false)
    /// - `CACHE_LOAD_DELAY_MS` - Load debounce window in milliseconds (default: 500)
    /// - `CACHE_SAVE_DELAY_MS` - Save debounce window in milliseconds (default: 500)
    /// - `CACHE_FLUSH_INTERVAL_MS` - Periodic reload interval, 0 disables (default: 0)
    pub fn from_env(prefix: impl Into<String>) -> Self {
        let defaults = Self::new(prefix);
        Self {
            background_init: env::var("CACHE_BACKGROUND_INIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.background_init),
            load_delay: env::var("CACHE_LOAD_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.load_delay),
            save_delay: env::var("CACHE_SAVE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.save_delay),
            flush_interval: env::var("CACHE_FLUSH_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            ..defaults
        }
    }

    /// Debounce window for the given task kind.
    pub fn delay_for(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::Load => self.load_delay,
            TaskKind::Save => self.save_delay,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new("cache.")
    }
}
