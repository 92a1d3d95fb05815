//! Cache Task Module
//!
//! The single outstanding load or save of a cache, shared through the cluster.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{current_timestamp_ms, MAX_DEFER_WINDOWS};

// == Task Kind ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Load,
    Save,
}

// == Cache Task ==
/// A debounced load or save waiting for its due time.
///
/// Times are Unix milliseconds so that every process sharing the task reads
/// the same deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheTask {
    pub kind: TaskKind,
    /// Backend payload, merged across deferrals
    pub payload: Option<Value>,
    /// When the task was first requested
    pub created_at: i64,
    /// Earliest time the task may run
    pub due_at: i64,
    /// Generation timestamp observed at creation or last merge
    pub generation: i64,
    /// Number of requests merged into this task after the first
    pub merged: u32,
}

impl CacheTask {
    // == Constructor ==
    /// Creates a task due `delay` from now.
    pub fn new(kind: TaskKind, payload: Option<Value>, delay: Duration, generation: i64) -> Self {
        let now = current_timestamp_ms();
        Self {
            kind,
            payload,
            created_at: now,
            due_at: now + delay.as_millis() as i64,
            generation,
            merged: 0,
        }
    }

    // == Defer ==
    /// Folds another request into this task and pushes its due time back.
    ///
    /// The due time never moves past `MAX_DEFER_WINDOWS` windows after creation,
    /// so a steady stream of requests still gets flushed.
    pub fn defer(&mut self, delay: Duration, payload: Option<Value>, generation: i64) {
        let delay_ms = delay.as_millis() as i64;
        let latest = self.created_at + delay_ms * MAX_DEFER_WINDOWS;
        let wanted = current_timestamp_ms() + delay_ms;

        self.due_at = self.due_at.max(wanted.min(latest));
        self.payload = payload;
        self.generation = generation;
        self.merged += 1;
    }

    // == Remaining ==
    /// Time left before the task may run, zero once due.
    pub fn remaining(&self) -> Duration {
        let left = self.due_at - current_timestamp_ms();
        if left > 0 {
            Duration::from_millis(left as u64)
        } else {
            Duration::ZERO
        }
    }

    pub fn is_due(&self) -> bool {
        self.remaining().is_zero()
    }

    // == Staleness ==
    /// A load is stale once another load finished after the last request merged
    /// into it. A save is stale once the cache was reset after it was requested.
    pub fn is_stale(&self, generation: i64, last_load: i64) -> bool {
        match self.kind {
            TaskKind::Load => last_load > self.generation,
            TaskKind::Save => self.generation > generation,
        }
    }

    // == Encoding ==
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}
