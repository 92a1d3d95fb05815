//! Change events and listener subscriptions for replicated maps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// == Entry Event ==
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryEventKind {
    Added,
    Updated,
    Removed,
}

/// Notification that one key of a named map changed.
///
/// Fire-and-forget: a slow or failing listener is not retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryEvent {
    /// Name of the map that changed
    pub map: String,
    /// Encoded key
    pub key: String,
    pub kind: EntryEventKind,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

impl EntryEvent {
    /// Builds the event for a write, picking Added or Updated from `old_value`.
    pub fn written(map: &str, key: &str, old_value: Option<Value>, new_value: Value) -> Self {
        let kind = if old_value.is_some() {
            EntryEventKind::Updated
        } else {
            EntryEventKind::Added
        };
        Self {
            map: map.to_string(),
            key: key.to_string(),
            kind,
            old_value,
            new_value: Some(new_value),
        }
    }

    pub fn removed(map: &str, key: &str, old_value: Value) -> Self {
        Self {
            map: map.to_string(),
            key: key.to_string(),
            kind: EntryEventKind::Removed,
            old_value: Some(old_value),
            new_value: None,
        }
    }
}

// == Entry Listener ==
/// Receives change events for the map it is subscribed to.
pub trait EntryListener: Send + Sync {
    fn on_event(&self, event: &EntryEvent);
}

// == Subscription ==
/// Handle for a registered listener. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
