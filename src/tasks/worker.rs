//! Cache Worker Task
//!
//! Background task that waits for the shared cache task to become due and
//! runs it. Every attached instance runs one; the cluster task lock makes sure
//! only one of them drains the slot at a time.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheBackend, ClusterCache, WorkerStep};

/// Spawns the worker loop of one cache instance.
///
/// The loop holds only a weak reference between iterations, so dropping the
/// last handle of the cache ends it. It sleeps until the outstanding task is
/// due, until `wake` fires, or for `poll_interval` when the slot is empty.
/// Cluster failures are logged and retried after `retry_backoff`.
///
/// # Returns
/// A JoinHandle that completes once `shutdown` is cancelled.
pub(crate) fn spawn_worker<B: CacheBackend>(
    cache: Weak<ClusterCache<B>>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    poll_interval: Duration,
    retry_backoff: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting cache worker");

        while !shutdown.is_cancelled() {
            let step = match cache.upgrade() {
                Some(cache) => cache.worker_step().await,
                None => break,
            };

            let delay = match step {
                Ok(WorkerStep::Ran) => continue,
                Ok(WorkerStep::Stop) => break,
                Ok(WorkerStep::Idle) => poll_interval,
                Ok(WorkerStep::Wait(remaining)) => remaining,
                Err(e) if e.is_transient() => {
                    warn!("Cache worker retrying in {:?}: {}", retry_backoff, e);
                    retry_backoff
                }
                Err(e) => {
                    error!("Cache worker step failed: {}", e);
                    retry_backoff
                }
            };
            if delay.is_zero() {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!("Cache worker stopped");
    })
}
