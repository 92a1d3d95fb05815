//! Periodic Flush Task
//!
//! Background task that requests a reload of the cache at a fixed interval,
//! picking up changes made to the backing resource outside the cluster.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheBackend, ClusterCache};
use crate::error::CacheError;

/// Spawns a task that calls `load()` on the cache every `interval`.
///
/// The request goes through the normal debounce, so a flush landing next to
/// other load requests merges with them.
pub(crate) fn spawn_flush_task<B: CacheBackend>(
    cache: Weak<ClusterCache<B>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting periodic flush with interval of {:?}", interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let Some(cache) = cache.upgrade() else {
                break;
            };
            match cache.load().await {
                Ok(()) => debug!("Periodic flush requested a load of {}", cache.prefix()),
                Err(CacheError::Closed(_)) => break,
                Err(e) => warn!("Periodic flush of {} failed: {}", cache.prefix(), e),
            }
        }

        debug!("Periodic flush stopped");
    })
}
