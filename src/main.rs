//! Cluster Cache - demo binary
//!
//! Attaches two instances of one settings cache to a shared in-memory cluster
//! backed by a JSON file, edits through one and reads through the other.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cluster_cache::{CacheConfig, ClusterCache, InMemoryCluster, JsonFileBackend};

const BUCKETS: &[&str] = &["ui", "network"];

/// Demo entry point.
///
/// # Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Attach two instances ("processes") to one cluster
/// 4. Edit through the first, read through the second
/// 5. Close both; the last close writes the file and tears down
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" for this crate, can be overridden with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cluster_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = env::var("CACHE_FILE").unwrap_or_else(|_| "settings.json".to_string());
    let config = CacheConfig::from_env("settings.");
    info!(
        "Configuration loaded: file={}, load_delay={:?}, save_delay={:?}, background_init={}",
        path, config.load_delay, config.save_delay, config.background_init
    );

    let cluster = InMemoryCluster::new();
    let first = ClusterCache::attach(
        Arc::new(cluster.clone()),
        JsonFileBackend::new(&path, BUCKETS),
        config.clone(),
    )
    .await?;
    let second = ClusterCache::attach(
        Arc::new(cluster.clone()),
        JsonFileBackend::new(&path, BUCKETS),
        config.clone(),
    )
    .await?;

    first.initialize().await?;
    second.initialize().await?;

    let launches = first
        .modify(|changes| {
            let key = "launches".to_string();
            let launches = changes
                .get("ui", &key)
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
                + 1;
            changes.put("ui", key, json!(launches));
            changes.put("network", "timeout_ms".to_string(), json!(2500));
            launches
        })
        .await?;
    info!("Recorded launch #{} through instance {}", launches, first.instance_id());

    // Mirrors converge through map events.
    tokio::time::sleep(Duration::from_millis(50)).await;
    info!(
        "Instance {} sees ui.launches = {:?}",
        second.instance_id(),
        second.get("ui", &"launches".to_string())
    );

    first.close().await?;
    second.close().await?;
    info!("Demo complete, settings written to {}", path);
    Ok(())
}
