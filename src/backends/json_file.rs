//! JSON File Backend
//!
//! Stores every bucket in one JSON document of the form
//! `{ "<bucket>": { "<key>": <value>, ... }, ... }`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::{BucketData, CacheBackend};

/// File-backed settings store.
///
/// A missing file loads as empty. Saves go to a sibling temp file that is
/// then renamed over the target, so readers never see a half-written file.
/// Save payloads count the edits coalesced into one write.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
    buckets: Vec<String>,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>, buckets: &[&str]) -> Self {
        Self {
            path: path.into(),
            buckets: buckets.iter().map(|b| b.to_string()).collect(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CacheBackend for JsonFileBackend {
    type Key = String;
    type Value = Value;
    type Event = ();
    type LoadData = ();
    /// Number of edits folded into the save
    type SaveData = u64;

    fn buckets(&self) -> Vec<String> {
        self.buckets.clone()
    }

    async fn do_load(
        &self,
        initializing: bool,
        _data: Option<()>,
    ) -> anyhow::Result<BucketData<String, Value>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("{} does not exist, starting empty", self.path.display());
                return Ok(HashMap::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };

        let mut document: BucketData<String, Value> = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        document.retain(|bucket, _| self.buckets.contains(bucket));
        debug!(
            "Read {} buckets from {} (initializing: {})",
            document.len(),
            self.path.display(),
            initializing
        );
        Ok(document)
    }

    async fn do_save(
        &self,
        edits: Option<u64>,
        snapshot: &BucketData<String, Value>,
    ) -> anyhow::Result<()> {
        let encoded = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, &encoded)
            .await
            .with_context(|| format!("writing {}", temp.display()))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;

        info!(
            "Wrote {} ({} edits)",
            self.path.display(),
            edits.unwrap_or(0)
        );
        Ok(())
    }

    fn get_save_data(&self, _snapshot: &BucketData<String, Value>) -> Option<u64> {
        Some(1)
    }

    fn reduce_save_data(&self, previous: Option<u64>, current: Option<u64>) -> Option<u64> {
        match (previous, current) {
            (None, None) => None,
            (previous, current) => Some(previous.unwrap_or(0) + current.unwrap_or(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("settings.json"), &["ui"]);

        let data = backend.do_load(true, None).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("settings.json"), &["ui", "net"]);

        let snapshot = HashMap::from([
            (
                "ui".to_string(),
                HashMap::from([("theme".to_string(), json!("dark"))]),
            ),
            ("net".to_string(), HashMap::new()),
        ]);
        backend.do_save(Some(3), &snapshot).await.unwrap();

        assert!(backend.path().exists());
        assert!(!backend.temp_path().exists());
        let data = backend.do_load(false, None).await.unwrap();
        assert_eq!(data, snapshot);
    }

    #[tokio::test]
    async fn test_undeclared_buckets_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, r#"{"ui": {"zoom": 2}, "legacy": {"x": 1}}"#)
            .await
            .unwrap();

        let backend = JsonFileBackend::new(&path, &["ui"]);
        let data = backend.do_load(true, None).await.unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data["ui"]["zoom"], json!(2));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let backend = JsonFileBackend::new(&path, &["ui"]);
        let err = backend.do_load(true, None).await.unwrap_err();
        assert!(err.to_string().contains("parsing"));
    }

    #[test]
    fn test_save_data_counts_edits() {
        let backend = JsonFileBackend::new("unused.json", &["ui"]);
        let mut folded = None;
        for _ in 0..4 {
            let current = backend.get_save_data(&HashMap::new());
            folded = backend.reduce_save_data(folded, current);
        }
        assert_eq!(folded, Some(4));
        assert_eq!(backend.reduce_save_data(None, None), None);
    }
}
