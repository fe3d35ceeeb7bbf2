#![allow(dead_code)]
//! Versioned key/value persistence backed by a single JSON document.
//!
//! One writer at a time: all mutation happens under the store lock and is
//! flushed copy-on-write (temp file + rename), so a write for one key can
//! never drop another key's value. Unknown keys round-trip untouched.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, warn};

pub const SCHEMA_VERSION: u32 = 1;

/// Well-known keys. Components own their keys; the store stays passive.
pub mod keys {
    pub const CACHED_EXPORT_RULE: &str = "cached_export_rule";
    pub const BATTERY_HEALTH: &str = "battery_health";
    pub const FORCE_MODE_STATE: &str = "force_mode_state";
    pub const MANUAL_EXPORT_OVERRIDE: &str = "manual_export_override";
    pub const INVERTER_LAST_STATE: &str = "inverter_last_state";
    pub const INVERTER_POWER_LIMIT_W: &str = "inverter_power_limit_w";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("State serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("State write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    version: u32,
    #[serde(flatten)]
    entries: serde_json::Map<String, Value>,
}

impl Default for Document {
    fn default() -> Self {
        Self { version: SCHEMA_VERSION, entries: serde_json::Map::new() }
    }
}

pub struct StateStore {
    path: PathBuf,
    doc: Mutex<Document>,
}

impl StateStore {
    /// Open (or create) the store. A document that fails to parse resets
    /// the store to empty; the system boots clean rather than refusing to
    /// start.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<Document>(&raw) {
                Ok(doc) => doc,
                Err(e) => {
                    error!(error = %e, path = %path.display(),
                        "persisted state is corrupt - resetting to empty");
                    Document::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::default(),
            Err(e) => {
                warn!(error = %e, path = %path.display(),
                    "could not read persisted state - starting empty");
                Document::default()
            }
        };
        Self { path, doc: Mutex::new(doc) }
    }

    /// Read a key, deserialized into the caller's type. Returns `None`
    /// when the key is absent or no longer parses as `T`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let doc = self.doc.lock().await;
        let value = doc.entries.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(error = %e, key, "stored value does not parse - ignoring");
                None
            }
        }
    }

    /// Write a key and flush the whole document atomically.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let mut doc = self.doc.lock().await;
        doc.entries.insert(key.to_string(), serde_json::to_value(value)?);
        self.persist(&doc).await
    }

    /// Remove a key; a no-op when absent.
    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut doc = self.doc.lock().await;
        if doc.entries.remove(key).is_some() {
            self.persist(&doc).await?;
        }
        Ok(())
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.doc.lock().await.entries.contains_key(key)
    }

    async fn persist(&self, doc: &Document) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec_pretty(doc)?;
        let tmp = tmp_path(&self.path);
        tokio::fs::write(&tmp, &serialized).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(&path).await;
        store.put(keys::CACHED_EXPORT_RULE, &"battery_ok").await.unwrap();
        assert_eq!(
            store.get::<String>(keys::CACHED_EXPORT_RULE).await,
            Some("battery_ok".to_string())
        );

        // Reopen from disk
        let store2 = StateStore::open(&path).await;
        assert_eq!(
            store2.get::<String>(keys::CACHED_EXPORT_RULE).await,
            Some("battery_ok".to_string())
        );
    }

    #[tokio::test]
    async fn test_write_preserves_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        // Seed a document containing a key this build does not know about
        tokio::fs::write(
            &path,
            r#"{"version": 1, "future_key": {"a": 1}, "inverter_last_state": "normal"}"#,
        )
        .await
        .unwrap();

        let store = StateStore::open(&path).await;
        store.put(keys::INVERTER_POWER_LIMIT_W, &4000.0).await.unwrap();

        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["future_key"]["a"], 1);
        assert_eq!(parsed["inverter_last_state"], "normal");
        assert_eq!(parsed["inverter_power_limit_w"], 4000.0);
    }

    #[tokio::test]
    async fn test_corrupt_document_resets_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let store = StateStore::open(&path).await;
        assert!(!store.contains(keys::FORCE_MODE_STATE).await);
    }

    #[tokio::test]
    async fn test_remove_clears_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path().join("state.json")).await;
        store.put(keys::FORCE_MODE_STATE, &42).await.unwrap();
        store.remove(keys::FORCE_MODE_STATE).await.unwrap();
        assert!(!store.contains(keys::FORCE_MODE_STATE).await);
    }
}
