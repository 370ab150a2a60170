//! Persistence for engine records
//!
//! Small collections (`subscriptions`, `integrations`) are snapshotted as
//! one JSON document. High-volume collections (`deliveries`) are stored
//! one record at a time, so a write costs the same regardless of history.

use crate::error::{Result, WebhookError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Trait for persisting engine records
///
/// The per-record methods default to rewriting the collection snapshot;
/// backends that can address single records should override them.
pub trait StateStore: Send + Sync {
    /// Replace the stored snapshot of a collection
    fn save(&self, collection: &str, snapshot: &Value) -> Result<()>;

    /// Load a collection snapshot, `None` if nothing was saved yet
    fn load(&self, collection: &str) -> Result<Option<Value>>;

    /// Insert or replace one record of a keyed collection
    fn put_record(&self, collection: &str, id: &str, record: &Value) -> Result<()> {
        let mut records = snapshot_object(self.load(collection)?);
        records.insert(id.to_string(), record.clone());
        self.save(collection, &Value::Object(records))
    }

    /// Remove one record; a missing record is not an error
    fn remove_record(&self, collection: &str, id: &str) -> Result<()> {
        let mut records = snapshot_object(self.load(collection)?);
        if records.remove(id).is_some() {
            self.save(collection, &Value::Object(records))?;
        }
        Ok(())
    }

    /// Every record of a keyed collection
    fn load_records(&self, collection: &str) -> Result<Vec<Value>> {
        Ok(snapshot_object(self.load(collection)?).into_iter().map(|(_, v)| v).collect())
    }
}

fn snapshot_object(snapshot: Option<Value>) -> Map<String, Value> {
    match snapshot {
        Some(Value::Object(records)) => records,
        _ => Map::new(),
    }
}

/// Load a keyed collection, empty if never saved
pub(crate) fn load_collection<T: DeserializeOwned>(
    store: &dyn StateStore,
    collection: &str,
) -> Result<HashMap<String, T>> {
    match store.load(collection)? {
        Some(snapshot) => serde_json::from_value(snapshot).map_err(|e| {
            WebhookError::Persistence(format!("Failed to decode {} snapshot: {}", collection, e))
        }),
        None => Ok(HashMap::new()),
    }
}

/// Snapshot a keyed collection, logging failures before returning them
pub(crate) fn save_collection<T: Serialize>(
    store: &dyn StateStore,
    collection: &str,
    records: &HashMap<String, T>,
) -> Result<()> {
    let snapshot = serde_json::to_value(records)?;
    store.save(collection, &snapshot).inspect_err(|e| {
        tracing::error!(collection, error = %e, "Failed to persist snapshot");
    })
}

/// Run state I/O on the blocking pool
pub(crate) async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WebhookError::Persistence(format!("State task failed: {}", e)))?
}

fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn persistence(action: &str, path: &Path, e: impl std::fmt::Display) -> WebhookError {
    WebhookError::Persistence(format!("Failed to {} {}: {}", action, path.display(), e))
}

/// Write `bytes` to `path` through a temp file + rename
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| persistence("create directory", parent, e))?;
    }
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, bytes).map_err(|e| persistence("write state file", &tmp_path, e))?;
    std::fs::rename(&tmp_path, path).map_err(|e| persistence("rename state file", &tmp_path, e))
}

/// JSON file-based state store
///
/// Snapshots live in `<dir>/<collection>.json`; keyed records live in
/// `<dir>/<collection>/<id>.json`. Atomic writes via temp file + rename
/// to prevent corruption.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Create a new file state store rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Get the root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a collection's snapshot file
    pub fn collection_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_name(collection)))
    }

    /// Directory holding a collection's per-record files
    pub fn records_dir(&self, collection: &str) -> PathBuf {
        self.dir.join(safe_name(collection))
    }

    /// Path of one record's file
    pub fn record_path(&self, collection: &str, id: &str) -> PathBuf {
        self.records_dir(collection).join(format!("{}.json", safe_name(id)))
    }

    fn read_json(path: &Path) -> Result<Value> {
        let json =
            std::fs::read_to_string(path).map_err(|e| persistence("read state file", path, e))?;
        serde_json::from_str(&json).map_err(|e| persistence("parse state file", path, e))
    }
}

impl StateStore for FileStateStore {
    fn save(&self, collection: &str, snapshot: &Value) -> Result<()> {
        let path = self.collection_path(collection);
        let json = serde_json::to_string_pretty(snapshot)?;
        write_atomic(&path, json.as_bytes())?;

        tracing::debug!(path = %path.display(), collection, "State saved");
        Ok(())
    }

    fn load(&self, collection: &str) -> Result<Option<Value>> {
        let path = self.collection_path(collection);
        if !path.exists() {
            return Ok(None);
        }

        let snapshot = Self::read_json(&path)?;
        tracing::debug!(path = %path.display(), collection, "State loaded");
        Ok(Some(snapshot))
    }

    fn put_record(&self, collection: &str, id: &str, record: &Value) -> Result<()> {
        let path = self.record_path(collection, id);
        write_atomic(&path, &serde_json::to_vec(record)?)
    }

    fn remove_record(&self, collection: &str, id: &str) -> Result<()> {
        let path = self.record_path(collection, id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(persistence("remove state file", &path, e)),
        }
    }

    fn load_records(&self, collection: &str) -> Result<Vec<Value>> {
        let dir = self.records_dir(collection);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&dir).map_err(|e| persistence("read directory", &dir, e))?;
        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| persistence("read directory", &dir, e))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            records.push(Self::read_json(&path)?);
        }

        tracing::debug!(dir = %dir.display(), collection, count = records.len(), "Records loaded");
        Ok(records)
    }
}

/// In-memory state store for testing
///
/// Stores snapshots and records in memory; contents are lost on drop.
#[derive(Default)]
pub struct MemoryStateStore {
    state: std::sync::RwLock<HashMap<String, Value>>,
    records: std::sync::RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(e: impl std::fmt::Display) -> WebhookError {
    WebhookError::Persistence(format!("Failed to acquire state lock: {}", e))
}

impl StateStore for MemoryStateStore {
    fn save(&self, collection: &str, snapshot: &Value) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        state.insert(collection.to_string(), snapshot.clone());
        Ok(())
    }

    fn load(&self, collection: &str) -> Result<Option<Value>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state.get(collection).cloned())
    }

    fn put_record(&self, collection: &str, id: &str, record: &Value) -> Result<()> {
        let mut records = self.records.write().map_err(poisoned)?;
        records
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    fn remove_record(&self, collection: &str, id: &str) -> Result<()> {
        let mut records = self.records.write().map_err(poisoned)?;
        if let Some(collection) = records.get_mut(collection) {
            collection.remove(id);
        }
        Ok(())
    }

    fn load_records(&self, collection: &str) -> Result<Vec<Value>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn sample() -> Value {
        json!({
            "sub-1": {"url": "https://a.example.com"},
            "sub-2": {"url": "https://b.example.com"}
        })
    }

    #[test]
    fn test_memory_store_save_load() {
        let store = MemoryStateStore::new();
        store.save("subscriptions", &sample()).unwrap();

        let loaded = store.load("subscriptions").unwrap().unwrap();
        assert_eq!(loaded["sub-1"]["url"], "https://a.example.com");
        assert!(store.load("deliveries").unwrap().is_none());
    }

    #[test]
    fn test_memory_store_overwrite() {
        let store = MemoryStateStore::new();
        store.save("subscriptions", &sample()).unwrap();
        store.save("subscriptions", &json!({})).unwrap();

        let loaded = store.load("subscriptions").unwrap().unwrap();
        assert_eq!(loaded, json!({}));
    }

    #[test]
    fn test_file_store_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        store.save("subscriptions", &sample()).unwrap();
        assert!(dir.path().join("subscriptions.json").exists());

        let loaded = store.load("subscriptions").unwrap().unwrap();
        assert_eq!(loaded, sample());

        // Human-readable on disk
        let content = std::fs::read_to_string(dir.path().join("subscriptions.json")).unwrap();
        assert!(content.contains("https://b.example.com"));
    }

    #[test]
    fn test_file_store_load_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("never-created"));
        assert!(store.load("subscriptions").unwrap().is_none());
    }

    #[test]
    fn test_file_store_creates_nested_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested").join("deep");
        let store = FileStateStore::new(&nested);

        store.save("deliveries", &json!([])).unwrap();
        assert!(nested.join("deliveries.json").exists());
    }

    #[test]
    fn test_file_store_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        store.save("integrations", &sample()).unwrap();
        store.save("integrations", &sample()).unwrap();
        assert!(!dir.path().join("integrations.tmp").exists());
    }

    #[test]
    fn test_file_store_corrupt_file_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("subscriptions.json"), "{not json").unwrap();

        let store = FileStateStore::new(dir.path());
        let err = store.load("subscriptions").unwrap_err();
        assert!(matches!(err, WebhookError::Persistence(_)));
    }

    #[test]
    fn test_collection_path_is_sanitized() {
        let store = FileStateStore::new("/tmp/state");
        let path = store.collection_path("../escape");
        assert!(path.starts_with("/tmp/state"));
        assert!(!path.to_string_lossy().contains(".."));
    }

    // ─── Per-record persistence ──────────────────────────────────

    #[test]
    fn test_file_store_records_are_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        store.put_record("deliveries", "d-1", &json!({"id": "d-1"})).unwrap();
        store.put_record("deliveries", "d-2", &json!({"id": "d-2"})).unwrap();
        assert!(dir.path().join("deliveries").join("d-1.json").exists());
        assert!(dir.path().join("deliveries").join("d-2.json").exists());
        assert!(!dir.path().join("deliveries.json").exists());

        store.remove_record("deliveries", "d-1").unwrap();
        store.remove_record("deliveries", "d-1").unwrap();

        let records = store.load_records("deliveries").unwrap();
        assert_eq!(records, vec![json!({"id": "d-2"})]);
        assert!(store.load_records("integrations").unwrap().is_empty());
    }

    #[test]
    fn test_record_path_is_sanitized() {
        let store = FileStateStore::new("/tmp/state");
        let path = store.record_path("deliveries", "../../etc/passwd");
        assert!(path.starts_with("/tmp/state/deliveries"));
        assert!(!path.to_string_lossy().contains(".."));
    }

    #[test]
    fn test_memory_store_records() {
        let store = MemoryStateStore::new();
        store.put_record("deliveries", "d-1", &json!({"n": 1})).unwrap();
        store.put_record("deliveries", "d-1", &json!({"n": 2})).unwrap();

        assert_eq!(store.load_records("deliveries").unwrap(), vec![json!({"n": 2})]);
        store.remove_record("deliveries", "d-1").unwrap();
        assert!(store.load_records("deliveries").unwrap().is_empty());
    }

    struct SnapshotOnly(MemoryStateStore);

    impl StateStore for SnapshotOnly {
        fn save(&self, collection: &str, snapshot: &Value) -> Result<()> {
            self.0.save(collection, snapshot)
        }

        fn load(&self, collection: &str) -> Result<Option<Value>> {
            self.0.load(collection)
        }
    }

    #[test]
    fn test_default_record_methods_use_snapshot() {
        let store = SnapshotOnly(MemoryStateStore::new());
        store.put_record("deliveries", "d-1", &json!({"n": 1})).unwrap();
        store.put_record("deliveries", "d-2", &json!({"n": 2})).unwrap();
        store.remove_record("deliveries", "d-1").unwrap();

        assert_eq!(store.load("deliveries").unwrap().unwrap(), json!({"d-2": {"n": 2}}));
        assert_eq!(store.load_records("deliveries").unwrap(), vec![json!({"n": 2})]);
    }

    #[tokio::test]
    async fn test_blocking_runs_off_the_async_worker() {
        let store = Arc::new(MemoryStateStore::new());
        let writer = store.clone();
        blocking(move || writer.put_record("deliveries", "d-1", &json!({}))).await.unwrap();
        assert_eq!(store.load_records("deliveries").unwrap().len(), 1);
    }
}
