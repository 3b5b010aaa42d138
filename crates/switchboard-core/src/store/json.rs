//! File-backed record store.
//!
//! # Atomic Writes
//!
//! Every save uses write-then-rename so a crash mid-write never leaves a
//! truncated record behind:
//!
//! 1. Write to `<id>.json.tmp`
//! 2. Rename to `<id>.json` (atomic on Unix)
//!
//! A restart therefore sees either the previous or the new version of each
//! record, never a corrupted one.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;

use super::{Collection, Store, StoreError};

/// A [`Store`] keeping one pretty-printed JSON file per record.
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.as_str())
    }

    fn record_path(&self, collection: Collection, id: &str) -> Result<PathBuf, StoreError> {
        validate_key(id)?;
        Ok(self.collection_dir(collection).join(format!("{id}.json")))
    }
}

/// Reject keys that would escape the collection directory.
fn validate_key(id: &str) -> Result<(), StoreError> {
    if id.is_empty() {
        return Err(StoreError::InvalidKey("key cannot be empty".to_string()));
    }

    let mut components = Path::new(id).components();
    match components.next() {
        Some(Component::Normal(_)) if components.next().is_none() => Ok(()),
        _ => Err(StoreError::InvalidKey(id.to_string())),
    }
}

#[async_trait]
impl Store for JsonStore {
    async fn put(&self, collection: Collection, id: &str, record: Value) -> Result<(), StoreError> {
        let path = self.record_path(collection, id)?;
        fs::create_dir_all(self.collection_dir(collection)).await?;

        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&record)?;
        fs::write(&temp_path, json).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, StoreError> {
        let path = self.record_path(collection, id)?;
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, collection: Collection) -> Result<Vec<Value>, StoreError> {
        let dir = self.collection_dir(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path).await?;
            match serde_json::from_str(&contents) {
                Ok(value) => records.push(value),
                Err(e) => log::warn!("Ignoring unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        let path = self.record_path(collection, id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
