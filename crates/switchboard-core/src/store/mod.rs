//! Persistence gateway.
//!
//! # Overview
//!
//! Every durable record (sessions, requests, tasks, chat turns, queued
//! messages, allowlist rules, notifications) goes through the [`Store`]
//! trait: a key-indexed record store grouped into [`Collection`]s.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryStore`] - process-local, used by tests and `--memory` runs
//! - [`JsonStore`] - one JSON file per record under a data directory
//!
//! ```text
//! <data-dir>/
//! ├── sessions/<session-id>.json
//! ├── requests/<request-id>.json
//! ├── tasks/<task-id>.json
//! ├── turns/<turn-id>.json
//! ├── messages/<message-id>.json
//! ├── rules/<rule-id>.json
//! └── notifications/<notification-id>.json
//! ```
//!
//! Components talk to the store through [`Records`], which adds typed
//! (serde) access and the by-session index on top of the raw trait.

mod json;
mod memory;

pub use json::JsonStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// A group of records of the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Sessions,
    Requests,
    Tasks,
    Turns,
    Messages,
    Rules,
    Notifications,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Sessions,
        Collection::Requests,
        Collection::Tasks,
        Collection::Turns,
        Collection::Messages,
        Collection::Rules,
        Collection::Notifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Sessions => "sessions",
            Collection::Requests => "requests",
            Collection::Tasks => "tasks",
            Collection::Turns => "turns",
            Collection::Messages => "messages",
            Collection::Rules => "rules",
            Collection::Notifications => "notifications",
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid record key: {0}")]
    InvalidKey(String),
}

/// Key-indexed durable record store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace a record.
    async fn put(&self, collection: Collection, id: &str, record: Value) -> Result<(), StoreError>;

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, StoreError>;

    /// All records of a collection, in no particular order.
    async fn list(&self, collection: Collection) -> Result<Vec<Value>, StoreError>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, collection: Collection, id: &str) -> Result<bool, StoreError>;
}

/// Typed access to a [`Store`].
///
/// Records are JSON objects with an `id` field and, when owned by a session,
/// a `session_id` field. The by-session helpers rely on that shape.
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn Store>,
}

impl Records {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Records backed by a fresh [`MemoryStore`].
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub async fn save<T: Serialize>(
        &self,
        collection: Collection,
        id: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(record)?;
        self.store.put(collection, id, value).await
    }

    pub async fn load<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        match self.store.get(collection, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Load every record of a collection.
    ///
    /// Records that no longer parse are skipped with a warning rather than
    /// failing the whole load.
    pub async fn load_all<T: DeserializeOwned>(
        &self,
        collection: Collection,
    ) -> Result<Vec<T>, StoreError> {
        let values = self.store.list(collection).await?;
        Ok(decode_all(collection, values))
    }

    pub async fn load_for_session<T: DeserializeOwned>(
        &self,
        collection: Collection,
        session_id: &str,
    ) -> Result<Vec<T>, StoreError> {
        let values = self
            .store
            .list(collection)
            .await?
            .into_iter()
            .filter(|v| owned_by(v, session_id))
            .collect();
        Ok(decode_all(collection, values))
    }

    pub async fn remove(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        self.store.delete(collection, id).await
    }

    /// Delete every record of a collection owned by a session.
    pub async fn remove_for_session(
        &self,
        collection: Collection,
        session_id: &str,
    ) -> Result<usize, StoreError> {
        let ids: Vec<String> = self
            .store
            .list(collection)
            .await?
            .iter()
            .filter(|v| owned_by(v, session_id))
            .filter_map(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
            .collect();

        let mut removed = 0;
        for id in ids {
            if self.store.delete(collection, &id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn owned_by(value: &Value, session_id: &str) -> bool {
    value.get("session_id").and_then(Value::as_str) == Some(session_id)
}

fn decode_all<T: DeserializeOwned>(collection: Collection, values: Vec<Value>) -> Vec<T> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("Skipping malformed {} record: {}", collection.as_str(), e);
                None
            }
        })
        .collect()
}

/// Store doubles for exercising persistence failures.
#[cfg(test)]
pub(crate) mod flaky {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// A [`MemoryStore`] whose writes fail once [`break_writes`] is called.
    ///
    /// [`break_writes`]: FlakyStore::break_writes
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        inner: MemoryStore,
        broken: AtomicBool,
    }

    impl FlakyStore {
        pub(crate) fn break_writes(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn put(&self, collection: Collection, id: &str, record: Value) -> Result<(), StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.inner.put(collection, id, record).await
        }

        async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, StoreError> {
            self.inner.get(collection, id).await
        }

        async fn list(&self, collection: Collection) -> Result<Vec<Value>, StoreError> {
            self.inner.list(collection).await
        }

        async fn delete(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
            self.inner.delete(collection, id).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        session_id: Option<String>,
        text: String,
    }

    fn note(id: &str, session: Option<&str>) -> Note {
        Note {
            id: id.to_string(),
            session_id: session.map(str::to_string),
            text: format!("note {id}"),
        }
    }

    mod collection {
        use super::*;

        #[test]
        fn names_are_unique() {
            let mut names: Vec<_> = Collection::ALL.iter().map(|c| c.as_str()).collect();
            names.sort();
            names.dedup();
            assert_eq!(names.len(), Collection::ALL.len());
        }
    }

    mod records {
        use super::*;

        #[tokio::test]
        async fn save_then_load() {
            let records = Records::memory();
            records
                .save(Collection::Turns, "n1", &note("n1", Some("s1")))
                .await
                .unwrap();

            let loaded: Option<Note> = records.load(Collection::Turns, "n1").await.unwrap();
            assert_eq!(loaded, Some(note("n1", Some("s1"))));
        }

        #[tokio::test]
        async fn load_missing_is_none() {
            let records = Records::memory();
            let loaded: Option<Note> = records.load(Collection::Turns, "nope").await.unwrap();
            assert!(loaded.is_none());
        }

        #[tokio::test]
        async fn load_for_session_filters_by_owner() {
            let records = Records::memory();
            records.save(Collection::Turns, "a", &note("a", Some("s1"))).await.unwrap();
            records.save(Collection::Turns, "b", &note("b", Some("s2"))).await.unwrap();
            records.save(Collection::Turns, "c", &note("c", None)).await.unwrap();

            let owned: Vec<Note> = records.load_for_session(Collection::Turns, "s1").await.unwrap();
            assert_eq!(owned, vec![note("a", Some("s1"))]);
        }

        #[tokio::test]
        async fn remove_for_session_leaves_other_records() {
            let records = Records::memory();
            records.save(Collection::Tasks, "a", &note("a", Some("s1"))).await.unwrap();
            records.save(Collection::Tasks, "b", &note("b", Some("s1"))).await.unwrap();
            records.save(Collection::Tasks, "c", &note("c", Some("s2"))).await.unwrap();

            let removed = records.remove_for_session(Collection::Tasks, "s1").await.unwrap();
            assert_eq!(removed, 2);

            let left: Vec<Note> = records.load_all(Collection::Tasks).await.unwrap();
            assert_eq!(left, vec![note("c", Some("s2"))]);
        }

        #[tokio::test]
        async fn malformed_records_are_skipped() {
            let store = Arc::new(MemoryStore::new());
            store
                .put(Collection::Rules, "bad", serde_json::json!({"unexpected": true}))
                .await
                .unwrap();
            let records = Records::new(store);
            records.save(Collection::Rules, "good", &note("good", None)).await.unwrap();

            let loaded: Vec<Note> = records.load_all(Collection::Rules).await.unwrap();
            assert_eq!(loaded.len(), 1);
            assert_eq!(loaded[0].id, "good");
        }
    }
}
