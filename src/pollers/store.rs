//! Write seams for the two poller persistence patterns.
//!
//! [`UpsertStore`] writes-or-updates rows by natural key and is safe to resume
//! after a partial failure. [`SnapshotStore`] replaces the whole table inside
//! one transaction, so readers see either the old set or the new one.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// A row with a stable natural key.
pub trait Keyed {
    type Key: Eq + Hash + Clone + Send + Sync;

    fn key(&self) -> Self::Key;
}

#[async_trait]
pub trait UpsertStore<T>: Send + Sync
where
    T: Keyed + Send + Sync + 'static,
{
    /// Insert or update `rows` by key. Returns the number of rows written.
    async fn upsert(&self, rows: &[T]) -> Result<u64>;
}

#[async_trait]
pub trait SnapshotStore<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Delete every existing row and insert `rows`, atomically. An empty slice
    /// still clears the table.
    async fn replace_all(&self, rows: &[T]) -> Result<u64>;
}

#[derive(Debug)]
pub struct MemoryUpsertStore<T: Keyed> {
    rows: Mutex<HashMap<T::Key, T>>,
}

impl<T: Keyed> Default for MemoryUpsertStore<T> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Keyed + Clone> MemoryUpsertStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<T> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, key: &T::Key) -> Option<T> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl<T> UpsertStore<T> for MemoryUpsertStore<T>
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    async fn upsert(&self, rows: &[T]) -> Result<u64> {
        let mut stored = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        for row in rows {
            stored.insert(row.key(), row.clone());
        }
        Ok(rows.len() as u64)
    }
}

#[derive(Debug)]
pub struct MemorySnapshotStore<T> {
    rows: Mutex<Vec<T>>,
}

impl<T> Default for MemorySnapshotStore<T> {
    fn default() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> MemorySnapshotStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing table, as left by a previous run.
    pub fn with_rows(rows: Vec<T>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub fn rows(&self) -> Vec<T> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl<T> SnapshotStore<T> for MemorySnapshotStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn replace_all(&self, rows: &[T]) -> Result<u64> {
        *self.rows.lock().unwrap_or_else(|e| e.into_inner()) = rows.to_vec();
        Ok(rows.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Station {
        id: &'static str,
        temp: i32,
    }

    impl Keyed for Station {
        type Key = &'static str;

        fn key(&self) -> Self::Key {
            self.id
        }
    }

    #[tokio::test]
    async fn upserting_twice_is_idempotent() {
        let store = MemoryUpsertStore::new();
        let batch = vec![Station { id: "KAUS", temp: 20 }, Station { id: "KSAT", temp: 22 }];
        store.upsert(&batch).await.unwrap();
        store.upsert(&batch).await.unwrap();
        assert_eq!(store.rows().len(), 2);

        store
            .upsert(&[Station { id: "KAUS", temp: 25 }])
            .await
            .unwrap();
        assert_eq!(store.rows().len(), 2);
        assert_eq!(store.get(&"KAUS").unwrap().temp, 25);
    }

    #[tokio::test]
    async fn empty_replace_clears() {
        let store = MemorySnapshotStore::with_rows(vec![1, 2, 3]);
        store.replace_all(&[]).await.unwrap();
        assert!(store.rows().is_empty());
    }
}
