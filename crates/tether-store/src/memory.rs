//! In-memory table store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use crate::{StoreError, TableStore};

pub(crate) type Table = BTreeMap<Vec<u8>, Vec<u8>>;
pub(crate) type Tables = HashMap<String, Table>;

/// A [`TableStore`] that keeps every table in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_tables(tables: Tables) -> Self {
        Self {
            tables: RwLock::new(tables),
            closed: AtomicBool::new(false),
        }
    }

    /// Read access for snapshotting.
    pub(crate) async fn snapshot<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&*self.tables.read().await)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl TableStore for MemoryStore {
    async fn upsert(&self, table: &str, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default()
            .insert(key.to_vec(), value);
        Ok(())
    }

    async fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }

    async fn delete(&self, table: &str, key: &[u8]) -> Result<(), StoreError> {
        self.ensure_open()?;
        if let Some(t) = self.tables.write().await.get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }

    async fn scan(&self, table: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_get_delete() {
        let store = MemoryStore::new();
        store.upsert("t", b"k", b"v1".to_vec()).await.unwrap();
        store.upsert("t", b"k", b"v2".to_vec()).await.unwrap();
        assert_eq!(store.get("t", b"k").await.unwrap(), Some(b"v2".to_vec()));

        store.delete("t", b"k").await.unwrap();
        assert_eq!(store.get("t", b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tables_are_isolated() {
        let store = MemoryStore::new();
        store.upsert("a", b"k", b"1".to_vec()).await.unwrap();
        assert_eq!(store.get("b", b"k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_is_key_ordered() {
        let store = MemoryStore::new();
        for key in [b"c", b"a", b"b"] {
            store.upsert("t", key, key.to_vec()).await.unwrap();
        }
        let keys: Vec<Vec<u8>> = store.scan("t").await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_calls() {
        let store = MemoryStore::new();
        store.close().await.unwrap();
        assert!(matches!(store.get("t", b"k").await, Err(StoreError::Closed)));
    }
}
