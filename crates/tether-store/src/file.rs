//! Table store persisted as a JSON snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::memory::{Table, Tables};
use crate::{MemoryStore, StoreError, TableStore};

/// On-disk layout: table → hex(key) → hex(value).
type Snapshot = BTreeMap<String, BTreeMap<String, String>>;

/// A [`TableStore`] that serves reads from memory and rewrites a JSON
/// snapshot file after every mutation.
///
/// The snapshot is written to a sibling temp file and renamed into place,
/// so a crash mid-write leaves the previous snapshot intact.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
    /// Serializes snapshot writes so they land in mutation order.
    writer: Mutex<()>,
}

impl FileStore {
    /// Opens the store at `path`, loading the snapshot if one exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) => decode(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::new(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), tables = tables.len(), "file store opened");
        Ok(Self {
            path,
            inner: MemoryStore::from_tables(tables),
            writer: Mutex::new(()),
        })
    }

    /// The snapshot file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let _guard = self.writer.lock().await;
        let bytes = self.inner.snapshot(encode).await?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), "snapshot written");
        Ok(())
    }
}

impl TableStore for FileStore {
    async fn upsert(&self, table: &str, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.inner.upsert(table, key, value).await?;
        self.persist().await
    }

    async fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(table, key).await
    }

    async fn delete(&self, table: &str, key: &[u8]) -> Result<(), StoreError> {
        self.inner.delete(table, key).await?;
        self.persist().await
    }

    async fn scan(&self, table: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.inner.scan(table).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.persist().await?;
        self.inner.close().await
    }
}

fn encode(tables: &Tables) -> Result<Vec<u8>, StoreError> {
    let snapshot: Snapshot = tables
        .iter()
        .map(|(name, table)| {
            let entries = table
                .iter()
                .map(|(k, v)| (hex::encode(k), hex::encode(v)))
                .collect();
            (name.clone(), entries)
        })
        .collect();
    serde_json::to_vec_pretty(&snapshot).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Tables, StoreError> {
    let snapshot: Snapshot =
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    snapshot
        .into_iter()
        .map(|(name, entries)| {
            let table = entries
                .into_iter()
                .map(|(k, v)| Ok((unhex(&k)?, unhex(&v)?)))
                .collect::<Result<Table, StoreError>>()?;
            Ok((name, table))
        })
        .collect()
}

fn unhex(s: &str) -> Result<Vec<u8>, StoreError> {
    hex::decode(s).map_err(|e| StoreError::Corrupt(e.to_string()))
}
