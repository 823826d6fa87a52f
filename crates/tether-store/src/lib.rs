//! Table-scoped key-value storage for Tether.
//!
//! Provisioning records (agent side) and node records (server side) are
//! kept in a [`TableStore`]: named tables of ordered byte keys mapping to
//! opaque byte values. The store guarantees that a single `upsert`, `get`
//! or `delete` is atomic per key; anything coarser is the caller's job.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryStore`]: in-process, lost on exit. Tests and ephemeral servers.
//! - [`FileStore`]: the same tables, snapshotted to a JSON file after
//!   every mutation so records survive restarts.

mod error;
mod file;
mod memory;

pub use error::StoreError;
pub use file::FileStore;
pub use memory::MemoryStore;

use std::future::Future;

/// An ordered, table-scoped key-value store.
///
/// Opened once per process, shared behind an `Arc`, closed on shutdown.
pub trait TableStore: Send + Sync + 'static {
    /// Inserts or replaces the value stored under `key` in `table`.
    fn upsert(
        &self,
        table: &str,
        key: &[u8],
        value: Vec<u8>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Returns the value stored under `key`, or `None`.
    fn get(
        &self,
        table: &str,
        key: &[u8],
    ) -> impl Future<Output = Result<Option<Vec<u8>>, StoreError>> + Send;

    /// Removes `key` from `table`. Removing a missing key is not an error.
    fn delete(
        &self,
        table: &str,
        key: &[u8],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// All entries of `table`, in key order.
    fn scan(
        &self,
        table: &str,
    ) -> impl Future<Output = Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>> + Send;

    /// Flushes and closes the store. Later calls fail with
    /// [`StoreError::Closed`].
    fn close(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
