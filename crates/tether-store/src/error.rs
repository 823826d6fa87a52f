//! Error types for the store layer.

/// Errors that can occur in a [`TableStore`](crate::TableStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file exists but can't be parsed.
    #[error("store file is corrupt: {0}")]
    Corrupt(String),

    /// The store was closed.
    #[error("store is closed")]
    Closed,
}
