//! Integration tests for the JSON-snapshot file store.

use std::path::PathBuf;

use tether_store::{FileStore, StoreError, TableStore};

/// A unique snapshot path under the system temp dir.
fn temp_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("tether-store-{name}-{}.json", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

#[tokio::test]
async fn test_open_missing_file_starts_empty() {
    let path = temp_path("missing");
    let store = FileStore::open(&path).await.expect("should open");
    assert_eq!(store.get("agentConf", b"conf").await.unwrap(), None);
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let path = temp_path("reopen");
    {
        let store = FileStore::open(&path).await.unwrap();
        store.upsert("agentNodes", b"abc", b"{\"x\":1}".to_vec()).await.unwrap();
        store.upsert("agentNodes", b"def", b"gone".to_vec()).await.unwrap();
        store.delete("agentNodes", b"def").await.unwrap();
        store.close().await.unwrap();
    }

    let reopened = FileStore::open(&path).await.unwrap();
    assert_eq!(
        reopened.get("agentNodes", b"abc").await.unwrap(),
        Some(b"{\"x\":1}".to_vec())
    );
    assert_eq!(reopened.get("agentNodes", b"def").await.unwrap(), None);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_corrupt_file_is_reported() {
    let path = temp_path("corrupt");
    std::fs::write(&path, b"not json").unwrap();

    let result = FileStore::open(&path).await;
    assert!(matches!(result, Err(StoreError::Corrupt(_))));
    let _ = std::fs::remove_file(&path);
}
