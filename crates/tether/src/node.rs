//! Persistent node records.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tether_protocol::{ClientId, DeviceId};
use tether_store::TableStore;

use crate::ServerError;

/// Table holding node records, keyed by identity.
pub const NODE_TABLE: &str = "agentNodes";

/// Liveness of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Signed up or signed out, or its connection ended.
    #[default]
    Offline,
    /// Signed in on a live connection.
    Online,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Offline => "offline",
            Self::Online => "online",
        })
    }
}

/// The server's record of one provisioned node.
///
/// Never deleted; status transitions model liveness. Times are unix
/// seconds, zero meaning "never".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Immutable once assigned.
    pub identity: ClientId,
    pub device_id: DeviceId,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub endpoint: String,
    pub expire_time: u64,
    pub sign_up_time: u64,
    #[serde(default)]
    pub sign_in_time: u64,
    pub update_time: u64,
}

impl Node {
    /// A fresh, offline record created by SignUp.
    pub fn new(identity: ClientId, device_id: DeviceId, expire_time: u64, now: u64) -> Self {
        Self {
            identity,
            device_id,
            status: NodeStatus::Offline,
            endpoint: String::new(),
            expire_time,
            sign_up_time: now,
            sign_in_time: 0,
            update_time: now,
        }
    }

    /// Whether the node is signed in.
    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }
}

/// Node records on top of a [`TableStore`].
pub struct NodeStore<S> {
    store: Arc<S>,
}

impl<S> Clone for NodeStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: TableStore> NodeStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The record for `identity`, if any.
    pub async fn get(&self, identity: &ClientId) -> Result<Option<Node>, ServerError> {
        match self.store.get(NODE_TABLE, identity.as_str().as_bytes()).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Inserts or replaces a record.
    pub async fn put(&self, node: &Node) -> Result<(), ServerError> {
        let bytes = serde_json::to_vec(node)?;
        self.store
            .upsert(NODE_TABLE, node.identity.as_str().as_bytes(), bytes)
            .await?;
        Ok(())
    }

    /// Every record, ordered by identity.
    pub async fn list(&self) -> Result<Vec<Node>, ServerError> {
        let rows = self.store.scan(NODE_TABLE).await?;
        rows.into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(ServerError::from))
            .collect()
    }

    /// Closes the backing store.
    pub async fn close(&self) -> Result<(), ServerError> {
        self.store.close().await?;
        Ok(())
    }
}
