//! The agent's provisioning record and the store that persists it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_protocol::ClientId;
use tether_store::TableStore;
use tracing::{debug, info};

use crate::AgentError;

/// Table holding the provisioning record.
pub const CONF_TABLE: &str = "agentConf";

/// Key of the single provisioning record.
pub const CONF_KEY: &[u8] = b"conf";

/// What a node remembers about its own provisioning.
///
/// All times are unix seconds; zero means "never".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conf {
    /// Server-issued identity, empty until the first SignUp.
    pub identity: ClientId,
    /// When `identity` stops being valid.
    pub expiration_time: u64,
    /// When the current identity was first issued.
    pub provision_time: u64,
    /// When the record last changed.
    pub last_update_time: u64,
    /// How many SignUps have updated this record.
    pub repeat_times: u64,
}

impl Conf {
    /// Whether a SignUp is needed: no identity yet, or it has expired.
    pub fn needs_provisioning(&self, now: u64) -> bool {
        self.identity.is_empty() || self.expiration_time <= now
    }
}

/// Loads, caches and persists the [`Conf`] record.
///
/// Every mutation is written through to the backing store before the
/// cached copy changes.
pub struct ProvisionStore<S> {
    store: Arc<S>,
    conf: Mutex<Conf>,
}

impl<S: TableStore> ProvisionStore<S> {
    /// Loads the record, creating a zeroed one on first run.
    pub async fn open(store: Arc<S>) -> Result<Self, AgentError> {
        let conf = match store.get(CONF_TABLE, CONF_KEY).await? {
            Some(bytes) => {
                let conf: Conf = serde_json::from_slice(&bytes)?;
                debug!(identity = %conf.identity, "provisioning record loaded");
                conf
            }
            None => {
                let conf = Conf::default();
                store
                    .upsert(CONF_TABLE, CONF_KEY, serde_json::to_vec(&conf)?)
                    .await?;
                info!("fresh provisioning record created");
                conf
            }
        };
        Ok(Self {
            store,
            conf: Mutex::new(conf),
        })
    }

    /// A copy of the current record.
    pub fn conf(&self) -> Conf {
        self.conf.lock().clone()
    }

    /// The current identity; empty if unprovisioned.
    pub fn identity(&self) -> ClientId {
        self.conf.lock().identity.clone()
    }

    /// Whether a SignUp is needed at unix time `now`.
    pub fn needs_provisioning(&self, now: u64) -> bool {
        self.conf.lock().needs_provisioning(now)
    }

    /// Records the outcome of a successful SignUp and persists it.
    pub async fn update_identity(
        &self,
        identity: ClientId,
        expiration_time: u64,
    ) -> Result<Conf, AgentError> {
        let now = unix_secs();
        let mut next = self.conf();
        if next.identity != identity {
            next.provision_time = now;
        }
        next.identity = identity;
        next.expiration_time = expiration_time;
        next.last_update_time = now;
        next.repeat_times += 1;

        self.persist(&next).await?;
        info!(identity = %next.identity, expires = next.expiration_time, "identity provisioned");
        *self.conf.lock() = next.clone();
        Ok(next)
    }

    /// Factory reset: deletes the record. The next authentication performs
    /// a fresh SignUp.
    pub async fn reset(&self) -> Result<(), AgentError> {
        self.store.delete(CONF_TABLE, CONF_KEY).await?;
        *self.conf.lock() = Conf::default();
        info!("provisioning record reset");
        Ok(())
    }

    async fn persist(&self, conf: &Conf) -> Result<(), AgentError> {
        let bytes = serde_json::to_vec(conf)?;
        self.store.upsert(CONF_TABLE, CONF_KEY, bytes).await?;
        Ok(())
    }
}

pub(crate) fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use tether_store::MemoryStore;

    use super::*;

    #[test]
    fn test_needs_provisioning_without_identity() {
        assert!(Conf::default().needs_provisioning(0));
    }

    #[test]
    fn test_needs_provisioning_after_expiry() {
        let conf = Conf {
            identity: ClientId::new("a"),
            expiration_time: 100,
            ..Default::default()
        };
        assert!(!conf.needs_provisioning(99));
        assert!(conf.needs_provisioning(100));
    }

    #[tokio::test]
    async fn test_open_creates_zeroed_record() {
        let store = Arc::new(MemoryStore::new());
        let provision = ProvisionStore::open(Arc::clone(&store)).await.unwrap();
        assert_eq!(provision.conf(), Conf::default());
        assert!(store.get(CONF_TABLE, CONF_KEY).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_identity_persists_and_counts() {
        let store = Arc::new(MemoryStore::new());
        let provision = ProvisionStore::open(Arc::clone(&store)).await.unwrap();

        let first = provision
            .update_identity(ClientId::new("a"), u64::MAX)
            .await
            .unwrap();
        assert_eq!(first.repeat_times, 1);
        assert!(first.provision_time > 0);

        let second = provision
            .update_identity(ClientId::new("a"), u64::MAX - 1)
            .await
            .unwrap();
        assert_eq!(second.repeat_times, 2);
        assert_eq!(second.provision_time, first.provision_time);

        let reopened = ProvisionStore::open(store).await.unwrap();
        assert_eq!(reopened.conf(), second);
        assert!(!reopened.needs_provisioning(unix_secs()));
    }

    #[tokio::test]
    async fn test_reset_forgets_identity() {
        let store = Arc::new(MemoryStore::new());
        let provision = ProvisionStore::open(Arc::clone(&store)).await.unwrap();
        provision
            .update_identity(ClientId::new("a"), u64::MAX)
            .await
            .unwrap();

        provision.reset().await.unwrap();

        assert!(provision.identity().is_empty());
        assert!(store.get(CONF_TABLE, CONF_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_record() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert(CONF_TABLE, CONF_KEY, b"not json".to_vec())
            .await
            .unwrap();
        assert!(matches!(
            ProvisionStore::open(store).await,
            Err(AgentError::Record(_))
        ));
    }
}
