//! The session manager: two indices over the live sessions.
//!
//! # Concurrency note
//!
//! Both maps sit behind one lock and are only ever read or changed while it
//! is held, so two connections racing to bind the same identity always
//! leave the indices consistent. No method awaits while holding the lock.

use std::collections::HashMap;

use parking_lot::RwLock;
use rand::Rng;
use tether_protocol::{ClientId, StreamMessage};
use tether_transport::ConnectionId;
use tracing::{debug, info, warn};

use crate::{Session, SessionError, StreamHandle};

#[derive(Default)]
struct Indices {
    by_key: HashMap<ConnectionId, Session>,
    by_id: HashMap<ClientId, ConnectionId>,
}

/// Tracks every live session by connection key and by node identity.
///
/// ## Lifecycle
///
/// ```text
/// save(key) ──→ bind(key, id) ──→ update_stream(key, h) ──→ delete(key)
///  [Phase I]      [Phase II]          [push ready]         [gone]
/// ```
#[derive(Default)]
pub struct SessionManager {
    indices: RwLock<Indices>,
}

impl SessionManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Phase I: records a new, unbound session for `key`.
    ///
    /// Saving a key that already has a session keeps the existing one.
    pub fn save(&self, key: ConnectionId) -> Session {
        let mut idx = self.indices.write();
        let session = idx.by_key.entry(key).or_insert_with(|| {
            debug!(conn = %key, "session saved");
            Session::new(key)
        });
        session.clone()
    }

    /// Phase II: binds `identity` to the session for `key`.
    ///
    /// Returns the identity the session ends up bound to. A session that is
    /// already bound keeps its identity and that identity is returned
    /// unchanged. If `identity` was bound to another connection, that older
    /// session loses it.
    pub fn bind(&self, key: ConnectionId, identity: ClientId) -> Result<ClientId, SessionError> {
        let mut idx = self.indices.write();
        let session = idx.by_key.get(&key).ok_or(SessionError::NoSession(key))?;
        if session.is_bound() {
            debug!(conn = %key, identity = %session.identity, "session already bound");
            return Ok(session.identity.clone());
        }
        link(&mut idx, key, identity.clone());
        info!(conn = %key, %identity, "session bound");
        Ok(identity)
    }

    /// Replaces whatever identity the session for `key` is bound to with
    /// `identity`. The old identity stops resolving to this connection.
    pub fn rebind(&self, key: ConnectionId, identity: ClientId) -> Result<ClientId, SessionError> {
        let mut idx = self.indices.write();
        let old = idx
            .by_key
            .get(&key)
            .ok_or(SessionError::NoSession(key))?
            .identity
            .clone();
        if !old.is_empty() && idx.by_id.get(&old) == Some(&key) {
            idx.by_id.remove(&old);
        }
        link(&mut idx, key, identity.clone());
        info!(conn = %key, %old, new = %identity, "session rebound");
        Ok(identity)
    }

    /// The session for a connection, if any.
    pub fn get_by_key(&self, key: ConnectionId) -> Option<Session> {
        self.indices.read().by_key.get(&key).cloned()
    }

    /// The session bound to an identity, if any.
    pub fn get_by_id(&self, identity: &ClientId) -> Option<Session> {
        let idx = self.indices.read();
        idx.by_id
            .get(identity)
            .and_then(|key| idx.by_key.get(key))
            .cloned()
    }

    /// Removes the session for `key` and, if bound, its identity entry.
    ///
    /// Returns the removed session.
    pub fn delete(&self, key: ConnectionId) -> Option<Session> {
        let mut idx = self.indices.write();
        let session = idx.by_key.remove(&key)?;
        if session.is_bound() && idx.by_id.get(&session.identity) == Some(&key) {
            idx.by_id.remove(&session.identity);
        }
        debug!(conn = %key, identity = %session.identity, "session deleted");
        Some(session)
    }

    /// Attaches a push stream to the session for `key`, replacing any
    /// previous one.
    pub fn update_stream(&self, key: ConnectionId, handle: StreamHandle) -> Result<(), SessionError> {
        let mut idx = self.indices.write();
        let session = idx.by_key.get_mut(&key).ok_or(SessionError::NoSession(key))?;
        session.stream = Some(handle);
        session.touch();
        debug!(conn = %key, identity = %session.identity, "stream attached");
        Ok(())
    }

    /// Detaches the push stream from the session for `key`, if any.
    pub fn clear_stream(&self, key: ConnectionId) {
        if let Some(session) = self.indices.write().by_key.get_mut(&key) {
            session.stream = None;
        }
    }

    /// Queues `message` on the push stream of the node bound to `identity`.
    pub fn push(&self, identity: &ClientId, message: StreamMessage) -> Result<(), SessionError> {
        let handle = {
            let idx = self.indices.read();
            let session = idx
                .by_id
                .get(identity)
                .and_then(|key| idx.by_key.get(key))
                .ok_or_else(|| SessionError::UnknownIdentity(identity.clone()))?;
            session
                .stream
                .clone()
                .ok_or_else(|| SessionError::NoStream(identity.clone()))?
        };
        handle
            .send(message)
            .map_err(|_| SessionError::StreamClosed(identity.clone()))
    }

    /// Identities of all bound sessions.
    pub fn identities(&self) -> Vec<ClientId> {
        self.indices.read().by_id.keys().cloned().collect()
    }

    /// Number of live sessions, bound or not.
    pub fn len(&self) -> usize {
        self.indices.read().by_key.len()
    }

    /// Returns `true` if there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.indices.read().by_key.is_empty()
    }
}

/// Points `key` at `identity` in both indices. The session must exist.
fn link(idx: &mut Indices, key: ConnectionId, identity: ClientId) {
    let Indices { by_key, by_id } = idx;
    if let Some(session) = by_key.get_mut(&key) {
        session.identity = identity.clone();
        session.touch();
    }
    if let Some(previous) = by_id.insert(identity.clone(), key) {
        if previous != key {
            warn!(%identity, old = %previous, new = %key, "identity moved to a new connection");
            if let Some(stale) = by_key.get_mut(&previous) {
                stale.identity = ClientId::default();
                stale.stream = None;
            }
        }
    }
}

/// Mints a fresh node identity: 32 lowercase hex characters, 128 random bits.
pub fn generate_identity() -> ClientId {
    let bytes: [u8; 16] = rand::rng().random();
    ClientId(hex::encode(bytes))
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use tether_protocol::StreamProcedure;
    use tokio::sync::mpsc;

    use super::*;

    fn key(id: u64) -> ConnectionId {
        ConnectionId::new(id)
    }

    fn cid(s: &str) -> ClientId {
        ClientId::new(s)
    }

    // =====================================================================
    // save() / bind()
    // =====================================================================

    #[test]
    fn test_save_creates_unbound_session() {
        let mgr = SessionManager::new();
        let session = mgr.save(key(1));
        assert_eq!(session.key, key(1));
        assert!(!session.is_bound());
        assert!(session.stream.is_none());
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_save_twice_keeps_binding() {
        let mgr = SessionManager::new();
        mgr.save(key(1));
        mgr.bind(key(1), cid("a")).unwrap();
        let again = mgr.save(key(1));
        assert_eq!(again.identity, cid("a"));
    }

    #[test]
    fn test_bind_indexes_by_identity() {
        let mgr = SessionManager::new();
        mgr.save(key(1));
        assert_eq!(mgr.bind(key(1), cid("a")).unwrap(), cid("a"));

        let by_id = mgr.get_by_id(&cid("a")).expect("bound");
        assert_eq!(by_id.key, key(1));
        assert!(mgr.get_by_key(key(1)).unwrap().is_bound());
    }

    #[test]
    fn test_bind_unknown_key_returns_no_session() {
        let mgr = SessionManager::new();
        assert!(matches!(
            mgr.bind(key(9), cid("a")),
            Err(SessionError::NoSession(k)) if k == key(9)
        ));
        assert!(mgr.get_by_id(&cid("a")).is_none());
    }

    #[test]
    fn test_bind_already_bound_returns_existing_identity() {
        let mgr = SessionManager::new();
        mgr.save(key(1));
        mgr.bind(key(1), cid("a")).unwrap();

        assert_eq!(mgr.bind(key(1), cid("b")).unwrap(), cid("a"));
        assert!(mgr.get_by_id(&cid("b")).is_none());
    }

    #[test]
    fn test_bind_same_identity_on_new_connection_moves_it() {
        let mgr = SessionManager::new();
        mgr.save(key(1));
        mgr.save(key(2));
        mgr.bind(key(1), cid("a")).unwrap();

        mgr.bind(key(2), cid("a")).unwrap();

        assert_eq!(mgr.get_by_id(&cid("a")).unwrap().key, key(2));
        assert!(!mgr.get_by_key(key(1)).unwrap().is_bound());

        // Tearing down the stale connection must not drop the new binding.
        mgr.delete(key(1));
        assert_eq!(mgr.get_by_id(&cid("a")).unwrap().key, key(2));
    }

    #[test]
    fn test_rebind_replaces_identity_and_drops_old_lookup() {
        let mgr = SessionManager::new();
        mgr.save(key(1));
        mgr.bind(key(1), cid("a")).unwrap();

        assert_eq!(mgr.rebind(key(1), cid("b")).unwrap(), cid("b"));

        assert!(mgr.get_by_id(&cid("a")).is_none());
        assert_eq!(mgr.get_by_id(&cid("b")).unwrap().key, key(1));
        assert_eq!(mgr.get_by_key(key(1)).unwrap().identity, cid("b"));
        assert_eq!(mgr.identities(), vec![cid("b")]);
    }

    #[test]
    fn test_rebind_unbound_session_binds_it() {
        let mgr = SessionManager::new();
        mgr.save(key(1));

        assert_eq!(mgr.rebind(key(1), cid("a")).unwrap(), cid("a"));
        assert_eq!(mgr.get_by_id(&cid("a")).unwrap().key, key(1));
    }

    #[test]
    fn test_rebind_unknown_key_returns_no_session() {
        let mgr = SessionManager::new();
        assert!(matches!(
            mgr.rebind(key(3), cid("a")),
            Err(SessionError::NoSession(k)) if k == key(3)
        ));
    }

    // =====================================================================
    // delete()
    // =====================================================================

    #[test]
    fn test_delete_removes_both_indices() {
        let mgr = SessionManager::new();
        mgr.save(key(1));
        mgr.bind(key(1), cid("a")).unwrap();

        let removed = mgr.delete(key(1)).expect("existed");
        assert_eq!(removed.identity, cid("a"));
        assert!(mgr.get_by_key(key(1)).is_none());
        assert!(mgr.get_by_id(&cid("a")).is_none());
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_delete_unknown_key_is_none() {
        let mgr = SessionManager::new();
        assert!(mgr.delete(key(1)).is_none());
    }

    // =====================================================================
    // streams
    // =====================================================================

    #[test]
    fn test_update_stream_without_session_fails() {
        let mgr = SessionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            mgr.update_stream(key(1), StreamHandle::new(tx)),
            Err(SessionError::NoSession(_))
        ));
    }

    #[test]
    fn test_push_reaches_attached_stream() {
        let mgr = SessionManager::new();
        mgr.save(key(1));
        mgr.bind(key(1), cid("a")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mgr.update_stream(key(1), StreamHandle::new(tx)).unwrap();

        let msg = StreamMessage::new(StreamProcedure::Message, b"hi".to_vec());
        mgr.push(&cid("a"), msg.clone()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), msg);
    }

    #[test]
    fn test_push_error_cases() {
        let mgr = SessionManager::new();
        let msg = StreamMessage::new(StreamProcedure::Message, vec![]);
        assert!(matches!(
            mgr.push(&cid("a"), msg.clone()),
            Err(SessionError::UnknownIdentity(_))
        ));

        mgr.save(key(1));
        mgr.bind(key(1), cid("a")).unwrap();
        assert!(matches!(
            mgr.push(&cid("a"), msg.clone()),
            Err(SessionError::NoStream(_))
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        mgr.update_stream(key(1), StreamHandle::new(tx)).unwrap();
        drop(rx);
        assert!(matches!(
            mgr.push(&cid("a"), msg.clone()),
            Err(SessionError::StreamClosed(_))
        ));

        mgr.clear_stream(key(1));
        assert!(matches!(mgr.push(&cid("a"), msg), Err(SessionError::NoStream(_))));
    }

    #[test]
    fn test_generate_identity_is_32_hex_and_unique() {
        let a = generate_identity();
        let b = generate_identity();
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
