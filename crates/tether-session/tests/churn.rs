//! Session indices under concurrent connection churn.

use std::sync::Arc;

use tether_protocol::ClientId;
use tether_session::SessionManager;
use tether_transport::ConnectionId;

#[test]
fn test_racing_binds_leave_one_consistent_owner() {
    let mgr = Arc::new(SessionManager::new());
    let identity = ClientId::new("shared");
    let keys: Vec<ConnectionId> = (0..16).map(|_| ConnectionId::next()).collect();
    for key in &keys {
        mgr.save(*key);
    }

    let handles: Vec<_> = keys
        .iter()
        .map(|key| {
            let mgr = Arc::clone(&mgr);
            let key = *key;
            let identity = identity.clone();
            std::thread::spawn(move || mgr.bind(key, identity).unwrap())
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), identity);
    }

    // Exactly one session holds the identity, and the index points at it.
    let owner = mgr.get_by_id(&identity).expect("bound somewhere");
    let holders: Vec<_> = keys
        .iter()
        .filter(|k| mgr.get_by_key(**k).unwrap().identity == identity)
        .collect();
    assert_eq!(holders, vec![&owner.key]);
}

#[test]
fn test_connection_end_clears_both_lookups() {
    let mgr = SessionManager::new();
    let key = ConnectionId::next();
    mgr.save(key);
    let identity = tether_session::generate_identity();
    mgr.bind(key, identity.clone()).unwrap();

    mgr.delete(key);

    assert!(mgr.get_by_key(key).is_none());
    assert!(mgr.get_by_id(&identity).is_none());
    assert!(mgr.identities().is_empty());
}

#[test]
fn test_churn_across_threads_leaves_no_residue() {
    let mgr = Arc::new(SessionManager::new());
    let handles: Vec<_> = (0..8)
        .map(|t| {
            let mgr = Arc::clone(&mgr);
            std::thread::spawn(move || {
                for i in 0..100 {
                    let key = ConnectionId::next();
                    mgr.save(key);
                    mgr.bind(key, ClientId::new(format!("node-{t}-{}", i % 4))).unwrap();
                    mgr.delete(key);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(mgr.is_empty());
    assert!(mgr.identities().is_empty());
}
