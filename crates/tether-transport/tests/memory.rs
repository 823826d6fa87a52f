//! Integration tests for the in-memory transport.

use tether_transport::{Connection, Dialer, MemoryTransport, Transport, TransportError};

#[tokio::test]
async fn test_messages_flow_both_ways() {
    let (mut transport, dialer) = MemoryTransport::new();
    let client = dialer.connect().await.expect("should dial");
    let server = transport.accept().await.expect("should accept");

    client.send(b"hello").await.unwrap();
    server.send(b"world").await.unwrap();

    assert_eq!(server.recv().await.unwrap(), Some(b"hello".to_vec()));
    assert_eq!(client.recv().await.unwrap(), Some(b"world".to_vec()));
    assert_ne!(client.id(), server.id());
}

#[tokio::test]
async fn test_close_is_seen_by_peer() {
    let (mut transport, dialer) = MemoryTransport::new();
    let client = dialer.connect().await.unwrap();
    let server = transport.accept().await.unwrap();

    client.close().await.unwrap();

    assert_eq!(server.recv().await.unwrap(), None);
    assert!(matches!(
        server.send(b"late").await,
        Err(TransportError::ConnectionClosed(_))
    ));
}

#[tokio::test]
async fn test_sever_all_closes_both_ends_and_allows_redial() {
    let (mut transport, dialer) = MemoryTransport::new();
    let client = dialer.connect().await.unwrap();
    let server = transport.accept().await.unwrap();

    let pending = tokio::spawn(async move { client.recv().await });
    dialer.sever_all();

    assert_eq!(pending.await.unwrap().unwrap(), None);
    assert_eq!(server.recv().await.unwrap(), None);

    let again = dialer.connect().await.expect("redial should work");
    let accepted = transport.accept().await.unwrap();
    again.send(b"back").await.unwrap();
    assert_eq!(accepted.recv().await.unwrap(), Some(b"back".to_vec()));
}

#[tokio::test]
async fn test_dial_after_transport_dropped_fails() {
    let (transport, dialer) = MemoryTransport::new();
    drop(transport);
    assert!(matches!(
        dialer.connect().await,
        Err(TransportError::ConnectFailed(_))
    ));
}
