//! Integration tests for the WebSocket transport.
//!
//! These spin up a real listener on an OS-assigned port and dial it with
//! the WebSocket dialer.

#[cfg(feature = "websocket")]
mod websocket {
    use tether_transport::{Connection, Dialer, Transport, WebSocketDialer, WebSocketTransport};

    #[tokio::test]
    async fn test_websocket_accept_and_send_receive() {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0")
            .await
            .expect("should bind");
        let addr = transport.local_addr().expect("should have local addr");

        let server_handle =
            tokio::spawn(async move { transport.accept().await.expect("should accept") });

        let client = WebSocketDialer::new(format!("ws://{addr}"))
            .connect()
            .await
            .expect("client should connect");
        let server = server_handle.await.expect("task should complete");

        client.send(b"hello from client").await.unwrap();
        assert_eq!(
            server.recv().await.unwrap(),
            Some(b"hello from client".to_vec())
        );

        server.send(b"hello from server").await.unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            Some(b"hello from server".to_vec())
        );
    }

    #[tokio::test]
    async fn test_websocket_close_is_seen_by_peer() {
        let mut transport = WebSocketTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = transport.local_addr().unwrap();
        let server_handle = tokio::spawn(async move { transport.accept().await.unwrap() });

        let client = WebSocketDialer::new(format!("ws://{addr}"))
            .connect()
            .await
            .unwrap();
        let server = server_handle.await.unwrap();

        client.close().await.unwrap();
        assert_eq!(server.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dial_without_listener_fails() {
        let result = WebSocketDialer::new("ws://127.0.0.1:1").connect().await;
        assert!(result.is_err());
    }
}
