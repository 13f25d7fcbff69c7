//! Integration tests for connection and session lifecycle.
//!
//! These tests start a real server and exercise joining, admission
//! limits, protocol-level edge cases, and session teardown.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tabula_collab::client::{ClientEvent, CollabClient};
use tabula_collab::protocol::{CellRef, ClientMessage, ServerMessage};
use tabula_collab::server::{CollabServer, ServerConfig};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server allowing `max_conns` connections per dataset.
async fn start_server_with(max_conns: usize) -> (u16, Arc<CollabServer>) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_conns_per_dataset: max_conns,
        broadcast_capacity: 64,
    };
    let server = Arc::new(CollabServer::new(config));
    let handle = server.clone();
    tokio::spawn(async move {
        handle.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, server)
}

async fn start_test_server() -> (u16, Arc<CollabServer>) {
    start_server_with(10).await
}

/// Connect a client and wait until it is admitted to `dataset`.
async fn join_client(
    port: u16,
    dataset: &str,
) -> (CollabClient, mpsc::Receiver<ClientEvent>, Uuid) {
    let url = format!("ws://127.0.0.1:{port}");
    let mut client = CollabClient::new(dataset, "ticket", &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ClientEvent::Joined { conn })) => (client, events, conn),
        other => panic!("Expected Joined event, got {other:?}"),
    }
}

/// Read frames until the next binary protocol message.
async fn recv_server_msg(ws: &mut WsStream) -> ServerMessage {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no reply within timeout")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Binary(data) = msg {
            let bytes: Vec<u8> = data.into();
            return ServerMessage::decode(&bytes).unwrap();
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (port, _server) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_joins_and_gets_identity() {
    let (port, server) = start_test_server().await;
    let (client, _events, conn) = join_client(port, "ds1").await;

    assert_eq!(client.conn_id().await, Some(conn));
    assert!(server.registry().get("ds1").unwrap().has_member(&conn));
}

#[tokio::test]
async fn test_two_clients_same_dataset() {
    let (port, server) = start_test_server().await;
    let (_a, _events_a, a_id) = join_client(port, "ds1").await;
    let (_b, _events_b, b_id) = join_client(port, "ds1").await;

    assert_ne!(a_id, b_id);
    assert_eq!(server.registry().get("ds1").unwrap().member_count(), 2);

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.active_sessions, 1);
}

#[tokio::test]
async fn test_session_full_rejected() {
    let (port, server) = start_server_with(1).await;
    let (_a, _events_a, _) = join_client(port, "ds1").await;

    let url = format!("ws://127.0.0.1:{port}");
    let mut late = CollabClient::new("ds1", "ticket", &url);
    let mut events = late.take_event_rx().unwrap();
    late.connect().await.unwrap();

    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ClientEvent::Denied { reason })) => {
            assert_eq!(reason, "dataset session is full");
        }
        other => panic!("Expected Denied, got {other:?}"),
    }

    assert_eq!(server.stats().await.denied_joins, 1);
    assert_eq!(server.registry().get("ds1").unwrap().member_count(), 1);
}

#[tokio::test]
async fn test_empty_dataset_join_denied() {
    let (port, _server) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let mut client = CollabClient::new("", "ticket", &url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ClientEvent::Denied { reason })) => {
            assert_eq!(reason, "dataset name is empty");
        }
        other => panic!("Expected Denied, got {other:?}"),
    }
}

#[tokio::test]
async fn test_lock_before_join_rejected() {
    let (port, _server) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let lock = ClientMessage::Lock {
        cell: CellRef::new("ds1", "doc1", "price"),
    };
    ws.send(Message::Binary(lock.encode().unwrap().into()))
        .await
        .unwrap();

    match recv_server_msg(&mut ws).await {
        ServerMessage::LockReply { granted, revoked } => {
            assert!(!granted);
            assert_eq!(revoked, None);
        }
        other => panic!("Expected LockReply, got {other:?}"),
    }
    assert_eq!(_server.coordinator().locked_count().await, 0);
}

#[tokio::test]
async fn test_second_join_denied_but_connection_survives() {
    let (port, _server) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let join = ClientMessage::Join {
        dataset: "ds1".to_string(),
        ticket: "ticket".to_string(),
    };
    ws.send(Message::Binary(join.encode().unwrap().into()))
        .await
        .unwrap();
    match recv_server_msg(&mut ws).await {
        ServerMessage::Joined { .. } => {}
        other => panic!("Expected Joined, got {other:?}"),
    }

    let rejoin = ClientMessage::Join {
        dataset: "ds2".to_string(),
        ticket: "ticket".to_string(),
    };
    ws.send(Message::Binary(rejoin.encode().unwrap().into()))
        .await
        .unwrap();
    match recv_server_msg(&mut ws).await {
        ServerMessage::Denied { reason } => assert_eq!(reason, "already joined"),
        other => panic!("Expected Denied, got {other:?}"),
    }

    // The original membership still works.
    let lock = ClientMessage::Lock {
        cell: CellRef::new("ds1", "doc1", "price"),
    };
    ws.send(Message::Binary(lock.encode().unwrap().into()))
        .await
        .unwrap();
    match recv_server_msg(&mut ws).await {
        ServerMessage::LockReply { granted, .. } => assert!(granted),
        other => panic!("Expected LockReply, got {other:?}"),
    }
}

#[tokio::test]
async fn test_ws_ping_pong() {
    let (port, _server) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(Message::Ping(vec![1, 2, 3].into())).await.unwrap();

    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no pong within timeout")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Pong(data) = msg {
            let bytes: Vec<u8> = data.into();
            assert_eq!(bytes, vec![1, 2, 3]);
            break;
        }
    }
}

#[tokio::test]
async fn test_session_reclaimed_after_abort() {
    let (port, server) = start_test_server().await;
    let (mut a, mut _events_a, _) = join_client(port, "ds1").await;

    a.lock(&CellRef::new("ds1", "doc1", "price")).await.unwrap();
    let _ = timeout(Duration::from_secs(2), _events_a.recv()).await;

    a.abort().await;

    // The server notices the dead socket, releases the lock, and drops
    // the now-empty session.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if server.registry().session_count() == 0
            && server.coordinator().locked_count().await == 0
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "server never reclaimed the session"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stats = server.stats().await;
    assert_eq!(stats.active_connections, 0);
}

#[tokio::test]
async fn test_session_recreated_after_last_client_leaves() {
    let (port, server) = start_test_server().await;

    // The sole member leaves; the server prunes the session.
    let (mut a, mut _events_a, _) = join_client(port, "ds1").await;
    a.disconnect().await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while server.registry().session_count() > 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "server never pruned the empty session"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Immediate rejoiners must land in a live session and see each
    // other's lock traffic.
    let (_b, mut events_b, _) = join_client(port, "ds1").await;
    let (c, mut events_c, _) = join_client(port, "ds1").await;

    let cell = CellRef::new("ds1", "doc1", "price");
    c.lock(&cell).await.unwrap();
    match timeout(Duration::from_secs(2), events_c.recv()).await {
        Ok(Some(ClientEvent::LockResult { granted, .. })) => assert!(granted),
        other => panic!("Expected LockResult, got {other:?}"),
    }
    match timeout(Duration::from_secs(2), events_b.recv()).await {
        Ok(Some(ClientEvent::CellLocked { cell: locked })) => assert_eq!(locked, cell),
        other => panic!("Expected CellLocked, got {other:?}"),
    }
}
