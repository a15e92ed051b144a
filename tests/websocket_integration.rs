//! Integration tests for the gateway
//!
//! These tests spin up a real gateway on an ephemeral port and talk to it with
//! a standard WebSocket client, verifying the full flow: handshake → welcome →
//! auth / join → notification fan-out → disconnect cleanup.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use gateway::prelude::*;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Helper: start a gateway and return (address, registry, event bus)
async fn start_test_server() -> (SocketAddr, Arc<SessionRegistry>, EventBus) {
    let config = GatewayConfig {
        port: 0,
        ..Default::default()
    };
    let gateway = Gateway::bind(config).await.unwrap();
    let addr = gateway.local_addr().unwrap();
    let registry = gateway.registry();
    let bus = gateway.event_bus();

    tokio::spawn(async move {
        gateway.run().await.unwrap();
    });

    (addr, registry, bus)
}

/// Helper: connect and return the welcome message + stream halves
async fn ws_connect(addr: SocketAddr) -> (Value, WsWrite, WsRead) {
    let url = format!("ws://{}/", addr);
    let (ws_stream, _) = connect_async(&url).await.expect("Failed to connect");
    let (write, mut read) = ws_stream.split();

    let welcome = ws_recv(&mut read).await;
    assert_eq!(welcome["type"], "connection");
    assert!(welcome["connection_id"].is_string());

    (welcome, write, read)
}

/// Helper: send a JSON message over WS
async fn ws_send(write: &mut WsWrite, msg: &Value) {
    let text = serde_json::to_string(msg).unwrap();
    write.send(Message::Text(text.into())).await.unwrap();
}

/// Helper: receive next JSON message from WS (with timeout)
async fn ws_recv(read: &mut WsRead) -> Value {
    let msg = timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Timeout waiting for WS message")
        .expect("Stream ended")
        .expect("WS error");

    match msg {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("Expected text message, got {:?}", other),
    }
}

/// Helper: assert nothing arrives for a short while
async fn ws_expect_silence(read: &mut WsRead) {
    let result = timeout(Duration::from_millis(200), read.next()).await;
    assert!(result.is_err(), "Expected no message, got {:?}", result);
}

/// Helper: wait until the registry reaches `expected` connections
async fn wait_for_connections(registry: &SessionRegistry, expected: usize) {
    for _ in 0..100 {
        if registry.connection_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "registry has {} connections, expected {}",
        registry.connection_count().await,
        expected
    );
}

// === Tests ===

#[tokio::test]
async fn test_ws_connect_and_welcome() {
    let (addr, registry, _bus) = start_test_server().await;
    let (welcome, _write, _read) = ws_connect(addr).await;

    let conn_id = welcome["connection_id"].as_str().unwrap();
    assert!(conn_id.starts_with("conn_"));
    assert!(welcome["timestamp"].is_string());
    assert_eq!(registry.connection_count().await, 1);
}

#[tokio::test]
async fn test_ws_ping_pong() {
    let (addr, _registry, _bus) = start_test_server().await;
    let (_welcome, mut write, mut read) = ws_connect(addr).await;

    ws_send(&mut write, &json!({"type": "ping"})).await;

    let pong = ws_recv(&mut read).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].is_string());
}

#[tokio::test]
async fn test_ws_auth() {
    let (addr, registry, _bus) = start_test_server().await;
    let (_welcome, mut write, mut read) = ws_connect(addr).await;

    ws_send(&mut write, &json!({"type": "auth", "user_id": "42", "token": "abc"})).await;
    let reply = ws_recv(&mut read).await;
    assert_eq!(reply["type"], "auth_success");
    assert_eq!(reply["user_id"], "42");
    assert!(registry.lookup_user("42").await.is_some());

    ws_send(&mut write, &json!({"type": "auth", "user_id": "43"})).await;
    let reply = ws_recv(&mut read).await;
    assert_eq!(reply["type"], "auth_error");

    // Still usable after an auth error
    ws_send(&mut write, &json!({"type": "ping"})).await;
    assert_eq!(ws_recv(&mut read).await["type"], "pong");
}

#[tokio::test]
async fn test_ws_unicast_delivery() {
    let (addr, _registry, _bus) = start_test_server().await;
    let (_wa, mut write_a, mut read_a) = ws_connect(addr).await;
    let (_wb, mut write_b, mut read_b) = ws_connect(addr).await;

    ws_send(&mut write_a, &json!({"type": "auth", "user_id": "42", "token": "t"})).await;
    assert_eq!(ws_recv(&mut read_a).await["type"], "auth_success");

    ws_send(
        &mut write_b,
        &json!({
            "type": "notification",
            "target_type": "user",
            "target_id": "42",
            "notification": {"msg": "hi"}
        }),
    )
    .await;

    let delivered = ws_recv(&mut read_a).await;
    assert_eq!(delivered["type"], "notification");
    assert_eq!(delivered["data"], json!({"msg": "hi"}));
    assert!(delivered["timestamp"].is_string());

    let ack = ws_recv(&mut read_b).await;
    assert_eq!(ack["type"], "notification_sent");
    assert_eq!(ack["target_type"], "user");
    assert_eq!(ack["target_id"], "42");
}

#[tokio::test]
async fn test_ws_project_broadcast() {
    let (addr, _registry, _bus) = start_test_server().await;
    let (_wa, mut write_a, mut read_a) = ws_connect(addr).await;
    let (_wb, mut write_b, mut read_b) = ws_connect(addr).await;
    let (_wc, mut write_c, mut read_c) = ws_connect(addr).await;
    let (_wd, _write_d, mut read_d) = ws_connect(addr).await;

    for (write, read) in [(&mut write_a, &mut read_a), (&mut write_b, &mut read_b)] {
        ws_send(write, &json!({"type": "join_project", "project_id": "P1"})).await;
        let joined = ws_recv(read).await;
        assert_eq!(joined["type"], "project_joined");
        assert_eq!(joined["project_id"], "P1");
    }

    ws_send(
        &mut write_c,
        &json!({
            "type": "notification",
            "target_type": "project",
            "target_id": "P1",
            "notification": {"title": "CR approved"}
        }),
    )
    .await;

    for read in [&mut read_a, &mut read_b] {
        let msg = ws_recv(read).await;
        assert_eq!(msg["type"], "project_notification");
        assert_eq!(msg["project_id"], "P1");
        assert_eq!(msg["data"]["title"], "CR approved");
    }

    assert_eq!(ws_recv(&mut read_c).await["type"], "notification_sent");
    ws_expect_silence(&mut read_d).await;
}

#[tokio::test]
async fn test_ws_duplicate_join_delivers_once() {
    let (addr, _registry, bus) = start_test_server().await;
    let (_w, mut write, mut read) = ws_connect(addr).await;

    for _ in 0..2 {
        ws_send(&mut write, &json!({"type": "join_project", "project_id": "P1"})).await;
        assert_eq!(ws_recv(&mut read).await["type"], "project_joined");
    }

    bus.publish(NotificationTarget::Project("P1".to_string()), json!({"n": 1}));

    assert_eq!(ws_recv(&mut read).await["type"], "project_notification");
    ws_expect_silence(&mut read).await;
}

#[tokio::test]
async fn test_ws_leave_project_stops_delivery() {
    let (addr, _registry, bus) = start_test_server().await;
    let (_w, mut write, mut read) = ws_connect(addr).await;

    ws_send(&mut write, &json!({"type": "join_project", "project_id": "P1"})).await;
    assert_eq!(ws_recv(&mut read).await["type"], "project_joined");
    ws_send(&mut write, &json!({"type": "leave_project", "project_id": "P1"})).await;
    assert_eq!(ws_recv(&mut read).await["type"], "project_left");

    bus.publish(NotificationTarget::Project("P1".to_string()), json!({}));
    ws_expect_silence(&mut read).await;
}

#[tokio::test]
async fn test_ws_malformed_json() {
    let (addr, registry, _bus) = start_test_server().await;
    let (_welcome, mut write, mut read) = ws_connect(addr).await;

    write
        .send(Message::Text("definitely not json".into()))
        .await
        .unwrap();

    let error = ws_recv(&mut read).await;
    assert_eq!(error["type"], "error");
    assert!(
        error["message"]
            .as_str()
            .unwrap()
            .contains("Invalid message")
    );
    ws_expect_silence(&mut read).await;

    assert_eq!(registry.user_count().await, 0);
    assert_eq!(registry.project_count().await, 0);
    assert_eq!(registry.connection_count().await, 1);
}

#[tokio::test]
async fn test_ws_unknown_type() {
    let (addr, _registry, _bus) = start_test_server().await;
    let (_welcome, mut write, mut read) = ws_connect(addr).await;

    ws_send(&mut write, &json!({"type": "subscribe", "filter": {}})).await;

    let error = ws_recv(&mut read).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["message"], "Unknown message type: subscribe");
}

#[tokio::test]
async fn test_ws_reauth_moves_user_to_latest_connection() {
    let (addr, registry, bus) = start_test_server().await;
    let (_w1, mut write_1, mut read_1) = ws_connect(addr).await;
    let (_w2, mut write_2, mut read_2) = ws_connect(addr).await;

    for (write, read) in [(&mut write_1, &mut read_1), (&mut write_2, &mut read_2)] {
        ws_send(write, &json!({"type": "auth", "user_id": 7, "token": "t"})).await;
        let reply = ws_recv(read).await;
        assert_eq!(reply["type"], "auth_success");
        assert_eq!(reply["user_id"], "7");
    }

    bus.publish(NotificationTarget::User("7".to_string()), json!({"to": "latest"}));

    assert_eq!(ws_recv(&mut read_2).await["data"]["to"], "latest");
    ws_expect_silence(&mut read_1).await;
    assert_eq!(registry.connection_count().await, 2);
}

#[tokio::test]
async fn test_ws_event_bus_unicast() {
    let (addr, _registry, bus) = start_test_server().await;
    let (_w, mut write, mut read) = ws_connect(addr).await;

    ws_send(&mut write, &json!({"type": "auth", "user_id": "99", "token": "t"})).await;
    assert_eq!(ws_recv(&mut read).await["type"], "auth_success");

    bus.publish(
        NotificationTarget::User("99".to_string()),
        json!({"change_request": 12, "status": "approved"}),
    );

    let msg = ws_recv(&mut read).await;
    assert_eq!(msg["type"], "notification");
    assert_eq!(msg["data"]["status"], "approved");
}

#[tokio::test]
async fn test_ws_disconnect_cleanup() {
    let (addr, registry, _bus) = start_test_server().await;
    let (_w, mut write, mut read) = ws_connect(addr).await;

    ws_send(&mut write, &json!({"type": "auth", "user_id": "42", "token": "t"})).await;
    ws_recv(&mut read).await;
    for project in ["P1", "P2"] {
        ws_send(&mut write, &json!({"type": "join_project", "project_id": project})).await;
        ws_recv(&mut read).await;
    }
    assert_eq!(registry.project_count().await, 2);

    write.send(Message::Close(None)).await.unwrap();
    drop(write);
    drop(read);

    wait_for_connections(&registry, 0).await;
    assert!(registry.lookup_user("42").await.is_none());
    assert!(registry.lookup_project("P1").await.is_empty());
    assert!(registry.lookup_project("P2").await.is_empty());
}

#[tokio::test]
async fn test_ws_large_message_roundtrip() {
    let (addr, _registry, _bus) = start_test_server().await;
    let (_wa, mut write_a, mut read_a) = ws_connect(addr).await;
    let (_wb, mut write_b, mut read_b) = ws_connect(addr).await;

    ws_send(&mut write_a, &json!({"type": "auth", "user_id": "big", "token": "t"})).await;
    ws_recv(&mut read_a).await;

    // Crosses the 64 KiB boundary in both directions
    let body = "x".repeat(70_000);
    ws_send(
        &mut write_b,
        &json!({
            "type": "notification",
            "target_type": "user",
            "target_id": "big",
            "notification": {"body": body}
        }),
    )
    .await;

    let msg = ws_recv(&mut read_a).await;
    assert_eq!(msg["data"]["body"].as_str().unwrap().len(), 70_000);
    assert_eq!(ws_recv(&mut read_b).await["type"], "notification_sent");
}

#[tokio::test]
async fn test_ws_shutdown_closes_clients_and_clears_registry() {
    let config = GatewayConfig {
        port: 0,
        ..Default::default()
    };
    let gateway = Gateway::bind(config).await.unwrap();
    let addr = gateway.local_addr().unwrap();
    let registry = gateway.registry();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(gateway.run_until(async {
        let _ = rx.await;
    }));

    let (_welcome, mut write, mut read) = ws_connect(addr).await;
    ws_send(&mut write, &json!({"type": "auth", "user_id": "42", "token": 1})).await;
    assert_eq!(ws_recv(&mut read).await["type"], "auth_success");

    tx.send(()).unwrap();

    let mut close_code = None;
    loop {
        match timeout(Duration::from_secs(2), read.next())
            .await
            .expect("Timeout waiting for close")
        {
            Some(Ok(Message::Close(frame))) => close_code = frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => {}
            Some(Err(_)) | None => break,
        }
    }
    assert_eq!(close_code, Some(1001));

    timeout(Duration::from_secs(2), handle)
        .await
        .expect("gateway should stop")
        .unwrap()
        .unwrap();
    assert_eq!(registry.connection_count().await, 0);
    assert!(registry.lookup_user("42").await.is_none());
}
