//! Integration tests for the /websocket endpoint: auth, fan-out, replacement and cleanup.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use huddle_server::chat::Dispatcher;
use huddle_server::store::MemoryStore;
use huddle_server::ws::{ConnectionRegistry, ScopeIndex, SessionSettings};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    registry: ConnectionRegistry,
    store: Arc<MemoryStore>,
    _shutdown: tokio_util::sync::DropGuard,
}

/// Helper: start the server on a random port with the demo store.
///
/// Demo layout: channels 1, 2 belong to server 1 and 3, 4 to server 2.
/// User 1 is in both servers, user 2 only in server 1, user 3 only in server 2.
async fn start_test_server() -> TestServer {
    let store = Arc::new(MemoryStore::demo());
    let (registry, intake) =
        ConnectionRegistry::new(SessionSettings::default(), 100, ScopeIndex::new());

    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(registry.clone(), store.clone());
    tokio::spawn(dispatcher.run(intake, shutdown.clone()));

    let state = huddle_server::state::AppState {
        registry: registry.clone(),
        membership: store.clone(),
        auth: store.clone(),
    };

    let app = huddle_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        registry,
        store,
        _shutdown: shutdown.drop_guard(),
    }
}

async fn connect_as(addr: SocketAddr, user_id: u64) -> WsStream {
    let url = format!("ws://{}/websocket?token=demo-token-{}", addr, user_id);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream
}

/// Sessions register after the upgrade completes; wait for the count to settle.
async fn wait_for_sessions(registry: &ConnectionRegistry, expected: usize) {
    for _ in 0..200 {
        if registry.len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} sessions, registry has {}",
        expected,
        registry.len()
    );
}

fn chat(channel_id: i64, message: &str) -> Message {
    Message::Text(
        json!({
            "message_type": "channel_message",
            "payload": { "channel_id": channel_id, "message": message },
        })
        .to_string()
        .into(),
    )
}

async fn next_json(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Expected message within timeout")
            .expect("Stream ended")
            .expect("WebSocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected text message, got: {:?}", other),
        }
    }
}

async fn assert_silent(ws: &mut WsStream) {
    let result = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(result.is_err(), "Expected no message, got: {:?}", result);
}

async fn expect_close(ws: &mut WsStream) -> Option<CloseCode> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Expected close within timeout");
        match msg {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| f.code),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("Expected close, got: {:?}", other),
            Some(Err(_)) | None => return None,
        }
    }
}

#[tokio::test]
async fn test_ws_rejects_missing_token() {
    let server = start_test_server().await;

    let url = format!("ws://{}/websocket", server.addr);
    match tokio_tungstenite::connect_async(&url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("Expected 401, got: {:?}", other.map(|_| ())),
    }
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn test_ws_rejects_unknown_token() {
    let server = start_test_server().await;

    let url = format!("ws://{}/websocket?token=not-a-session", server.addr);
    match tokio_tungstenite::connect_async(&url).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("Expected 401, got: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_ws_accepts_token_cookie() {
    let server = start_test_server().await;

    let mut request = format!("ws://{}/websocket", server.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Cookie", "token=demo-token-2".parse().unwrap());

    let (_ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("Cookie auth should upgrade");

    wait_for_sessions(&server.registry, 1).await;
    assert!(server.registry.session_of_user(2).is_some());
}

#[tokio::test]
async fn test_ws_fan_out_respects_server_membership() {
    let server = start_test_server().await;
    let mut user1 = connect_as(server.addr, 1).await;
    let mut user2 = connect_as(server.addr, 2).await;
    let mut user3 = connect_as(server.addr, 3).await;
    wait_for_sessions(&server.registry, 3).await;

    // Channel 1 belongs to server 1: users 1 and 2 only.
    user2.send(chat(1, "hello server one")).await.unwrap();

    for ws in [&mut user1, &mut user2] {
        let value = next_json(ws).await;
        assert_eq!(value["message_type"], "message");
        assert_eq!(value["payload"]["userid"], 2);
        assert_eq!(value["payload"]["channelid"], 1);
        assert_eq!(value["payload"]["serverid"], 1);
        assert_eq!(value["payload"]["message"], "hello server one");
        assert!(value["payload"]["messageid"].as_u64().unwrap() > 0);
        assert!(value["payload"]["date"].is_string());
    }
    assert_silent(&mut user3).await;
}

#[tokio::test]
async fn test_ws_invalid_messages_keep_connection_open() {
    let server = start_test_server().await;
    let mut user1 = connect_as(server.addr, 1).await;
    wait_for_sessions(&server.registry, 1).await;

    user1.send(Message::Text("not json".into())).await.unwrap();
    user1.send(chat(0, "no channel")).await.unwrap();
    user1.send(chat(1, &"x".repeat(1001))).await.unwrap();
    user1
        .send(Message::Text(json!({"message_type": "typing"}).to_string().into()))
        .await
        .unwrap();
    assert_silent(&mut user1).await;
    assert_eq!(server.store.add_message_calls(), 0);

    // Still connected and delivering.
    user1.send(chat(3, "still here")).await.unwrap();
    let value = next_json(&mut user1).await;
    assert_eq!(value["payload"]["message"], "still here");
    assert_eq!(value["payload"]["serverid"], 2);
}

#[tokio::test]
async fn test_ws_ping_pong() {
    let server = start_test_server().await;
    let mut ws = connect_as(server.addr, 1).await;
    wait_for_sessions(&server.registry, 1).await;

    ws.send(Message::Ping(vec![42, 43, 44].into()))
        .await
        .expect("Failed to send ping");

    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("Expected pong within timeout");
    match msg {
        Some(Ok(Message::Pong(data))) => {
            assert_eq!(data.as_ref(), &[42, 43, 44], "Pong data should match ping");
        }
        other => panic!("Expected Pong message, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_ws_second_connection_replaces_first() {
    let server = start_test_server().await;
    let mut first = connect_as(server.addr, 2).await;
    wait_for_sessions(&server.registry, 1).await;
    let first_id = server.registry.session_of_user(2).unwrap();

    let mut second = connect_as(server.addr, 2).await;
    for _ in 0..200 {
        if server.registry.session_of_user(2).as_ref() != Some(&first_id) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(expect_close(&mut first).await, Some(CloseCode::Away));
    wait_for_sessions(&server.registry, 1).await;

    second.send(chat(1, "only once")).await.unwrap();
    let value = next_json(&mut second).await;
    assert_eq!(value["payload"]["message"], "only once");
}

#[tokio::test]
async fn test_ws_membership_failure_closes_with_internal_error() {
    let server = start_test_server().await;
    server.store.fail_membership(true);

    let mut ws = connect_as(server.addr, 1).await;
    assert_eq!(expect_close(&mut ws).await, Some(CloseCode::Error));
    assert!(server.registry.is_empty());
}

#[tokio::test]
async fn test_ws_connection_cleanup_on_disconnect() {
    let server = start_test_server().await;
    let mut ws = connect_as(server.addr, 3).await;
    wait_for_sessions(&server.registry, 1).await;
    assert_eq!(server.registry.scopes().members_of(2).len(), 1);

    ws.close(None).await.expect("Failed to close");
    drop(ws);

    wait_for_sessions(&server.registry, 0).await;
    assert!(server.registry.scopes().members_of(2).is_empty());
    assert_eq!(server.registry.session_of_user(3), None);
}

#[tokio::test]
async fn test_health_reports_sessions() {
    let server = start_test_server().await;
    let _ws = connect_as(server.addr, 1).await;
    wait_for_sessions(&server.registry, 1).await;

    let body: serde_json::Value = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 1);
    assert_eq!(body["scopes"], 2);
}
