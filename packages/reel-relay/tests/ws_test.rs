//! Integration tests for the live channel, offline replay and the HTTP API.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use reel_core::storage::Database;
use reel_core::{CoreConfig, StaticDirectory};
use reel_relay::state::{AppState, RelayConfig};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsRead = SplitStream<WsStream>;
type WsWrite = SplitSink<WsStream, Message>;

/// Helper: start the server on a random port with workers running.
async fn start_test_server() -> (AppState, SocketAddr) {
    let db = Arc::new(Database::open(None).unwrap());
    let directory = StaticDirectory::new()
        .with_friends(1, 2)
        .with_group(500, &[1, 2, 3])
        .with_profile(1, "ana");

    let config = RelayConfig {
        partitions: 2,
        drain_delay: Duration::from_millis(5),
        core: CoreConfig {
            poll_interval: Duration::from_millis(50),
            ..CoreConfig::default()
        },
        ..RelayConfig::default()
    };

    let state = AppState::new(config, db, Arc::new(directory)).unwrap();
    reel_relay::workers::spawn(&state);

    let app = reel_relay::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (state, addr)
}

async fn connect(state: &AppState, addr: SocketAddr, user: i64, device: &str) -> (WsWrite, WsRead) {
    let url = format!("ws://{}/ws?user_id={}&device={}", addr, user, device);
    let (stream, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .expect("Failed to connect WebSocket");

    wait_until(|| state.connections.is_online(user)).await;
    stream.split()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    panic!("Condition not met in time");
}

/// Read frames until one with `action` arrives.
async fn next_frame(read: &mut WsRead, action: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let msg = tokio::time::timeout_at(deadline, read.next())
            .await
            .unwrap_or_else(|_| panic!("No {} frame in time", action))
            .expect("Stream ended")
            .expect("WebSocket error");

        if let Message::Text(text) = msg {
            for line in text.split('\n') {
                let frame: Value = serde_json::from_str(line).unwrap();
                if frame["action"] == action {
                    return frame;
                }
            }
        }
    }
}

/// Collect `count` frames with `action`, keeping batch order.
async fn collect_frames(read: &mut WsRead, action: &str, count: usize) -> Vec<Value> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let mut frames = Vec::new();
    while frames.len() < count {
        let msg = tokio::time::timeout_at(deadline, read.next())
            .await
            .expect("Frames did not arrive in time")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            for line in text.split('\n') {
                let frame: Value = serde_json::from_str(line).unwrap();
                if frame["action"] == action {
                    frames.push(frame);
                }
            }
        }
    }
    frames
}

async fn post_message(addr: SocketAddr, from: i64, to: i64, client_msg_id: &str, text: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{}/api/messages", addr))
        .header("X-User-Id", from.to_string())
        .json(&json!({
            "target_id": to,
            "content": { "text": text },
            "client_msg_id": client_msg_id,
        }))
        .send()
        .await
        .unwrap()
}

async fn conversations(addr: SocketAddr, user: i64) -> Value {
    reqwest::Client::new()
        .get(format!("http://{}/api/conversations", addr))
        .header("X-User-Id", user.to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_health_and_stats() {
    let (_state, addr) = start_test_server().await;

    let health: Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["service"], "reel-relay");

    let stats: Value = reqwest::get(format!("http://{}/stats", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["online_users"], 0);
    assert_eq!(stats["consumer_lag"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_live_delivery_with_sender_profile() {
    let (state, addr) = start_test_server().await;
    let (_write, mut read) = connect(&state, addr, 2, "mobile").await;

    let resp = post_message(addr, 1, 2, "c-1", "hi").await;
    assert_eq!(resp.status(), 200);
    let receipt: Value = resp.json().await.unwrap();
    assert_eq!(receipt["outcome"], "published");

    let frame = next_frame(&mut read, "receive_message").await;
    assert_eq!(frame["clientMsgId"], "c-1");
    assert_eq!(frame["data"]["content"]["text"], "hi");
    assert_eq!(frame["data"]["sender"]["name"], "ana");
    assert_eq!(frame["data"]["id"], receipt["message_id"]);

    // Sender is offline: the delivered status waits in their buffer
    wait_until(|| state.offline.len(1) == 1).await;
}

#[tokio::test]
async fn test_offline_messages_replay_in_order() {
    let (state, addr) = start_test_server().await;

    for i in 0..3 {
        let resp = post_message(addr, 1, 2, &format!("c-{}", i), &format!("msg {}", i)).await;
        assert_eq!(resp.status(), 200);
    }
    wait_until(|| state.offline.len(2) == 3).await;

    let list = conversations(addr, 2).await;
    assert_eq!(list["conversations"][0]["unread_count"], 3);

    let (_write, mut read) = connect(&state, addr, 2, "mobile").await;
    let frames = collect_frames(&mut read, "receive_message", 3).await;
    let ids: Vec<&str> = frames.iter().map(|f| f["clientMsgId"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["c-0", "c-1", "c-2"]);

    wait_until(|| state.offline.len(2) == 0).await;

    // Replay does not mark anything read
    let list = conversations(addr, 2).await;
    assert_eq!(list["conversations"][0]["unread_count"], 3);

    let last_id = frames[2]["data"]["id"].as_i64().unwrap();
    let resp = reqwest::Client::new()
        .post(format!("http://{}/api/messages/read", addr))
        .header("X-User-Id", "2")
        .json(&json!({ "target_id": 1, "last_msg_id": last_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["updated"], 3);

    let list = conversations(addr, 2).await;
    assert_eq!(list["conversations"][0]["unread_count"], 0);
}

#[tokio::test]
async fn test_ws_send_ping_and_errors() {
    let (state, addr) = start_test_server().await;
    let (mut write, mut read) = connect(&state, addr, 1, "web").await;

    write
        .send(Message::Text(json!({ "action": "ping" }).to_string()))
        .await
        .unwrap();
    next_frame(&mut read, "pong").await;

    write
        .send(Message::Text(
            json!({
                "action": "send_message",
                "clientMsgId": "ws-1",
                "data": { "target_id": 2, "content": { "text": "yo" } },
            })
            .to_string(),
        ))
        .await
        .unwrap();
    let ack = next_frame(&mut read, "send_message").await;
    assert_eq!(ack["clientMsgId"], "ws-1");
    assert!(ack["data"]["message_id"].as_i64().unwrap() > 0);
    assert_eq!(ack["data"]["duplicate"], false);

    write
        .send(Message::Text(
            json!({
                "action": "send_message",
                "clientMsgId": "ws-2",
                "data": { "target_id": 9, "content": { "text": "stranger" } },
            })
            .to_string(),
        ))
        .await
        .unwrap();
    let err = next_frame(&mut read, "error").await;
    assert_eq!(err["clientMsgId"], "ws-2");
    assert_eq!(err["data"]["code"], 101);

    write.send(Message::Text("not json".into())).await.unwrap();
    let err = next_frame(&mut read, "error").await;
    assert_eq!(err["data"]["code"], 100);
}

#[tokio::test]
async fn test_http_error_mapping() {
    let (_state, addr) = start_test_server().await;
    let client = reqwest::Client::new();

    // No caller identity
    let resp = client
        .post(format!("http://{}/api/messages", addr))
        .json(&json!({ "target_id": 2, "content": { "text": "x" }, "client_msg_id": "a" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    // Not friends
    let resp = post_message(addr, 1, 9, "b", "x").await;
    assert_eq!(resp.status(), 403);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 101);

    // Empty text
    let resp = post_message(addr, 1, 2, "c", "").await;
    assert_eq!(resp.status(), 400);

    // Recall by someone else
    let receipt: Value = post_message(addr, 1, 2, "d", "mine").await.json().await.unwrap();
    let resp = client
        .post(format!("http://{}/api/messages/{}/recall", addr, receipt["message_id"]))
        .header("X-User-Id", "2")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    // Sender recalls, twice
    let recall_url = format!("http://{}/api/messages/{}/recall", addr, receipt["message_id"]);
    let resp = client.post(&recall_url).header("X-User-Id", "1").send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client.post(&recall_url).header("X-User-Id", "1").send().await.unwrap();
    assert_eq!(resp.status(), 409);

    // Group read marks are accepted and change nothing
    let resp = client
        .post(format!("http://{}/api/messages/read", addr))
        .header("X-User-Id", "2")
        .json(&json!({ "target_id": 500, "conversation_type": "group", "last_msg_id": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["updated"], 0);

    // Unknown conversation
    let resp = client
        .get(format!("http://{}/api/conversations/nope", addr))
        .header("X-User-Id", "2")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_history_and_conversation_settings() {
    let (state, addr) = start_test_server().await;
    let client = reqwest::Client::new();

    for i in 0..3 {
        post_message(addr, 1, 2, &format!("h-{}", i), "x").await;
    }
    wait_until(|| state.offline.len(2) == 3).await;

    let page: Value = client
        .get(format!("http://{}/api/messages?target_id=2&limit=2", addr))
        .header("X-User-Id", "1")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["messages"].as_array().unwrap().len(), 2);
    assert_eq!(page["has_more"], true);

    let list = conversations(addr, 1).await;
    let conversation_id = list["conversations"][0]["conversation_id"].as_str().unwrap().to_string();

    let resp = client
        .put(format!("http://{}/api/conversations/{}/pin", addr, conversation_id))
        .header("X-User-Id", "1")
        .json(&json!({ "pinned": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let view: Value = client
        .get(format!("http://{}/api/conversations/{}", addr, conversation_id))
        .header("X-User-Id", "1")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["is_pinned"], true);

    let resp = client
        .delete(format!("http://{}/api/conversations/{}", addr, conversation_id))
        .header("X-User-Id", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(conversations(addr, 1).await["total"], 0);
    assert_eq!(conversations(addr, 2).await["total"], 1);
}

#[tokio::test]
async fn test_presence_batch() {
    let (state, addr) = start_test_server().await;
    let (_write, _read) = connect(&state, addr, 2, "web").await;

    let body: Value = reqwest::get(format!("http://{}/api/presence?user_ids=2,3", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let statuses = body["statuses"].as_array().unwrap();
    assert_eq!(statuses[0]["user_id"], 2);
    assert_eq!(statuses[0]["online"], true);
    assert_eq!(statuses[0]["devices"], json!(["web"]));
    assert_eq!(statuses[1]["online"], false);

    let resp = reqwest::get(format!("http://{}/api/presence?user_ids=2,x", addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}
