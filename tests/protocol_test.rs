//! End-to-end protocol tests against a real server instance.
//!
//! Each test binds the router on an ephemeral port, connects with a plain
//! WebSocket client and speaks the JSON wire protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use collab_sync::auth::AllowAll;
use collab_sync::config::SyncConfig;
use collab_sync::server::{Hub, create_router};
use collab_sync::storage::MemoryStore;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> SocketAddr {
    spawn_server_with(SyncConfig::default()).await
}

async fn spawn_server_with(config: SyncConfig) -> SocketAddr {
    let hub = Hub::new(config, Arc::new(MemoryStore::new()), Arc::new(AllowAll));
    let app = create_router(hub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

async fn send(client: &mut Client, message: Value) {
    client
        .send(Message::Text(message.to_string()))
        .await
        .unwrap();
}

async fn recv(client: &mut Client) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for server frame")
        .expect("stream ended")
        .expect("websocket error");
    match frame {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected frame: {other:?}"),
    }
}

/// Receives frames until one matches the wanted type tag.
async fn recv_type(client: &mut Client, wanted: &str) -> Value {
    for _ in 0..10 {
        let message = recv(client).await;
        if message["type"] == wanted {
            return message;
        }
    }
    panic!("never received a {wanted} frame");
}

#[tokio::test]
async fn test_ping_pong() {
    let addr = spawn_server().await;
    let mut client = connect(addr).await;

    send(&mut client, json!({"type": "ping", "time": 12345})).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["type"], "pong");
    assert_eq!(reply["time"], 12345);
}

#[tokio::test]
async fn test_unknown_message_reports_error() {
    let addr = spawn_server().await;
    let mut client = connect(addr).await;

    send(&mut client, json!({"type": "frobnicate"})).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["type"], "error");
}

#[tokio::test]
async fn test_doc_save_and_get() {
    let addr = spawn_server().await;
    let mut client = connect(addr).await;

    send(
        &mut client,
        json!({
            "type": "doc_save",
            "collection": "notes",
            "docId": "1",
            "data": {"title": "hello", "count": 3}
        }),
    )
    .await;
    let saved = recv(&mut client).await;
    assert_eq!(saved["type"], "doc_created");
    assert_eq!(saved["version"], 1);

    send(
        &mut client,
        json!({"type": "doc_get", "collection": "notes", "docId": "1"}),
    )
    .await;
    let doc = recv(&mut client).await;
    assert_eq!(doc["type"], "doc");
    assert_eq!(doc["data"]["title"], "hello");
    assert_eq!(doc["data"]["count"], 3);

    // Saving again updates instead of creating.
    send(
        &mut client,
        json!({
            "type": "doc_save",
            "collection": "notes",
            "docId": "1",
            "data": {"title": "hello again"}
        }),
    )
    .await;
    let saved = recv(&mut client).await;
    assert_eq!(saved["type"], "doc_saved");
    assert_eq!(saved["version"], 2);
}

#[tokio::test]
async fn test_doc_get_missing() {
    let addr = spawn_server().await;
    let mut client = connect(addr).await;

    send(
        &mut client,
        json!({"type": "doc_get", "collection": "notes", "docId": "nope"}),
    )
    .await;
    let reply = recv(&mut client).await;
    assert_eq!(reply["type"], "doc_not_found");
}

#[tokio::test]
async fn test_op_broadcast_reaches_subscriber_not_sender() {
    let addr = spawn_server().await;
    let mut writer = connect(addr).await;
    let mut observer = connect(addr).await;

    send(&mut observer, json!({"type": "subscribe", "collection": "notes"})).await;
    assert_eq!(recv(&mut observer).await["type"], "subscribed");
    send(&mut writer, json!({"type": "subscribe", "collection": "notes"})).await;
    assert_eq!(recv(&mut writer).await["type"], "subscribed");

    let op = json!({
        "id": {"counter": 1, "replica": 900},
        "field": "title",
        "kind": "set",
        "value": "broadcast me",
        "stamp": {"millis": 1000, "replica": 900}
    });
    send(
        &mut writer,
        json!({"type": "op", "collection": "notes", "docId": "1", "op": op}),
    )
    .await;
    let ack = recv(&mut writer).await;
    assert_eq!(ack["type"], "op_ack");
    assert_eq!(ack["outcome"], "applied");

    let fanned = recv_type(&mut observer, "op_batch").await;
    assert_eq!(fanned["docId"], "1");
    assert_eq!(fanned["ops"][0]["value"], "broadcast me");
}

#[tokio::test]
async fn test_fanout_coalesces_rapid_writes_to_one_field() {
    // Size threshold of two so the batch leaves deterministically once a
    // second distinct key lands; the repeated title writes collapse first.
    let addr = spawn_server_with(SyncConfig {
        batch_max_ops: 2,
        batch_max_delay: Duration::from_secs(60),
        ..SyncConfig::default()
    })
    .await;
    let mut writer = connect(addr).await;
    let mut observer = connect(addr).await;

    send(&mut observer, json!({"type": "subscribe", "collection": "notes"})).await;
    assert_eq!(recv(&mut observer).await["type"], "subscribed");

    let set = |counter: u64, field: &str, value: &str| {
        json!({
            "id": {"counter": counter, "replica": 905},
            "field": field,
            "kind": "set",
            "value": value,
            "stamp": {"millis": 1000 + counter, "replica": 905}
        })
    };
    for op in [
        set(1, "title", "first"),
        set(2, "title", "second"),
        set(3, "body", "done"),
    ] {
        send(
            &mut writer,
            json!({"type": "op", "collection": "notes", "docId": "1", "op": op}),
        )
        .await;
        assert_eq!(recv(&mut writer).await["type"], "op_ack");
    }

    let fanned = recv_type(&mut observer, "op_batch").await;
    let ops = fanned["ops"].as_array().unwrap();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0]["field"], "title");
    assert_eq!(ops[0]["value"], "second");
    assert_eq!(ops[1]["field"], "body");
}

#[tokio::test]
async fn test_sync_request_returns_missed_operations() {
    let addr = spawn_server().await;
    let mut client = connect(addr).await;

    let op = json!({
        "id": {"counter": 1, "replica": 901},
        "field": "title",
        "kind": "set",
        "value": "missed",
        "stamp": {"millis": 1000, "replica": 901}
    });
    send(
        &mut client,
        json!({"type": "op", "collection": "notes", "docId": "1", "op": op}),
    )
    .await;
    assert_eq!(recv(&mut client).await["type"], "op_ack");

    // A client that has seen nothing asks for the difference.
    send(
        &mut client,
        json!({
            "type": "sync_request",
            "collection": "notes",
            "docId": "1",
            "since": {}
        }),
    )
    .await;
    let diff = recv(&mut client).await;
    assert_eq!(diff["type"], "sync_diff");
    assert_eq!(diff["ops"].as_array().unwrap().len(), 1);
    assert_eq!(diff["ops"][0]["value"], "missed");
}

#[tokio::test]
async fn test_op_batch_acks_each_operation() {
    let addr = spawn_server().await;
    let mut client = connect(addr).await;

    let ops = json!([
        {
            "id": {"counter": 1, "replica": 902},
            "field": "a",
            "kind": "set",
            "value": 1,
            "stamp": {"millis": 1000, "replica": 902}
        },
        {
            "id": {"counter": 2, "replica": 902},
            "field": "b",
            "kind": "set",
            "value": 2,
            "stamp": {"millis": 1001, "replica": 902}
        }
    ]);
    send(
        &mut client,
        json!({"type": "op_batch", "collection": "notes", "docId": "1", "ops": ops}),
    )
    .await;

    for counter in 1..=2 {
        let ack = recv(&mut client).await;
        assert_eq!(ack["type"], "op_ack");
        assert_eq!(ack["opId"]["counter"], counter);
        assert_eq!(ack["outcome"], "applied");
    }
}

#[tokio::test]
async fn test_op_batch_rejects_bad_member_continues() {
    let addr = spawn_server().await;
    let mut client = connect(addr).await;

    // The middle operation targets "a" with the wrong field kind; the ones
    // around it must still apply and ack.
    let ops = json!([
        {
            "id": {"counter": 1, "replica": 904},
            "field": "a",
            "kind": "set",
            "value": 1,
            "stamp": {"millis": 1000, "replica": 904}
        },
        {
            "id": {"counter": 2, "replica": 904},
            "field": "a",
            "kind": "text_insert",
            "origin": null,
            "ch": "x"
        },
        {
            "id": {"counter": 3, "replica": 904},
            "field": "b",
            "kind": "set",
            "value": 3,
            "stamp": {"millis": 1002, "replica": 904}
        }
    ]);
    send(
        &mut client,
        json!({"type": "op_batch", "collection": "notes", "docId": "1", "ops": ops}),
    )
    .await;

    let first = recv(&mut client).await;
    assert_eq!(first["type"], "op_ack");
    assert_eq!(first["opId"]["counter"], 1);

    let second = recv(&mut client).await;
    assert_eq!(second["type"], "op_rejected");
    assert_eq!(second["opId"]["counter"], 2);

    let third = recv(&mut client).await;
    assert_eq!(third["type"], "op_ack");
    assert_eq!(third["opId"]["counter"], 3);
    assert_eq!(third["outcome"], "applied");
}

#[tokio::test]
async fn test_presence_join_broadcast_and_leave() {
    let addr = spawn_server().await;
    let mut ada = connect(addr).await;
    let mut grace = connect(addr).await;

    send(
        &mut ada,
        json!({
            "type": "presence_join",
            "collection": "notes",
            "docId": "1",
            "user": {"name": "ada"}
        }),
    )
    .await;
    let joined = recv(&mut ada).await;
    assert_eq!(joined["type"], "presence_join_ok");
    assert_eq!(joined["users"].as_array().unwrap().len(), 1);

    send(
        &mut grace,
        json!({
            "type": "presence_join",
            "collection": "notes",
            "docId": "1",
            "user": {"name": "grace"}
        }),
    )
    .await;
    let joined = recv(&mut grace).await;
    assert_eq!(joined["type"], "presence_join_ok");
    assert_eq!(joined["users"].as_array().unwrap().len(), 2);

    // Ada hears about Grace arriving.
    let arrival = recv_type(&mut ada, "presence_joined").await;
    assert_eq!(arrival["session"]["user"]["name"], "grace");

    // Cursor moves fan out too.
    send(
        &mut grace,
        json!({
            "type": "presence_cursor",
            "collection": "notes",
            "docId": "1",
            "position": 4,
            "selection": [2, 4]
        }),
    )
    .await;
    let moved = recv_type(&mut ada, "presence_cursor_moved").await;
    assert_eq!(moved["cursor"]["position"], 4);

    send(
        &mut grace,
        json!({"type": "presence_leave", "collection": "notes", "docId": "1"}),
    )
    .await;
    let left = recv_type(&mut ada, "presence_left").await;
    assert_eq!(left["docId"], "1");

    send(
        &mut ada,
        json!({"type": "presence_get", "collection": "notes", "docId": "1"}),
    )
    .await;
    let users = recv_type(&mut ada, "presence_users").await;
    assert_eq!(users["count"], 1);
}

#[tokio::test]
async fn test_disconnect_broadcasts_presence_left() {
    let addr = spawn_server().await;
    let mut ada = connect(addr).await;
    let mut grace = connect(addr).await;

    send(
        &mut ada,
        json!({
            "type": "presence_join",
            "collection": "notes",
            "docId": "1",
            "user": {"name": "ada"}
        }),
    )
    .await;
    assert_eq!(recv(&mut ada).await["type"], "presence_join_ok");

    send(
        &mut grace,
        json!({
            "type": "presence_join",
            "collection": "notes",
            "docId": "1",
            "user": {"name": "grace"}
        }),
    )
    .await;
    assert_eq!(recv(&mut grace).await["type"], "presence_join_ok");
    recv_type(&mut ada, "presence_joined").await;

    drop(grace);
    let left = recv_type(&mut ada, "presence_left").await;
    assert_eq!(left["docId"], "1");
}

#[tokio::test]
async fn test_undo_redo_over_the_wire() {
    let addr = spawn_server().await;
    let mut client = connect(addr).await;

    let op = json!({
        "id": {"counter": 1, "replica": 903},
        "field": "title",
        "kind": "set",
        "value": "draft",
        "stamp": {"millis": 1000, "replica": 903}
    });
    send(
        &mut client,
        json!({"type": "op", "collection": "notes", "docId": "1", "op": op}),
    )
    .await;
    assert_eq!(recv(&mut client).await["type"], "op_ack");

    send(
        &mut client,
        json!({
            "type": "undo_capture",
            "collection": "notes",
            "docId": "1",
            "op": op,
            "previousValue": null
        }),
    )
    .await;
    let captured = recv(&mut client).await;
    assert_eq!(captured["type"], "undo_capture_ok");
    assert_eq!(captured["state"]["canUndo"], true);
    assert_eq!(captured["state"]["undoCount"], 1);

    // Undo of the first write removes the field.
    send(
        &mut client,
        json!({"type": "undo", "collection": "notes", "docId": "1"}),
    )
    .await;
    let undone = recv(&mut client).await;
    assert_eq!(undone["type"], "undo_ok");
    assert_eq!(undone["op"]["kind"], "remove");
    assert_eq!(undone["state"]["canRedo"], true);

    send(
        &mut client,
        json!({"type": "redo", "collection": "notes", "docId": "1"}),
    )
    .await;
    let redone = recv(&mut client).await;
    assert_eq!(redone["type"], "redo_ok");
    assert_eq!(redone["op"]["kind"], "set");
    assert_eq!(redone["op"]["value"], "draft");

    // Redo exhausted the stack.
    send(
        &mut client,
        json!({"type": "redo", "collection": "notes", "docId": "1"}),
    )
    .await;
    assert_eq!(recv(&mut client).await["type"], "redo_empty");
}

#[tokio::test]
async fn test_health_endpoint() {
    let addr = spawn_server().await;
    let body = reqwest_lite(addr, "/health").await;
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "ok");
}

/// Minimal HTTP GET over a raw TCP stream, enough for the health check.
async fn reqwest_lite(addr: SocketAddr, path: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_owned())
        .unwrap_or_default()
}
