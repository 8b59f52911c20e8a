mod helpers;

use futures_util::{SinkExt, StreamExt};
use helpers::{test_gateway, TestGateway};
use memgate::config::{GatewayConfig, ServerConfig};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server(tg: &TestGateway) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = memgate::api::router(tg.gateway.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr, query: &str) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/gateway/ws{query}"))
        .await
        .unwrap();
    client
}

/// Next text frame as JSON; `None` once the server closes.
async fn next_frame(client: &mut Client) -> Option<Value> {
    while let Some(message) = client.next().await {
        match message {
            Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::Text(frame.to_string())).await.unwrap();
}

#[tokio::test]
async fn call_before_authenticate_closes_the_connection() {
    let tg = test_gateway(GatewayConfig::default());
    let addr = spawn_server(&tg).await;
    let mut client = connect(addr, "").await;

    send(
        &mut client,
        json!({ "type": "call", "id": 1, "tool": "add_memory", "arguments": { "text": "sneaky" } }),
    )
    .await;

    let frame = next_frame(&mut client).await.unwrap();
    assert_eq!(frame["type"], "closing");
    assert_eq!(frame["code"], "invalid_credential");
    assert!(next_frame(&mut client).await.is_none());

    assert!(tg.engine.is_empty());
    assert_eq!(tg.access_log_count(), 0);
}

#[tokio::test]
async fn bad_api_key_is_rejected_at_open() {
    let tg = test_gateway(GatewayConfig::default());
    let addr = spawn_server(&tg).await;
    let mut client = connect(addr, "?api_key=sk-memgate-nope").await;

    let frame = next_frame(&mut client).await.unwrap();
    assert_eq!(frame["type"], "closing");
    assert_eq!(frame["code"], "invalid_credential");
}

#[tokio::test]
async fn calls_are_answered_in_order() {
    let tg = test_gateway(GatewayConfig::default());
    let (_, key) = tg.account_with_key("ws-user");
    let addr = spawn_server(&tg).await;
    let mut client = connect(addr, &format!("?api_key={key}&app=cursor")).await;

    let ready = next_frame(&mut client).await.unwrap();
    assert_eq!(ready["type"], "ready");
    assert_eq!(ready["user_id"], "ws-user");
    assert_eq!(ready["app_name"], "cursor");

    for id in 1..=3 {
        send(
            &mut client,
            json!({
                "type": "call",
                "id": id,
                "tool": "add_memory",
                "arguments": { "text": format!("fact number {id}") }
            }),
        )
        .await;
    }
    send(
        &mut client,
        json!({ "type": "call", "id": 4, "tool": "search_memory", "arguments": { "query": "fact" } }),
    )
    .await;

    let mut ids = Vec::new();
    for _ in 0..4 {
        let frame = next_frame(&mut client).await.unwrap();
        assert_eq!(frame["type"], "result", "{frame}");
        ids.push(frame["id"].as_i64().unwrap());
        if frame["id"] == 4 {
            assert_eq!(frame["result"]["results"].as_array().unwrap().len(), 3);
        } else {
            assert_eq!(frame["result"]["memory"]["state"], "active");
        }
    }
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(tg.access_log_count(), 4);
}

#[tokio::test]
async fn authenticate_frame_then_errors_keep_the_connection_open() {
    let tg = test_gateway(GatewayConfig::default());
    let (_, key) = tg.account_with_key("frame-user");
    let addr = spawn_server(&tg).await;
    let mut client = connect(addr, "").await;

    send(&mut client, json!({ "type": "authenticate", "api_key": key })).await;
    let ready = next_frame(&mut client).await.unwrap();
    assert_eq!(ready["type"], "ready");

    client
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();
    let frame = next_frame(&mut client).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "validation_error");

    send(
        &mut client,
        json!({ "type": "call", "id": "x", "tool": "forget_everything" }),
    )
    .await;
    let frame = next_frame(&mut client).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["id"], "x");
    assert_eq!(frame["retryable"], false);

    send(&mut client, json!({ "type": "ping", "nonce": 7 })).await;
    let frame = next_frame(&mut client).await.unwrap();
    assert_eq!(frame["type"], "pong");
    assert_eq!(frame["nonce"], 7);
}

#[tokio::test]
async fn engine_outage_is_a_retryable_error_frame() {
    let tg = test_gateway(GatewayConfig::default());
    let (_, key) = tg.account_with_key("outage-user");
    let addr = spawn_server(&tg).await;
    let mut client = connect(addr, &format!("?api_key={key}")).await;
    next_frame(&mut client).await.unwrap();

    tg.engine.set_unavailable(true);
    send(
        &mut client,
        json!({ "type": "call", "id": 1, "tool": "search_memory", "arguments": { "query": "x" } }),
    )
    .await;
    let frame = next_frame(&mut client).await.unwrap();
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "upstream_unavailable");
    assert_eq!(frame["retryable"], true);
    assert_eq!(tg.access_log_count(), 0);
}

#[tokio::test]
async fn idle_connection_is_closed() {
    let tg = test_gateway(GatewayConfig {
        server: ServerConfig {
            idle_timeout_secs: 1,
            ..ServerConfig::default()
        },
        ..GatewayConfig::default()
    });
    let (_, key) = tg.account_with_key("idle-user");
    let addr = spawn_server(&tg).await;
    let mut client = connect(addr, &format!("?api_key={key}")).await;
    assert_eq!(next_frame(&mut client).await.unwrap()["type"], "ready");

    let frame = tokio::time::timeout(Duration::from_secs(5), next_frame(&mut client))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame["type"], "closing");
    assert_eq!(frame["code"], "idle_timeout");
    assert!(next_frame(&mut client).await.is_none());
}

#[tokio::test]
async fn disconnect_skips_queued_calls() {
    let tg = test_gateway(GatewayConfig::default());
    let (_, key) = tg.account_with_key("leaving-user");
    let addr = spawn_server(&tg).await;
    let mut client = connect(addr, &format!("?api_key={key}")).await;
    assert_eq!(next_frame(&mut client).await.unwrap()["type"], "ready");

    tg.engine.set_delay(Duration::from_millis(500));
    for id in 1..=3 {
        send(
            &mut client,
            json!({
                "type": "call",
                "id": id,
                "tool": "add_memory",
                "arguments": { "text": format!("queued fact {id}") }
            }),
        )
        .await;
    }
    client.close(None).await.unwrap();

    // The first call was already running and completes; the rest never start
    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(tg.engine.len(), 1);
    assert_eq!(tg.access_log_count(), 1);
}
