use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use mcp_endpoint_relay::{
    auth::StaticTokenValidator,
    build_app,
    config::{DEFAULT_CALLER_PATH, DEFAULT_PROVIDER_PATH},
    relay::{Dispatcher, RelayConfig},
    AppState,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        protocol::frame::coding::CloseCode,
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SERVER_KEY: &str = "server-key+1";

async fn spawn_relay() -> (SocketAddr, Dispatcher) {
    let dispatcher = Dispatcher::new(RelayConfig::default());
    let state = AppState::new(
        dispatcher.clone(),
        Arc::new(StaticTokenValidator::new(SERVER_KEY, "default_agent")),
        DEFAULT_PROVIDER_PATH.to_string(),
        DEFAULT_CALLER_PATH.to_string(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, build_app(state))
            .await
            .expect("relay serve");
    });

    (addr, dispatcher)
}

async fn connect(addr: SocketAddr, path: &str, token: &str) -> Client {
    let url = format!("ws://{addr}{path}?token={token}");
    let (client, _) = connect_async(url).await.expect("websocket connect");
    client
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

async fn next_message(client: &mut Client) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame before deadline")
            .expect("socket still open")
            .expect("valid frame");
        if !matches!(message, Message::Ping(_) | Message::Pong(_)) {
            return message;
        }
    }
}

async fn recv_text(client: &mut Client) -> String {
    match next_message(client).await {
        Message::Text(text) => text.as_str().to_string(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn recv_json(client: &mut Client) -> Value {
    serde_json::from_str(&recv_text(client).await).expect("valid json frame")
}

async fn handshake(client: &mut Client) {
    send_json(
        client,
        json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {"protocolVersion": "2024-11-05", "capabilities": {}}
        }),
    )
    .await;
    let reply = recv_json(client).await;
    assert_eq!(reply["result"]["protocolVersion"], "2024-11-05");

    send_json(
        client,
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
    )
    .await;
}

async fn ready_provider(addr: SocketAddr, operation: &str) -> Client {
    let mut provider = connect(addr, DEFAULT_PROVIDER_PATH, SERVER_KEY).await;
    handshake(&mut provider).await;
    send_json(
        &mut provider,
        json!({
            "jsonrpc": "2.0",
            "id": "register",
            "method": "tools/register",
            "params": {"tools": [operation]}
        }),
    )
    .await;
    let reply = recv_json(&mut provider).await;
    assert_eq!(reply["result"]["bound"], json!([operation]));
    provider
}

async fn ready_caller(addr: SocketAddr) -> Client {
    let mut caller = connect(addr, DEFAULT_CALLER_PATH, SERVER_KEY).await;
    handshake(&mut caller).await;
    caller
}

#[tokio::test]
async fn wrong_token_gets_authentication_error_then_policy_close() {
    let (addr, dispatcher) = spawn_relay().await;
    let mut caller = connect(addr, DEFAULT_CALLER_PATH, "wrong").await;

    let reply = recv_json(&mut caller).await;
    assert_eq!(reply["id"], Value::Null);
    assert_eq!(reply["error"]["code"], -32004);
    assert_eq!(reply["error"]["message"], "Authentication error");

    match next_message(&mut caller).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected close frame, got {other:?}"),
    }
    assert_eq!(dispatcher.stats().registry.callers, 0);
}

#[tokio::test]
async fn bearer_header_is_accepted() {
    let (addr, _dispatcher) = spawn_relay().await;
    let mut request = format!("ws://{addr}{DEFAULT_CALLER_PATH}")
        .into_client_request()
        .expect("client request");
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {SERVER_KEY}")).expect("header value"),
    );
    let (mut caller, _) = connect_async(request).await.expect("websocket connect");

    send_json(&mut caller, json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).await;
    assert_eq!(
        recv_json(&mut caller).await,
        json!({"jsonrpc": "2.0", "id": 1, "result": {}})
    );
}

#[tokio::test]
async fn unbound_operation_reports_tool_not_connected() {
    let (addr, dispatcher) = spawn_relay().await;
    let mut caller = ready_caller(addr).await;

    send_json(
        &mut caller,
        json!({"jsonrpc": "2.0", "method": "get_weather", "params": {"city": "Beijing"}, "id": 1}),
    )
    .await;

    assert_eq!(
        recv_text(&mut caller).await,
        r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32001,"message":"Tool not connected"}}"#
    );
    assert_eq!(dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn request_round_trips_through_provider_with_original_id() {
    let (addr, dispatcher) = spawn_relay().await;
    let mut provider = ready_provider(addr, "get_weather").await;
    let mut caller = ready_caller(addr).await;

    send_json(
        &mut caller,
        json!({"jsonrpc": "2.0", "method": "get_weather", "params": {"city": "Beijing"}, "id": 1}),
    )
    .await;

    let forwarded = recv_json(&mut provider).await;
    assert_eq!(forwarded["method"], "get_weather");
    assert_eq!(forwarded["params"], json!({"city": "Beijing"}));
    assert_ne!(forwarded["id"], json!(1));

    send_json(
        &mut provider,
        json!({"jsonrpc": "2.0", "id": forwarded["id"], "result": {"temperature": 21}}),
    )
    .await;

    assert_eq!(
        recv_json(&mut caller).await,
        json!({"jsonrpc": "2.0", "id": 1, "result": {"temperature": 21}})
    );
    assert_eq!(dispatcher.pending_count(), 0);
}

#[tokio::test]
async fn provider_disconnect_fails_pending_request() {
    let (addr, dispatcher) = spawn_relay().await;
    let mut provider = ready_provider(addr, "get_weather").await;
    let mut caller = ready_caller(addr).await;

    send_json(
        &mut caller,
        json!({"jsonrpc": "2.0", "method": "get_weather", "id": "w-1"}),
    )
    .await;
    recv_json(&mut provider).await;

    provider.close(None).await.expect("close provider");

    let reply = recv_json(&mut caller).await;
    assert_eq!(reply["id"], "w-1");
    assert_eq!(reply["error"]["code"], -32003);
    assert_eq!(reply["error"]["data"]["operation"], "get_weather");

    let notice = recv_json(&mut caller).await;
    assert_eq!(notice["method"], "notifications/tools/list_changed");
    assert_eq!(dispatcher.pending_count(), 0);
}
