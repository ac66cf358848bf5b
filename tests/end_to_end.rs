//! Drives `ServerProtocol` over a real loopback TCP socket with a
//! `tokio-tungstenite` client, exercising the connect/authenticate/
//! add_filesystem flows without needing an actual kernel FUSE mount.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request as HttpRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use webmount::auth::AuthenticatorsBuilder;
use webmount::error::MountError;
use webmount::mount::{Mount, MountpointFactory};
use webmount::rpc::Proxy;
use webmount::ServerProtocol;

/// Stands in for `FuserMountpointFactory` in tests: tracks mounted names
/// without ever touching the kernel, and rejects a name already mounted
/// in this factory so "add the same filesystem twice" has somewhere to
/// fail (the session layer itself does not deduplicate -- see DESIGN.md).
#[derive(Default)]
struct FakeMountpointFactory {
    mounted: Mutex<HashSet<String>>,
}

impl MountpointFactory for FakeMountpointFactory {
    fn mount(&self, name: &str, _proxy: Proxy) -> Result<Mount, MountError> {
        let mut mounted = self.mounted.lock().unwrap();
        if !mounted.insert(name.to_string()) {
            return Err(MountError::Rejected(format!("{name} already mounted")));
        }
        Ok(Mount::new(()))
    }
}

async fn start_server(protocol: ServerProtocol) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let protocol = Arc::new(protocol);
    tokio::spawn(async move {
        let _ = protocol.run(listener).await;
    });
    addr
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: std::net::SocketAddr) -> WsStream {
    let request = HttpRequest::builder()
        .uri(format!("ws://{addr}/"))
        .header("Host", addr.to_string())
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", generate_key())
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Protocol", "fs")
        .body(())
        .unwrap();
    let (ws, _response) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws
}

async fn call(ws: &mut WsStream, method: &str, params: Value, id: i64) -> Value {
    let frame = json!({ "method": method, "params": params, "id": id }).to_string();
    ws.send(WsMessage::text(frame)).await.unwrap();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("response before timeout")
        {
            Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("connection closed while waiting for a response: {other:?}"),
        }
    }
}

#[tokio::test]
async fn add_filesystem_then_duplicate_is_rejected() {
    let authenticators = AuthenticatorsBuilder::new().allow_any("").build();
    let factory = Arc::new(FakeMountpointFactory::default());
    let protocol = ServerProtocol::new(authenticators, factory, Duration::from_secs(10));
    let addr = start_server(protocol).await;

    let mut ws = connect(addr).await;

    let first = call(&mut ws, "add_filesystem", json!(["docs"]), 1).await;
    assert_eq!(first["result"]["id"], "docs");

    let second = call(&mut ws, "add_filesystem", json!(["docs"]), 2).await;
    assert_eq!(second["error"]["code"], 1);
}

#[tokio::test]
async fn add_filesystem_without_authenticator_is_access_denied() {
    // No authenticators registered: the implicit anonymous grant on
    // connect fails, and nothing authenticates afterward either.
    let authenticators = AuthenticatorsBuilder::new().build();
    let factory = Arc::new(FakeMountpointFactory::default());
    let protocol = ServerProtocol::new(authenticators, factory, Duration::from_secs(10));
    let addr = start_server(protocol).await;

    let mut ws = connect(addr).await;
    let response = call(&mut ws, "add_filesystem", json!(["docs"]), 1).await;
    assert_eq!(response["error"]["code"], 3);
}

#[tokio::test]
async fn authenticate_then_add_filesystem_succeeds() {
    let authenticators = AuthenticatorsBuilder::new()
        .add("username", |c| {
            c.fields.get("password").and_then(|v| v.as_str()) == Some("secret")
        })
        .build();
    let factory = Arc::new(FakeMountpointFactory::default());
    let protocol = ServerProtocol::new(authenticators, factory, Duration::from_secs(10));
    let addr = start_server(protocol).await;

    let mut ws = connect(addr).await;

    let denied = call(&mut ws, "add_filesystem", json!(["docs"]), 1).await;
    assert_eq!(denied["error"]["code"], 3);

    let auth = call(
        &mut ws,
        "authenticate",
        json!(["username", {"username": "bob", "password": "secret"}]),
        2,
    )
    .await;
    assert!(auth.get("result").is_some());

    let granted = call(&mut ws, "add_filesystem", json!(["docs"]), 3).await;
    assert_eq!(granted["result"]["id"], "docs");
}

#[tokio::test]
async fn invalid_filesystem_name_is_bad_format() {
    let authenticators = AuthenticatorsBuilder::new().allow_any("").build();
    let factory = Arc::new(FakeMountpointFactory::default());
    let protocol = ServerProtocol::new(authenticators, factory, Duration::from_secs(10));
    let addr = start_server(protocol).await;

    let mut ws = connect(addr).await;
    let response = call(&mut ws, "add_filesystem", json!(["bad name!"]), 1).await;
    assert_eq!(response["error"]["code"], 2);
}

#[tokio::test]
async fn non_json_frame_is_dropped_and_connection_stays_usable() {
    let authenticators = AuthenticatorsBuilder::new().allow_any("").build();
    let factory = Arc::new(FakeMountpointFactory::default());
    let protocol = ServerProtocol::new(authenticators, factory, Duration::from_secs(10));
    let addr = start_server(protocol).await;

    let mut ws = connect(addr).await;
    ws.send(WsMessage::text("not json at all")).await.unwrap();

    // The bogus frame draws no response; the very next valid request
    // still gets answered, proving the session survived it.
    let response = call(&mut ws, "add_filesystem", json!(["docs"]), 1).await;
    assert_eq!(response["result"]["id"], "docs");
}

#[tokio::test]
async fn unknown_method_is_not_implemented() {
    let authenticators = AuthenticatorsBuilder::new().allow_any("").build();
    let factory = Arc::new(FakeMountpointFactory::default());
    let protocol = ServerProtocol::new(authenticators, factory, Duration::from_secs(10));
    let addr = start_server(protocol).await;

    let mut ws = connect(addr).await;
    let response = call(&mut ws, "frobnicate", json!([]), 1).await;
    assert_eq!(response["error"]["code"], 5);
}
