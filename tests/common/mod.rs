#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use codex_blocker::config::Config;
use codex_blocker::registry::SessionRegistry;
use codex_blocker::server::{self, ServerHandle, StartOptions};
use futures::StreamExt;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

pub const EXTENSION_ORIGIN: &str = "chrome-extension://testextensionid";
pub const TOKEN: &str = "test-token";

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Loopback config on an ephemeral port, with all state under `dir`.
pub fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        sessions_dir: dir.path().join("sessions"),
        token_path: dir.path().join("state/token"),
        ..Config::default()
    }
}

/// Start a server without the log tailer; tests drive the registry directly.
pub async fn start_without_tailer(config: &Config) -> ServerHandle {
    server::start(
        config,
        SessionRegistry::new(),
        StartOptions { start_tailer: false },
    )
    .await
    .expect("server failed to start")
}

pub async fn start_with_tailer(config: &Config) -> ServerHandle {
    server::start(
        config,
        SessionRegistry::with_session_timeout(config.session_timeout()),
        StartOptions::default(),
    )
    .await
    .expect("server failed to start")
}

/// Open the push channel as the extension would.
pub async fn connect_ws(addr: SocketAddr, token: &str) -> WsStream {
    let mut request = format!("ws://{addr}/ws?token={token}")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static(EXTENSION_ORIGIN));
    let (ws, _) = connect_async(request).await.expect("ws connect failed");
    ws
}

/// Receive the next text message and parse it as JSON.
pub async fn recv_json(ws: &mut WsStream) -> serde_json::Value {
    let deadline = Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("invalid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text message, got {:?}", other),
        }
    }
}

/// Read state messages until one satisfies `pred`.
pub async fn recv_state_until(
    ws: &mut WsStream,
    pred: impl Fn(&serde_json::Value) -> bool,
) -> serde_json::Value {
    let fut = async {
        loop {
            let msg = recv_json(ws).await;
            if msg["type"] == "state" && pred(&msg) {
                return msg;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("timeout waiting for matching state")
}

/// Receive frames until a close frame arrives; returns its code.
pub async fn recv_close_code(ws: &mut WsStream) -> Option<u16> {
    let fut = async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timeout waiting for close")
}

/// Authenticated GET with the extension origin.
pub async fn get_status(addr: SocketAddr, token: &str) -> reqwest::Response {
    reqwest::Client::new()
        .get(format!("http://{addr}/status"))
        .header("origin", EXTENSION_ORIGIN)
        .bearer_auth(token)
        .send()
        .await
        .expect("request failed")
}
