//! End-to-end tests for the HTTP status endpoint and the `/ws` push channel
//! over a real TCP listener.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use codex_blocker::config::Config;
use codex_blocker::registry::{Activity, SessionRegistry};
use common::*;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn first_extension_request_establishes_token() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let handle = start_without_tailer(&config).await;
    let addr = handle.addr();

    let resp = get_status(addr, TOKEN).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["access-control-allow-origin"],
        EXTENSION_ORIGIN
    );
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        serde_json::json!({"blocked": true, "sessions": 0, "working": 0, "waitingForInput": 0})
    );

    let persisted = std::fs::read_to_string(&config.token_path).unwrap();
    assert_eq!(persisted, TOKEN);

    let resp = get_status(addr, "other-token").await;
    assert_eq!(resp.status(), 401);

    // Any source works once the token is known.
    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/status?token={TOKEN}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    handle.shutdown().await;
}

#[tokio::test]
async fn persisted_token_is_required_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    std::fs::create_dir_all(config.token_path.parent().unwrap()).unwrap();
    std::fs::write(&config.token_path, format!("{TOKEN}\n")).unwrap();

    let handle = start_without_tailer(&config).await;
    let addr = handle.addr();

    assert_eq!(get_status(addr, "fresh-token").await.status(), 401);
    assert_eq!(get_status(addr, TOKEN).await.status(), 200);

    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/status"))
        .header("x-codex-blocker-token", TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    handle.shutdown().await;
}

#[tokio::test]
async fn non_extension_origin_cannot_establish_token() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let handle = start_without_tailer(&config).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{}/status", handle.addr()))
        .header("origin", "https://example.com")
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    assert!(resp.headers().get("access-control-allow-origin").is_none());
    assert!(!config.token_path.exists());

    handle.shutdown().await;
}

#[tokio::test]
async fn unknown_route_returns_404_after_auth() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_without_tailer(&test_config(&dir)).await;
    let addr = handle.addr();
    assert_eq!(get_status(addr, TOKEN).await.status(), 200);

    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/nope"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    handle.shutdown().await;
}

#[tokio::test]
async fn push_channel_sends_initial_state_then_updates() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_without_tailer(&test_config(&dir)).await;
    let registry = handle.registry().clone();

    let mut ws = connect_ws(handle.addr(), TOKEN).await;
    let initial = recv_json(&mut ws).await;
    assert_eq!(initial["type"], "state");
    assert_eq!(initial["sessions"], 0);
    assert_eq!(initial["blocked"], true);

    registry.handle_activity(Activity::new("s1"));
    let update = recv_json(&mut ws).await;
    assert_eq!(update["type"], "state");
    assert_eq!(update["sessions"], 1);
    assert_eq!(update["working"], 1);
    assert_eq!(update["blocked"], false);

    registry.set_idle("s1", None);
    let update = recv_json(&mut ws).await;
    assert_eq!(update["working"], 0);
    assert_eq!(update["blocked"], true);

    handle.shutdown().await;
}

#[tokio::test]
async fn push_channel_answers_ping_and_ignores_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_without_tailer(&test_config(&dir)).await;

    let mut ws = connect_ws(handle.addr(), TOKEN).await;
    recv_json(&mut ws).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"subscribe"}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();

    let reply = recv_json(&mut ws).await;
    assert_eq!(reply, serde_json::json!({"type": "pong"}));

    handle.shutdown().await;
}

#[tokio::test]
async fn push_channel_requires_token() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_without_tailer(&test_config(&dir)).await;
    let addr = handle.addr();
    assert_eq!(get_status(addr, TOKEN).await.status(), 200);

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=wrong")).await;
    assert!(result.is_err());

    handle.shutdown().await;
}

#[tokio::test]
async fn fourth_connection_from_same_ip_is_closed_1013() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_without_tailer(&test_config(&dir)).await;
    let addr = handle.addr();

    let mut open = Vec::new();
    for _ in 0..3 {
        let mut ws = connect_ws(addr, TOKEN).await;
        recv_json(&mut ws).await;
        open.push(ws);
    }

    let mut extra = connect_ws(addr, TOKEN).await;
    assert_eq!(recv_close_code(&mut extra).await, Some(1013));

    // Releasing a slot admits a new connection.
    let mut first = open.remove(0);
    first.close(None).await.unwrap();
    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut replacement = connect_ws(addr, TOKEN).await;
    let msg = recv_json(&mut replacement).await;
    assert_eq!(msg["type"], "state");

    handle.shutdown().await;
}

#[tokio::test]
async fn subscription_released_on_disconnect() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_without_tailer(&test_config(&dir)).await;
    let registry = handle.registry().clone();

    let mut ws = connect_ws(handle.addr(), TOKEN).await;
    recv_json(&mut ws).await;
    assert_eq!(registry.subscriber_count(), 1);

    ws.close(None).await.unwrap();
    drop(ws);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while registry.subscriber_count() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "subscription leaked");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn requests_over_budget_get_429() {
    let dir = tempfile::tempdir().unwrap();
    let config = codex_blocker::config::Config {
        rate_limit: 3,
        ..test_config(&dir)
    };
    let handle = start_without_tailer(&config).await;
    let addr = handle.addr();

    for _ in 0..3 {
        assert_eq!(get_status(addr, TOKEN).await.status(), 200);
    }
    let resp = get_status(addr, TOKEN).await;
    assert_eq!(resp.status(), 429);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "rate_limited");

    handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_every_push_channel_normally() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_without_tailer(&test_config(&dir)).await;
    let registry = handle.registry().clone();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut ws = connect_ws(handle.addr(), TOKEN).await;
        recv_json(&mut ws).await;
        clients.push(ws);
    }

    // Leave state updates pending so the close frame competes with them.
    for i in 0..20 {
        registry.handle_activity(Activity::new(format!("s{i}")));
    }
    handle.shutdown().await;

    for ws in &mut clients {
        assert_eq!(recv_close_code(ws).await, Some(1000));
    }
    assert!(registry.is_empty());
}

fn keepalive_config(dir: &tempfile::TempDir, interval_ms: u64) -> Config {
    Config {
        keepalive_interval_ms: interval_ms,
        ..test_config(dir)
    }
}

async fn wait_for_subscribers(registry: &SessionRegistry, expected: usize, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    while registry.subscriber_count() != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "subscriber count stuck at {}",
            registry.subscriber_count()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn silent_client_is_dropped_after_two_keepalive_intervals() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_without_tailer(&keepalive_config(&dir, 100)).await;
    let registry = handle.registry().clone();

    // Never polled, so server pings go unanswered.
    let _silent = connect_ws(handle.addr(), TOKEN).await;
    wait_for_subscribers(&registry, 1, Duration::from_secs(5)).await;
    wait_for_subscribers(&registry, 0, Duration::from_secs(5)).await;

    handle.shutdown().await;
}

#[tokio::test]
async fn client_answering_pings_stays_connected() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_without_tailer(&keepalive_config(&dir, 100)).await;
    let registry = handle.registry().clone();

    let mut ws = connect_ws(handle.addr(), TOKEN).await;
    let pings = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&pings);
    // Reading lets tungstenite answer each ping with a pong.
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_ping() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(pings.load(Ordering::SeqCst) >= 3);
    assert_eq!(registry.subscriber_count(), 1);

    handle.shutdown().await;
    reader.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_that_stops_reading_is_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_without_tailer(&keepalive_config(&dir, 200)).await;
    let registry = handle.registry().clone();

    let ws = connect_ws(handle.addr(), TOKEN).await;
    let (mut sink, _unread) = ws.split();
    // Application pings keep the peer looking alive while nothing is read.
    let pinger = tokio::spawn(async move {
        let ping = r#"{"type":"ping"}"#;
        while sink.send(Message::Text(ping.into())).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });
    wait_for_subscribers(&registry, 1, Duration::from_secs(5)).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while registry.subscriber_count() != 0 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "stalled reader was never disconnected"
        );
        for _ in 0..100 {
            registry.handle_activity(Activity::new("s1"));
            registry.set_idle("s1", None);
        }
        tokio::task::yield_now().await;
    }

    pinger.abort();
    handle.shutdown().await;
}
