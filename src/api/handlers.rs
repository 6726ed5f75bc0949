use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Extension, State,
    },
    response::IntoResponse,
    Json,
};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::Snapshot;

use super::error::ApiError;
use super::limits::{ClientIp, ConnectionGuard};
use super::AppState;

/// Close code sent to connections beyond the per-IP cap ("try again later").
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

pub(super) async fn status(State(state): State<AppState>) -> Json<Snapshot> {
    Json(state.registry.snapshot())
}

pub(super) async fn not_found() -> ApiError {
    ApiError::NotFound
}

pub(super) async fn ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
) -> impl IntoResponse {
    // Claimed before the upgrade so concurrent handshakes cannot overshoot.
    let guard = state.connections.acquire(ip);
    ws.on_upgrade(move |socket| async move {
        match guard {
            Some(guard) => handle_ws(socket, state, guard).await,
            None => {
                tracing::debug!(%ip, "push channel over per-IP cap");
                close_with(socket, CLOSE_TRY_AGAIN_LATER, "Too many connections").await;
            }
        }
    })
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

type WsSink = SplitSink<WebSocket, Message>;

/// Send `msg`, giving up after `deadline`. A peer that stops reading would
/// otherwise park this task on a full socket forever.
async fn send_within(ws_tx: &mut WsSink, msg: Message, deadline: Duration) -> bool {
    match tokio::time::timeout(deadline, ws_tx.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => false,
        Err(_) => {
            tracing::debug!("push channel send timed out, disconnecting");
            false
        }
    }
}

async fn handle_ws(socket: WebSocket, state: AppState, _guard: ConnectionGuard) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Snapshots are pushed from inside the registry lock. Only the latest one
    // is kept for this task, so a slow reader never queues more than one.
    let (snap_tx, mut snap_rx) = watch::channel(None::<Snapshot>);
    let subscription = state.registry.subscribe(move |snapshot| {
        snap_tx.send_replace(Some(*snapshot));
    });

    let keepalive = state.keepalive_interval;
    let mut ping_interval = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    let mut last_heard = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = state.shutdown.cancelled() => {
                let close_frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: "server shutting down".into(),
                };
                if send_within(&mut ws_tx, Message::Close(Some(close_frame)), keepalive).await {
                    let _ = tokio::time::timeout(keepalive, ws_tx.flush()).await;
                }
                break;
            }

            changed = snap_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(snapshot) = *snap_rx.borrow_and_update() else { continue };
                let text = ServerMessage::from(snapshot).to_json();
                if !send_within(&mut ws_tx, Message::Text(text.into()), keepalive).await {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_heard = Instant::now();
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::Ping) => {
                                let pong = ServerMessage::Pong.to_json();
                                if !send_within(&mut ws_tx, Message::Text(pong.into()), keepalive).await {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Subscribe) => {}
                            Err(e) => tracing::debug!(error = %e, "ignoring invalid push-channel message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => last_heard = Instant::now(),
                    Some(Err(_)) => break,
                }
            }

            // Ping keepalive: drop peers that have gone silent for two intervals.
            _ = ping_interval.tick() => {
                if last_heard.elapsed() > keepalive * 2 {
                    tracing::debug!("push channel client unresponsive, disconnecting");
                    break;
                }
                if !send_within(&mut ws_tx, Message::Ping(Default::default()), keepalive).await {
                    break;
                }
            }
        }
    }

    subscription.unsubscribe();
    // _guard is dropped here, releasing the IP's connection slot
}
