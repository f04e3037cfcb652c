// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dashboard WebSocket fan-out.
//!
//! Every accepted connection gets one `fullSync` envelope, then live
//! deltas in writer order. Dead peers are detected three ways: a send
//! that exceeds [`SEND_TIMEOUT`], a broadcast receiver that lags past
//! its bound, or a failed write. All three close the connection; cleanup
//! is idempotent.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};

use crate::model::{Changed, Envelope, UnifiedState, UpdateKind};
use crate::transport::AppState;

/// Concurrent dashboard connection cap; further connections are accepted
/// then immediately closed with a "busy" reason.
pub const MAX_CLIENTS: usize = 100;

/// Heartbeat interval per connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Per-message send deadline; a slower peer is closed.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// `GET /ws` — WebSocket upgrade for dashboard clients.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Decrements the connection counter exactly once, however the
/// connection ends.
struct ConnGuard(Arc<AppState>);

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.clients.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn handle_socket(state: Arc<AppState>, mut socket: WebSocket) {
    let prev = state.clients.fetch_add(1, Ordering::SeqCst);
    if prev >= MAX_CLIENTS {
        state.clients.fetch_sub(1, Ordering::SeqCst);
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AGAIN,
                reason: "busy".into(),
            })))
            .await;
        return;
    }
    let _guard = ConnGuard(Arc::clone(&state));

    // Subscribe before snapshotting so no delta can fall between the
    // fullSync and the first forwarded update.
    let mut updates = state.manager.subscribe();
    let snapshot = state.manager.snapshot().await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    if send_envelope(&mut ws_tx, UpdateKind::FullSync, "initial-state", None, &snapshot)
        .await
        .is_err()
    {
        return;
    }

    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,

            update = updates.recv() => {
                use tokio::sync::broadcast::error::RecvError;
                match update {
                    Ok(update) => {
                        let sent = send_envelope(
                            &mut ws_tx,
                            update.delta.kind,
                            &update.delta.reason,
                            update.delta.changed.as_ref(),
                            &update.state,
                        )
                        .await;
                        if sent.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "client fell behind, closing");
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            _ = heartbeat.tick() => {
                let snapshot = state.manager.snapshot().await;
                if send_envelope(&mut ws_tx, UpdateKind::Heartbeat, "heartbeat", None, &snapshot)
                    .await
                    .is_err()
                {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if is_ping(text.as_str()) && send_pong(&mut ws_tx).await.is_err() {
                            break;
                        }
                        // All other inbound messages are ignored.
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

fn is_ping(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "ping"))
        .unwrap_or(false)
}

async fn send_pong(ws_tx: &mut SplitSink<WebSocket, Message>) -> Result<(), ()> {
    let pong = serde_json::json!({ "type": "pong", "timestamp": Utc::now() });
    send_text(ws_tx, pong.to_string()).await
}

async fn send_envelope(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    kind: UpdateKind,
    reason: &str,
    changed: Option<&Changed>,
    state: &UnifiedState,
) -> Result<(), ()> {
    let envelope = Envelope::new(kind, reason, changed, state);
    let json = serde_json::to_string(&envelope).map_err(|_| ())?;
    send_text(ws_tx, json).await
}

async fn send_text(ws_tx: &mut SplitSink<WebSocket, Message>, text: String) -> Result<(), ()> {
    match tokio::time::timeout(SEND_TIMEOUT, ws_tx.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) | Err(_) => Err(()),
    }
}
