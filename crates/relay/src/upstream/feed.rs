// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Long-lived WebSocket feed from the imaging-control app.
//!
//! Dials, sends the subscription frame on open, hands each JSON frame to
//! the state writer, and reconnects forever with bounded exponential
//! backoff. A socket that dies within two seconds of an equipment
//! connect/disconnect burst gets a short reconnect delay so a device
//! flap doesn't stall the feed for a full backoff interval.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_util::sync::CancellationToken;

use crate::manager::StateManager;
use crate::model::UpstreamHealth;

/// Dial + WebSocket handshake deadline.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between outbound pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// No inbound frame for this long means the connection is stale.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Window and delay for the equipment-flap fast reconnect.
const FLAP_WINDOW: Duration = Duration::from_secs(2);
const FLAP_DELAY: Duration = Duration::from_secs(2);

/// Spawn the upstream feed task. It owns the socket exclusively and
/// reconnects until `cancel` fires.
pub fn spawn_feed(
    ws_url: String,
    subscribe_frame: String,
    manager: StateManager,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut backoff = BACKOFF_BASE;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut flap_close = false;
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(&ws_url))
                .await
            {
                Ok(Ok((mut ws, _))) => {
                    // The subscription frame goes out immediately after the
                    // socket reaches the open state.
                    if ws.send(Message::Text(subscribe_frame.clone().into())).await.is_ok() {
                        tracing::info!(url = %ws_url, "upstream feed connected");
                        backoff = BACKOFF_BASE;
                        manager.set_upstream(UpstreamHealth::Live).await;
                        flap_close = read_loop(ws, &manager, &cancel).await;
                    } else {
                        tracing::debug!(url = %ws_url, "subscribe frame send failed");
                    }
                    manager.set_upstream(UpstreamHealth::Degraded).await;
                }
                Ok(Err(e)) => {
                    tracing::debug!(url = %ws_url, err = %e, "upstream connect failed");
                }
                Err(_) => {
                    tracing::debug!(url = %ws_url, "upstream handshake timed out");
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            let delay = if flap_close { FLAP_DELAY } else { backoff };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            backoff = next_backoff(backoff);
        }
    });
}

/// Read frames until the connection dies. Returns true when the close
/// followed an equipment connect/disconnect within [`FLAP_WINDOW`].
async fn read_loop(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    manager: &StateManager,
    cancel: &CancellationToken,
) -> bool {
    let (mut write, mut read) = ws.split();
    let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Any inbound frame (pong included) feeds the idle timer.
    let mut last_inbound = Instant::now();
    let mut last_equipment_event: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,

            _ = ping.tick() => {
                if write.send(Message::Ping(Bytes::new())).await.is_err() {
                    tracing::debug!("upstream ping failed");
                    break;
                }
            }

            _ = tokio::time::sleep_until(last_inbound + IDLE_TIMEOUT) => {
                tracing::warn!("upstream connection idle, reconnecting");
                break;
            }

            msg = read.next() => {
                last_inbound = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<serde_json::Value>(text.as_ref()) {
                            Ok(raw) => {
                                if is_equipment_event(&raw) {
                                    last_equipment_event = Some(Instant::now());
                                }
                                manager.apply(raw).await;
                            }
                            Err(e) => {
                                tracing::debug!(err = %e, "dropping unparseable upstream frame");
                                manager.note_parse_failure().await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!("upstream closed");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::debug!(err = %e, "upstream read error");
                        break;
                    }
                    Some(Ok(_)) => {} // pong/binary only feed the idle timer
                }
            }
        }
    }

    last_equipment_event.is_some_and(|t| t.elapsed() < FLAP_WINDOW)
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

/// Whether a raw frame is an equipment connect/disconnect.
fn is_equipment_event(raw: &serde_json::Value) -> bool {
    ["Event", "Type", "kind", "type"]
        .iter()
        .find_map(|k| raw.get(*k).and_then(|v| v.as_str()))
        .is_some_and(|kind| kind.ends_with("-CONNECTED") || kind.ends_with("-DISCONNECTED"))
}

#[cfg(test)]
#[path = "feed_tests.rs"]
mod tests;
