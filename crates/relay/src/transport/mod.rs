// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for dashboard clients.

pub mod ws;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tokio_util::sync::CancellationToken;

use crate::manager::StateManager;

/// Shared transport state.
pub struct AppState {
    pub manager: StateManager,
    pub shutdown: CancellationToken,
    /// Live dashboard connections, bounded by [`ws::MAX_CLIENTS`].
    pub clients: AtomicUsize,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(manager: StateManager, shutdown: CancellationToken) -> Self {
        Self { manager, shutdown, clients: AtomicUsize::new(0), started_at: Instant::now() }
    }
}

/// Build the axum `Router` with all relay routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `GET /api/v1/health` — liveness plus a few counters for the rig host.
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.manager.snapshot().await;
    Json(serde_json::json!({
        "status": "ok",
        "upstream": snapshot.meta.upstream,
        "clients": state.clients.load(Ordering::Relaxed),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "malformedEvents": snapshot.meta.malformed_events,
        "parseFailures": snapshot.meta.parse_failures,
    }))
}
