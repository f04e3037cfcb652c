// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! rigrelay: telemetry aggregator for a remote astrophotography rig.
//!
//! Consumes the imaging-control event stream, folds it into a unified
//! observatory state, persists a bounded event ring plus the latest
//! state, and fans the state out to dashboard clients over WebSocket.

pub mod config;
pub mod error;
pub mod manager;
pub mod model;
pub mod normalize;
pub mod reduce;
pub mod seed;
pub mod store;
pub mod transport;
pub mod upstream;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::error::FatalError;
use crate::manager::StateManager;
use crate::store::Store;
use crate::transport::{build_router, AppState};
use crate::upstream::client::IcClient;

/// Run the relay until shutdown.
pub async fn run(config: RelayConfig) -> Result<(), FatalError> {
    let tz = config.tz()?;
    let store = Store::open(&config.db_path)
        .map_err(|e| FatalError::Init { path: config.db_path.clone(), source: e })?;
    let initial = store
        .load_state()
        .map_err(|e| FatalError::Init { path: config.db_path.clone(), source: e })?
        .unwrap_or_default();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let ic = IcClient::new(config.ic_url.clone(), config.ic_history_path.clone());
    let manager = StateManager::spawn(
        store,
        ic.clone(),
        tz,
        config.target_expiry(),
        initial,
        shutdown.clone(),
    );

    // Seed from history before live consumption starts.
    seed::seed(&manager, &ic).await;

    upstream::feed::spawn_feed(
        config.ic_ws_url(),
        config.ic_subscribe.clone(),
        manager.clone(),
        shutdown.clone(),
    );
    spawn_housekeeping(manager.clone(), config.housekeep_interval(), shutdown.clone());

    let state = Arc::new(AppState::new(manager, shutdown.clone()));
    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| FatalError::Bind { addr: addr.clone(), source: e })?;
    tracing::info!("rigrelay listening on {addr}");
    axum::serve(listener, router).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}

/// Periodic stale-target sweep.
fn spawn_housekeeping(
    manager: StateManager,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = timer.tick() => manager.housekeep().await,
            }
        }
    });
}
