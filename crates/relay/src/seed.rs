// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup seeding: replay upstream event history through the writer so
//! the derived state reflects whatever happened while the relay was down.
//!
//! Seeding uses the writer's normal inbound channel, so replayed events
//! go through exactly the normalize → reduce → persist path that live
//! events do, and the idempotency ring keeps the replay safe against
//! live arrivals racing in during startup.

use crate::manager::StateManager;
use crate::model::UpstreamHealth;
use crate::upstream::client::IcClient;

/// Outcome of the startup seed pass.
#[derive(Debug, Clone)]
pub struct SeedSummary {
    pub processed: usize,
    pub session_active: Option<bool>,
    pub target_name: Option<String>,
}

/// Fetch and replay upstream history. A failed fetch is non-fatal: the
/// relay continues from whatever state the store already holds.
pub async fn seed(manager: &StateManager, ic: &IcClient) -> SeedSummary {
    let events = match ic.event_history().await {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!(err = %e, "history fetch failed, continuing with persisted state");
            // A persisted state may claim a live upstream from the
            // previous run; it is not.
            manager.set_upstream(UpstreamHealth::Degraded).await;
            manager.sync().await;
            let state = manager.snapshot().await;
            return SeedSummary {
                processed: 0,
                session_active: state.current_session.is_active,
                target_name: target_name(&state),
            };
        }
    };

    let processed = events.len();
    for raw in events {
        manager.apply(raw).await;
    }
    manager.sync().await;

    let state = manager.snapshot().await;
    let summary = SeedSummary {
        processed,
        session_active: state.current_session.is_active,
        target_name: target_name(&state),
    };
    tracing::info!(
        processed = summary.processed,
        session_active = ?summary.session_active,
        target = summary.target_name.as_deref().unwrap_or("none"),
        "seeded state from upstream history"
    );
    summary
}

fn target_name(state: &crate::model::UnifiedState) -> Option<String> {
    state.current_session.target.as_ref().and_then(|t| t.target_name.clone())
}
