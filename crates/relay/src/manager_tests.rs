// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use tokio_util::sync::CancellationToken;

use super::*;
use crate::store::Store;

/// Manager wired to an in-memory store and an unreachable upstream.
fn spawn_manager() -> StateManager {
    let store = Store::open_in_memory().unwrap();
    let ic = IcClient::new("http://127.0.0.1:1".to_owned(), "/event-history".to_owned());
    StateManager::spawn(
        store,
        ic,
        chrono_tz::UTC,
        chrono::Duration::hours(8),
        UnifiedState::default(),
        CancellationToken::new(),
    )
}

fn raw(kind: &str, time: &str, data: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "Event": kind, "Time": time, "Data": data })
}

#[tokio::test]
async fn apply_reduces_and_broadcasts() {
    let manager = spawn_manager();
    let mut updates = manager.subscribe();

    manager.apply(raw("SEQUENCE-STARTING", "2026-03-01T02:00:00Z", serde_json::json!({}))).await;

    let update = updates.recv().await.unwrap();
    assert_eq!(update.delta.reason, "session-started");
    assert_eq!(update.delta.kind, UpdateKind::Session);
    assert_eq!(update.state.current_session.is_active, Some(true));
}

#[tokio::test]
async fn updates_arrive_in_writer_order() {
    let manager = spawn_manager();
    let mut updates = manager.subscribe();

    manager.apply(raw("SEQUENCE-STARTING", "2026-03-01T02:00:00Z", serde_json::json!({}))).await;
    manager.apply(raw("GUIDER-START", "2026-03-01T02:01:00Z", serde_json::json!({}))).await;
    manager.apply(raw("SEQUENCE-FINISHED", "2026-03-01T02:02:00Z", serde_json::json!({}))).await;

    let mut reasons = Vec::new();
    for _ in 0..3 {
        reasons.push(updates.recv().await.unwrap().delta.reason);
    }
    assert_eq!(reasons, ["session-started", "guiding-started", "session-ended"]);
}

#[tokio::test]
async fn snapshot_reflects_applied_events() {
    let manager = spawn_manager();

    manager
        .apply(raw(
            "TS-NEWTARGETSTART",
            "2026-03-01T02:00:00Z",
            serde_json::json!({ "TargetName": "M31" }),
        ))
        .await;
    manager.sync().await;

    let state = manager.snapshot().await;
    assert_eq!(state.current_session.is_active, Some(true));
    assert_eq!(
        state.current_session.target.as_ref().and_then(|t| t.target_name.as_deref()),
        Some("M31")
    );
}

#[tokio::test]
async fn malformed_events_are_counted_not_broadcast() {
    let manager = spawn_manager();
    let mut updates = manager.subscribe();

    manager.apply(serde_json::json!({ "Event": "IMAGE-SAVE" })).await; // missing time
    manager.apply(raw("GUIDER-START", "2026-03-01T02:00:00Z", serde_json::json!({}))).await;
    manager.sync().await;

    // Only the valid event produced an update.
    let update = updates.recv().await.unwrap();
    assert_eq!(update.delta.reason, "guiding-started");
    assert_eq!(update.state.meta.malformed_events, 1);
    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn duplicate_event_is_not_rebroadcast() {
    let manager = spawn_manager();
    let mut updates = manager.subscribe();

    let event = raw("GUIDER-START", "2026-03-01T02:00:00Z", serde_json::json!({}));
    manager.apply(event.clone()).await;
    manager.apply(event).await;
    manager.sync().await;

    assert!(updates.recv().await.is_ok());
    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn upstream_transitions_are_published_once() {
    let manager = spawn_manager();
    let mut updates = manager.subscribe();

    manager.set_upstream(UpstreamHealth::Live).await;
    manager.set_upstream(UpstreamHealth::Live).await; // no-op
    manager.sync().await;

    let update = updates.recv().await.unwrap();
    assert_eq!(update.delta.reason, "upstream-restored");
    assert!(updates.try_recv().is_err());
}

#[tokio::test]
async fn reset_without_upstream_or_state_is_unavailable() {
    let manager = spawn_manager();
    let err = manager.reset().await.unwrap_err();
    assert!(matches!(err, crate::error::ResetError::SeederUnavailable));
}

#[tokio::test]
async fn housekeep_clears_expired_target() {
    let store = Store::open_in_memory().unwrap();
    let ic = IcClient::new("http://127.0.0.1:1".to_owned(), "/event-history".to_owned());
    // Zero-hour expiry so any target is immediately stale.
    let manager = StateManager::spawn(
        store,
        ic,
        chrono_tz::UTC,
        chrono::Duration::hours(0),
        UnifiedState::default(),
        CancellationToken::new(),
    );

    manager
        .apply(raw(
            "TS-NEWTARGETSTART",
            "2020-03-01T02:00:00Z",
            serde_json::json!({ "TargetName": "M31" }),
        ))
        .await;
    manager.housekeep().await;
    manager.sync().await;

    let state = manager.snapshot().await;
    assert!(state.current_session.target.is_none());
    assert_eq!(state.current_session.is_active, Some(false));
}
