// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn event(kind: &str, time: &str) -> crate::model::NormalizedEvent {
    let raw = serde_json::json!({ "Event": kind, "Time": time });
    crate::normalize::normalize(&raw, chrono_tz::UTC).unwrap()
}

fn raw_of(kind: &str, time: &str) -> serde_json::Value {
    serde_json::json!({ "Event": kind, "Time": time })
}

// ── event ring ────────────────────────────────────────────────────────

#[test]
fn append_keeps_ring_bounded() {
    let mut store = Store::open_in_memory().unwrap();
    for i in 0..520 {
        let time = format!("2026-03-01T{:02}:{:02}:{:02}Z", i / 3600, (i / 60) % 60, i % 60);
        store.append_event(&event("IMAGE-SAVE", &time), &raw_of("IMAGE-SAVE", &time)).unwrap();
    }
    assert_eq!(store.event_count().unwrap(), EVENT_RING_CAP);

    // The newest row survives pruning.
    let newest = &store.load_recent(1).unwrap()[0];
    assert_eq!(newest.time_utc, "2026-03-01T00:08:39+00:00");
}

#[test]
fn load_recent_is_newest_first() {
    let mut store = Store::open_in_memory().unwrap();
    for time in ["2026-03-01T02:00:00Z", "2026-03-01T02:02:00Z", "2026-03-01T02:01:00Z"] {
        store.append_event(&event("GUIDER-START", time), &raw_of("GUIDER-START", time)).unwrap();
    }
    let rows = store.load_recent(10).unwrap();
    let times: Vec<_> = rows.iter().map(|r| r.time_utc.as_str()).collect();
    assert_eq!(
        times,
        ["2026-03-01T02:02:00+00:00", "2026-03-01T02:01:00+00:00", "2026-03-01T02:00:00+00:00"]
    );
}

#[test]
fn equal_times_tie_break_by_insertion_order() {
    let mut store = Store::open_in_memory().unwrap();
    let time = "2026-03-01T02:00:00Z";
    store.append_event(&event("GUIDER-START", time), &raw_of("GUIDER-START", time)).unwrap();
    store.append_event(&event("GUIDER-STOP", time), &raw_of("GUIDER-STOP", time)).unwrap();
    let rows = store.load_recent(2).unwrap();
    assert_eq!(rows[0].event_type, "GUIDER-STOP");
    assert_eq!(rows[1].event_type, "GUIDER-START");
}

// ── state row ─────────────────────────────────────────────────────────

#[test]
fn state_round_trips() {
    let store = Store::open_in_memory().unwrap();
    let mut state = crate::model::UnifiedState::default();
    state.current_session.is_active = Some(true);
    state.current_session.started_at = Some("2026-03-01T02:00:00Z".parse().unwrap());
    state.current_session.imaging.current_filter = Some("OIII".to_owned());
    state.meta.malformed_events = 3;

    store.save_state(&state).unwrap();
    assert_eq!(store.load_state().unwrap(), Some(state));
}

#[test]
fn save_state_overwrites_prior_row() {
    let store = Store::open_in_memory().unwrap();
    let mut state = crate::model::UnifiedState::default();
    store.save_state(&state).unwrap();
    state.current_session.is_active = Some(true);
    store.save_state(&state).unwrap();
    assert_eq!(store.load_state().unwrap().unwrap().current_session.is_active, Some(true));
}

#[test]
fn empty_store_has_no_state() {
    let store = Store::open_in_memory().unwrap();
    assert_eq!(store.load_state().unwrap(), None);
}

#[test]
fn corrupt_state_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    {
        let store = Store::open(&path).unwrap();
        store.save_state(&crate::model::UnifiedState::default()).unwrap();
    }
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute("UPDATE session_state SET state_json = 'not json' WHERE id = 1", [])
            .unwrap();
    }
    let store = Store::open(&path).unwrap();
    assert_eq!(store.load_state().unwrap(), None);
}

#[test]
fn reopen_preserves_events() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.db");
    {
        let mut store = Store::open(&path).unwrap();
        store
            .append_event(
                &event("IMAGE-SAVE", "2026-03-01T02:00:00Z"),
                &raw_of("IMAGE-SAVE", "2026-03-01T02:00:00Z"),
            )
            .unwrap();
    }
    let store = Store::open(&path).unwrap();
    assert_eq!(store.event_count().unwrap(), 1);
}

#[test]
fn clear_truncates_both_tables() {
    let mut store = Store::open_in_memory().unwrap();
    store
        .append_event(
            &event("IMAGE-SAVE", "2026-03-01T02:00:00Z"),
            &raw_of("IMAGE-SAVE", "2026-03-01T02:00:00Z"),
        )
        .unwrap();
    store.save_state(&crate::model::UnifiedState::default()).unwrap();

    store.clear().unwrap();
    assert_eq!(store.event_count().unwrap(), 0);
    assert_eq!(store.load_state().unwrap(), None);
}
