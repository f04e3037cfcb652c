// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;

use super::*;
use crate::model::{RECENT_EVENTS_CAP, UnifiedState};

fn evt(kind: &str, time: &str, data: serde_json::Value) -> NormalizedEvent {
    let raw = serde_json::json!({ "Event": kind, "Time": time, "Data": data });
    crate::normalize::normalize(&raw, chrono_tz::UTC).unwrap()
}

fn apply(state: &mut UnifiedState, events: &[NormalizedEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| reduce(state, e))
        .map(|d| d.reason)
        .collect()
}

fn at(time: &str) -> DateTime<Utc> {
    time.parse().unwrap()
}

// ── session boundaries ────────────────────────────────────────────────

#[test]
fn session_boundary_with_target_and_image() {
    let mut state = UnifiedState::default();
    let events = [
        evt("SEQUENCE-STARTING", "2026-03-01T02:00:00Z", serde_json::json!({})),
        evt(
            "TS-NEWTARGETSTART",
            "2026-03-01T02:01:00Z",
            serde_json::json!({ "TargetName": "M31", "ProjectName": "Andromeda", "Ra": 10.68, "Dec": 41.27 }),
        ),
        evt("IMAGE-SAVE", "2026-03-01T02:02:00Z", serde_json::json!({ "FilePath": "a.fits" })),
        evt("SEQUENCE-FINISHED", "2026-03-01T02:03:00Z", serde_json::json!({})),
    ];
    let reasons = apply(&mut state, &events);

    assert_eq!(reasons, ["session-started", "target-changed", "image-saved", "session-ended"]);
    let session = &state.current_session;
    assert_eq!(session.is_active, Some(false));
    assert_eq!(session.started_at, Some(at("2026-03-01T02:00:00Z")));
    let target = session.target.as_ref().unwrap();
    assert_eq!(target.target_name.as_deref(), Some("M31"));
    assert_eq!(target.ra_deg, Some(10.68));
    assert_eq!(target.dec_deg, Some(41.27));
    let last = session.imaging.last_image.as_ref().unwrap();
    assert_eq!(last.at, at("2026-03-01T02:02:00Z"));
    assert_eq!(last.file_path, "a.fits");
}

#[test]
fn target_event_opens_a_session_when_idle() {
    let mut state = UnifiedState::default();
    let reasons = apply(
        &mut state,
        &[evt("TS-TARGETSTART", "2026-03-01T02:00:00Z", serde_json::json!({ "TargetName": "M42" }))],
    );
    assert_eq!(reasons, ["session-started"]);
    assert_eq!(state.current_session.is_active, Some(true));
    assert_eq!(state.current_session.started_at, Some(at("2026-03-01T02:00:00Z")));
}

#[test]
fn formatted_coordinates_preserved_in_target_details() {
    let mut state = UnifiedState::default();
    apply(
        &mut state,
        &[evt(
            "TS-NEWTARGETSTART",
            "2026-03-01T02:00:00Z",
            serde_json::json!({ "TargetName": "M31", "Ra": 10.68, "RaString": "00h 42m 44s" }),
        )],
    );
    let target = state.current_session.target.as_ref().unwrap();
    assert_eq!(target.ra_deg, Some(10.68));
    assert_eq!(target.details["RaString"], "00h 42m 44s");
}

// ── guiding ───────────────────────────────────────────────────────────

#[test]
fn guiding_toggles_retain_rms() {
    let mut state = UnifiedState::default();
    apply(
        &mut state,
        &[
            evt("GUIDER-START", "2026-03-01T02:00:00Z", serde_json::json!({})),
            evt(
                "GUIDER-RMS",
                "2026-03-01T02:01:00Z",
                serde_json::json!({ "RmsTotal": 0.8, "RmsRa": 0.5, "RmsDec": 0.6 }),
            ),
        ],
    );
    let guiding = &state.current_session.guiding;
    assert!(guiding.is_guiding);
    assert_eq!(guiding.last_rms_total, Some(0.8));
    assert_eq!(guiding.last_update, Some(at("2026-03-01T02:01:00Z")));

    apply(&mut state, &[evt("GUIDER-STOP", "2026-03-01T02:02:00Z", serde_json::json!({}))]);
    let guiding = &state.current_session.guiding;
    assert!(!guiding.is_guiding);
    // RMS figures survive the stop.
    assert_eq!(guiding.last_rms_total, Some(0.8));
    assert_eq!(guiding.last_rms_ra, Some(0.5));
    assert_eq!(guiding.last_rms_dec, Some(0.6));
}

#[test]
fn guider_disconnect_stops_guiding() {
    let mut state = UnifiedState::default();
    let reasons = apply(
        &mut state,
        &[
            evt("GUIDER-START", "2026-03-01T02:00:00Z", serde_json::json!({})),
            evt("GUIDER-DISCONNECTED", "2026-03-01T02:01:00Z", serde_json::json!({})),
        ],
    );
    assert_eq!(reasons, ["guiding-started", "guiding-stopped"]);
    assert!(!state.current_session.guiding.is_guiding);
    assert!(!state.equipment["guider:0"].connected);
}

// ── equipment ─────────────────────────────────────────────────────────

#[test]
fn equipment_flap_does_not_end_session() {
    let mut state = UnifiedState::default();
    apply(&mut state, &[evt("SEQUENCE-STARTING", "2026-03-01T02:00:00Z", serde_json::json!({}))]);
    let ring_before = state.recent_events.len();

    let deltas: Vec<_> = [
        evt("FOCUSER-DISCONNECTED", "2026-03-01T02:01:00Z", serde_json::json!({})),
        evt("FOCUSER-CONNECTED", "2026-03-01T02:02:00Z", serde_json::json!({})),
    ]
    .iter()
    .filter_map(|e| reduce(&mut state, e))
    .collect();

    assert_eq!(state.current_session.is_active, Some(true));
    assert!(state.equipment["focuser:0"].connected);
    assert_eq!(state.recent_events.len(), ring_before + 2);
    // Equipment deltas only; the session subtree is untouched.
    assert!(deltas.iter().all(|d| d.kind == UpdateKind::Equipment));
}

#[test]
fn equipment_upsert_merges_details() {
    let mut state = UnifiedState::default();
    apply(
        &mut state,
        &[
            evt(
                "CAMERA-CONNECTED",
                "2026-03-01T02:00:00Z",
                serde_json::json!({ "DeviceName": "ZWO ASI2600MM", "PixelSize": 3.76 }),
            ),
            evt(
                "CAMERA-EXPOSING",
                "2026-03-01T02:01:00Z",
                serde_json::json!({ "ExposureTime": 300 }),
            ),
        ],
    );
    let camera = &state.equipment["camera:0"];
    assert!(camera.connected);
    assert_eq!(camera.status, "exposing");
    assert_eq!(camera.name, "ZWO ASI2600MM");
    // Keys from the connect event survive the typed sub-event.
    assert_eq!(camera.details["PixelSize"], 3.76);
    assert_eq!(camera.details["ExposureTime"], 300);
    assert_eq!(camera.last_change, at("2026-03-01T02:01:00Z"));
}

#[test]
fn noop_filter_change_still_refreshes_last_change() {
    let mut state = UnifiedState::default();
    apply(
        &mut state,
        &[
            evt("FILTERWHEEL-CHANGED", "2026-03-01T02:00:00Z", serde_json::json!({ "NewFilter": "Ha" })),
            evt("FILTERWHEEL-CHANGED", "2026-03-01T02:05:00Z", serde_json::json!({ "NewFilter": "Ha" })),
        ],
    );
    assert_eq!(state.current_session.imaging.current_filter.as_deref(), Some("Ha"));
    assert_eq!(state.equipment["filterWheel:0"].last_change, at("2026-03-01T02:05:00Z"));
}

#[test]
fn stale_event_updates_history_only() {
    let mut state = UnifiedState::default();
    apply(&mut state, &[evt("IMAGE-SAVE", "2026-03-01T02:02:00Z", serde_json::json!({ "FilePath": "a.fits" }))]);

    let stale = evt("CAMERA-CONNECTED", "2026-03-01T02:01:00Z", serde_json::json!({}));
    let delta = reduce(&mut state, &stale).unwrap();

    assert_eq!(delta.reason, "stale-event");
    assert!(state.equipment.get("camera:0").is_none());
    assert_eq!(state.watermark, Some(at("2026-03-01T02:02:00Z")));
    // The ring still records it, in time order.
    assert_eq!(state.recent_events.len(), 2);
    assert_eq!(state.recent_events[1].kind, "CAMERA-CONNECTED");
}

// ── safety ────────────────────────────────────────────────────────────

#[test]
fn safety_changes_apply_outside_sessions() {
    let mut state = UnifiedState::default();
    apply(
        &mut state,
        &[evt("SAFETY-CHANGED", "2026-03-01T02:00:00Z", serde_json::json!({ "IsSafe": false }))],
    );
    assert_eq!(state.safety.is_safe, Some(false));
    assert_eq!(state.safety.changed_at, Some(at("2026-03-01T02:00:00Z")));
    assert_eq!(state.current_session.is_active, None);
}

#[test]
fn platesolve_alert_is_sticky_until_light_frame() {
    let mut state = UnifiedState::default();
    apply(&mut state, &[evt("ERROR-PLATESOLVE", "2026-03-01T02:00:00Z", serde_json::json!({}))]);
    assert_eq!(state.safety.alerts, [ALERT_PLATESOLVE]);

    // A dark frame does not clear it.
    apply(
        &mut state,
        &[evt(
            "IMAGE-SAVE",
            "2026-03-01T02:01:00Z",
            serde_json::json!({ "FilePath": "d.fits", "ImageType": "DARK" }),
        )],
    );
    assert_eq!(state.safety.alerts, [ALERT_PLATESOLVE]);

    apply(
        &mut state,
        &[evt(
            "IMAGE-SAVE",
            "2026-03-01T02:02:00Z",
            serde_json::json!({ "FilePath": "l.fits", "ImageType": "LIGHT" }),
        )],
    );
    assert!(state.safety.alerts.is_empty());
}

#[test]
fn platesolve_alert_cleared_by_guiding_start() {
    let mut state = UnifiedState::default();
    apply(
        &mut state,
        &[
            evt("ERROR-PLATESOLVE", "2026-03-01T02:00:00Z", serde_json::json!({})),
            evt("GUIDER-START", "2026-03-01T02:01:00Z", serde_json::json!({})),
        ],
    );
    assert!(state.safety.alerts.is_empty());
}

#[test]
fn duplicate_platesolve_errors_raise_one_alert() {
    let mut state = UnifiedState::default();
    apply(
        &mut state,
        &[
            evt("ERROR-PLATESOLVE", "2026-03-01T02:00:00Z", serde_json::json!({})),
            evt("ERROR-PLATESOLVE", "2026-03-01T02:01:00Z", serde_json::json!({})),
        ],
    );
    assert_eq!(state.safety.alerts.len(), 1);
}

// ── image monotonicity ────────────────────────────────────────────────

#[test]
fn last_image_never_regresses() {
    let mut state = UnifiedState::default();
    apply(&mut state, &[evt("IMAGE-SAVE", "2026-03-01T02:05:00Z", serde_json::json!({ "FilePath": "b.fits" }))]);
    // An equal-time save replaces (arrival order wins at ties).
    apply(&mut state, &[evt("IMAGE-SAVE", "2026-03-01T02:05:00Z", serde_json::json!({ "FilePath": "c.fits" }))]);
    let last = state.current_session.imaging.last_image.as_ref().unwrap();
    assert_eq!(last.file_path, "c.fits");
    assert_eq!(last.at, at("2026-03-01T02:05:00Z"));
}

#[test]
fn image_stats_land_in_ring_meta() {
    let mut state = UnifiedState::default();
    apply(
        &mut state,
        &[evt(
            "IMAGE-SAVE",
            "2026-03-01T02:00:00Z",
            serde_json::json!({ "FilePath": "a.fits", "HFR": 2.1, "Stars": 843, "ImageType": "LIGHT" }),
        )],
    );
    let newest = &state.recent_events[0];
    assert_eq!(newest.summary, "Image saved: a.fits");
    assert_eq!(newest.meta["HFR"], 2.1);
    assert_eq!(newest.meta["Stars"], 843);
}

// ── idempotency ───────────────────────────────────────────────────────

#[test]
fn replayed_event_is_a_noop() {
    let mut state = UnifiedState::default();
    let event = evt("GUIDER-START", "2026-03-01T02:00:00Z", serde_json::json!({}));
    assert!(reduce(&mut state, &event).is_some());
    let before = state.clone();
    assert!(reduce(&mut state, &event).is_none());
    assert_eq!(state, before);
}

// ── activity classification ───────────────────────────────────────────

#[test]
fn activity_priority_autofocus_over_guiding() {
    let mut state = UnifiedState::default();
    apply(
        &mut state,
        &[
            evt("GUIDER-START", "2026-03-01T02:00:00Z", serde_json::json!({})),
            evt("AUTOFOCUS-START", "2026-03-01T02:01:00Z", serde_json::json!({})),
        ],
    );
    assert_eq!(state.current_session.activity, Activity::Autofocus);

    apply(&mut state, &[evt("AUTOFOCUS-FINISHED", "2026-03-01T02:02:00Z", serde_json::json!({}))]);
    assert_eq!(state.current_session.activity, Activity::Guiding);
}

#[test]
fn slewing_mount_beats_imaging() {
    let mut state = UnifiedState::default();
    apply(
        &mut state,
        &[
            evt("SEQUENCE-STARTING", "2026-03-01T02:00:00Z", serde_json::json!({})),
            evt("MOUNT-SLEWING", "2026-03-01T02:01:00Z", serde_json::json!({})),
        ],
    );
    assert_eq!(state.current_session.activity, Activity::Slewing);

    apply(&mut state, &[evt("MOUNT-TRACKING", "2026-03-01T02:02:00Z", serde_json::json!({}))]);
    assert_eq!(state.current_session.activity, Activity::Imaging);
}

// ── housekeeping ──────────────────────────────────────────────────────

#[test]
fn stale_target_expires() {
    let mut state = UnifiedState::default();
    apply(
        &mut state,
        &[evt("TS-NEWTARGETSTART", "2026-03-01T02:00:00Z", serde_json::json!({ "TargetName": "M31" }))],
    );

    let now = at("2026-03-01T11:00:00Z"); // nine hours later
    let delta = housekeep(&mut state, now, Duration::hours(8)).unwrap();
    assert_eq!(delta.reason, "target-expired");
    assert!(state.current_session.target.is_none());
    assert_eq!(state.current_session.is_active, Some(false));
}

#[test]
fn sequence_event_resets_the_expiry_clock() {
    let mut state = UnifiedState::default();
    apply(
        &mut state,
        &[
            evt("TS-NEWTARGETSTART", "2026-03-01T02:00:00Z", serde_json::json!({ "TargetName": "M31" })),
            // Seven hours in, a new sequence starts on the same target.
            evt("SEQUENCE-STARTING", "2026-03-01T09:00:00Z", serde_json::json!({})),
        ],
    );

    // Nine hours after the target was set, but only two after the
    // sequence event: not stale.
    let now = at("2026-03-01T11:00:00Z");
    assert!(housekeep(&mut state, now, Duration::hours(8)).is_none());
    assert!(state.current_session.target.is_some());

    // Eight-plus hours with no session-bearing event at all: stale.
    let now = at("2026-03-01T17:30:00Z");
    let delta = housekeep(&mut state, now, Duration::hours(8)).unwrap();
    assert_eq!(delta.reason, "target-expired");
}

#[test]
fn fresh_target_survives_housekeeping() {
    let mut state = UnifiedState::default();
    apply(
        &mut state,
        &[evt("TS-NEWTARGETSTART", "2026-03-01T02:00:00Z", serde_json::json!({ "TargetName": "M31" }))],
    );
    let now = at("2026-03-01T06:00:00Z");
    assert!(housekeep(&mut state, now, Duration::hours(8)).is_none());
    assert!(state.current_session.target.is_some());
}

// ── fold properties ───────────────────────────────────────────────────

const POOL: &[&str] = &[
    "SEQUENCE-STARTING",
    "TS-NEWTARGETSTART",
    "IMAGE-SAVE",
    "GUIDER-START",
    "GUIDER-RMS",
    "GUIDER-STOP",
    "SEQUENCE-FINISHED",
    "FOCUSER-CONNECTED",
    "FOCUSER-DISCONNECTED",
    "SAFETY-CHANGED",
    "ERROR-PLATESOLVE",
    "AUTOFOCUS-START",
    "AUTOFOCUS-FINISHED",
];

fn pool_event(index: usize, minute: i64) -> NormalizedEvent {
    let time = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap() + Duration::minutes(minute);
    evt(POOL[index % POOL.len()], &time.to_rfc3339(), serde_json::json!({ "Seq": minute }))
}

fn fold(events: &[NormalizedEvent]) -> UnifiedState {
    let mut state = UnifiedState::default();
    for event in events {
        reduce(&mut state, event);
    }
    state
}

proptest! {
    #[test]
    fn fold_is_split_invariant(indices in proptest::collection::vec(0usize..POOL.len(), 0..40), split in 0usize..40) {
        let events: Vec<_> =
            indices.iter().enumerate().map(|(i, &k)| pool_event(k, i as i64)).collect();
        let split = split.min(events.len());

        let whole = fold(&events);
        let mut resumed = fold(&events[..split]);
        for event in &events[split..] {
            reduce(&mut resumed, event);
        }
        prop_assert_eq!(whole, resumed);
    }

    #[test]
    fn ring_stays_bounded_and_time_ordered(indices in proptest::collection::vec(0usize..POOL.len(), 0..120)) {
        let events: Vec<_> =
            indices.iter().enumerate().map(|(i, &k)| pool_event(k, i as i64)).collect();
        let state = fold(&events);

        prop_assert!(state.recent_events.len() <= RECENT_EVENTS_CAP);
        let times: Vec<_> = state.recent_events.iter().map(|e| e.time).collect();
        let mut sorted = times.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        prop_assert_eq!(times, sorted);
    }
}
