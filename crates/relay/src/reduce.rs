// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The state reducer: a pure fold of normalized events into
//! [`UnifiedState`].
//!
//! The reducer never performs I/O and never reads the wall clock; the
//! one time-dependent rule (stale-target expiry) lives in [`housekeep`]
//! and takes `now` as an argument. This keeps the fold deterministic:
//! a fixed ordered event sequence always produces the same final state.

use chrono::{DateTime, Duration, Utc};

use crate::model::{
    Activity, Changed, Delta, EquipmentEntry, EquipmentKind, EventCategory, FrameType, LastImage,
    NormalizedEvent, Target, UnifiedState, UpdateKind, ALERT_PLATESOLVE,
};

/// Fold one event into the state, returning the delta it produced.
///
/// Returns `None` when the event's idempotency key is already in the
/// ring (a history replay duplicating a live arrival). Events older than
/// the watermark still enter the ring but leave every "latest change"
/// projection untouched.
pub fn reduce(state: &mut UnifiedState, evt: &NormalizedEvent) -> Option<Delta> {
    if state.has_event(&evt.idempotency_key) {
        return None;
    }

    let stale = state.watermark.is_some_and(|w| evt.time < w);
    let delta = if stale {
        Delta::new(UpdateKind::Events, "stale-event")
    } else {
        dispatch(state, evt)
    };

    state.push_recent(crate::model::RecentEvent {
        time: evt.time,
        kind: evt.kind.clone(),
        summary: summarize(evt),
        meta: ring_meta(evt),
        idempotency_key: evt.idempotency_key.clone(),
    });

    if !stale {
        state.watermark = Some(state.watermark.map_or(evt.time, |w| w.max(evt.time)));
        state.current_session.activity = classify_activity(state);
    }

    Some(delta)
}

/// Periodic housekeeping: clear a target whose `startedAt` is older than
/// `expiry` with no newer target/sequence event, treating the stream as
/// stale.
pub fn housekeep(state: &mut UnifiedState, now: DateTime<Utc>, expiry: Duration) -> Option<Delta> {
    let session = &state.current_session;
    let started = session.target.as_ref()?.started_at?;
    // A later sequence event on the same target resets the clock.
    let freshest = session.last_activity_at.map_or(started, |t| t.max(started));
    if now - freshest <= expiry {
        return None;
    }
    state.current_session.target = None;
    state.current_session.is_active = Some(false);
    state.current_session.activity = classify_activity(state);
    Some(Delta::new(UpdateKind::Session, "target-expired").with_changed(Changed {
        path: "currentSession.target".to_owned(),
        summary: "target cleared after expiry".to_owned(),
        meta: serde_json::Map::new(),
    }))
}

// -- Dispatch ------------------------------------------------------------------

fn dispatch(state: &mut UnifiedState, evt: &NormalizedEvent) -> Delta {
    match evt.kind.as_str() {
        "SEQUENCE-STARTING" => sequence_start(state, evt),
        "TS-NEWTARGETSTART" | "TS-TARGETSTART" => target_start(state, evt),
        "SEQUENCE-STOPPED" | "SEQUENCE-COMPLETED" | "SEQUENCE-FINISHED" => session_end(state),
        "AUTOFOCUS-START" => {
            state.current_session.autofocus_running = true;
            Delta::new(UpdateKind::Session, "autofocus-started")
        }
        "AUTOFOCUS-FINISHED" => {
            state.current_session.autofocus_running = false;
            Delta::new(UpdateKind::Session, "autofocus-finished")
        }
        "IMAGE-SAVE" => image_save(state, evt),
        "FILTERWHEEL-CHANGED" => filter_change(state, evt),
        "GUIDER-START" => {
            state.current_session.guiding.is_guiding = true;
            state.current_session.guiding.since = Some(evt.time);
            state.safety.alerts.retain(|a| a != ALERT_PLATESOLVE);
            upsert_equipment(state, EquipmentKind::Guider, evt, Some(true), "guiding");
            Delta::new(UpdateKind::Session, "guiding-started")
        }
        "GUIDER-STOP" => {
            state.current_session.guiding.is_guiding = false;
            upsert_equipment(state, EquipmentKind::Guider, evt, Some(true), "idle");
            Delta::new(UpdateKind::Session, "guiding-stopped")
        }
        "GUIDER-DISCONNECTED" => {
            let was_guiding = state.current_session.guiding.is_guiding;
            state.current_session.guiding.is_guiding = false;
            let key =
                upsert_equipment(state, EquipmentKind::Guider, evt, Some(false), "disconnected");
            if was_guiding {
                Delta::new(UpdateKind::Session, "guiding-stopped")
            } else {
                equipment_delta(key, "equipment-disconnected")
            }
        }
        "GUIDER-RMS" => guider_rms(state, evt),
        "GUIDER-CONNECTED" => equipment_event(state, evt),
        "SAFETY-CHANGED" => {
            state.safety.is_safe = get_bool(evt, &["IsSafe", "Safe"]);
            state.safety.changed_at = Some(evt.time);
            Delta::new(UpdateKind::Safety, "safety-changed")
        }
        "ERROR-PLATESOLVE" => {
            if !state.safety.alerts.iter().any(|a| a == ALERT_PLATESOLVE) {
                state.safety.alerts.push(ALERT_PLATESOLVE.to_owned());
            }
            Delta::new(UpdateKind::Safety, "platesolve-error")
        }
        "FLAT-LIGHT-TOGGLED" => {
            upsert_equipment(state, EquipmentKind::FlatPanel, evt, Some(true), "idle");
            Delta::new(UpdateKind::Safety, "flat-light-toggled")
        }
        _ => match evt.category {
            EventCategory::Equipment => equipment_event(state, evt),
            EventCategory::Stack => Delta::new(UpdateKind::Stack, "stack-updated"),
            _ => Delta::new(UpdateKind::Events, "event-logged"),
        },
    }
}

// -- Session -------------------------------------------------------------------

fn sequence_start(state: &mut UnifiedState, evt: &NormalizedEvent) -> Delta {
    let session = &mut state.current_session;
    session.last_activity_at = Some(evt.time);
    if let Some(name) = get_str(evt, &["SequenceName", "Name"]) {
        session.imaging.sequence_name = Some(name.to_owned());
    }
    if session.is_active == Some(true) {
        return Delta::new(UpdateKind::Session, "sequence-started");
    }
    session.is_active = Some(true);
    session.started_at = Some(evt.time);
    Delta::new(UpdateKind::Session, "session-started")
}

fn session_end(state: &mut UnifiedState) -> Delta {
    // startedAt and target are preserved so dashboards can still show
    // what the finished session imaged.
    state.current_session.is_active = Some(false);
    state.current_session.imaging.progress = None;
    Delta::new(UpdateKind::Session, "session-ended")
}

fn target_start(state: &mut UnifiedState, evt: &NormalizedEvent) -> Delta {
    let target = Target {
        project_name: get_str(evt, &["ProjectName", "Project"]).map(str::to_owned),
        target_name: get_str(evt, &["TargetName", "Name"]).map(str::to_owned),
        ra_deg: get_f64(evt, &["RaDeg", "Ra", "RA"]),
        dec_deg: get_f64(evt, &["DecDeg", "Dec"]),
        panel_index: get_i64(evt, &["PanelIndex", "Panel"]),
        rotation_deg: get_f64(evt, &["RotationDeg", "Rotation"]),
        started_at: Some(evt.time),
        details: coordinate_strings(evt),
    };
    let name = target.target_name.clone().unwrap_or_default();

    let session = &mut state.current_session;
    session.target = Some(target);
    session.last_activity_at = Some(evt.time);
    let reason = if session.is_active == Some(true) {
        "target-changed"
    } else {
        session.is_active = Some(true);
        session.started_at = Some(evt.time);
        "session-started"
    };
    Delta::new(UpdateKind::Session, reason).with_changed(Changed {
        path: "currentSession.target".to_owned(),
        summary: format!("target {name}"),
        meta: serde_json::Map::new(),
    })
}

/// Keep pre-formatted coordinate strings alongside the scalar degrees
/// when the scheduler sends both forms.
fn coordinate_strings(evt: &NormalizedEvent) -> serde_json::Map<String, serde_json::Value> {
    let mut details = serde_json::Map::new();
    for key in ["RaString", "DecString", "Coordinates"] {
        if let Some(v) = evt.payload.get(key) {
            details.insert(key.to_owned(), v.clone());
        }
    }
    details
}

// -- Imaging -------------------------------------------------------------------

fn image_save(state: &mut UnifiedState, evt: &NormalizedEvent) -> Delta {
    let imaging = &mut state.current_session.imaging;

    if let Some(path) = get_str(evt, &["FilePath", "Path"]) {
        // lastImage.at is monotonically non-decreasing within a session.
        let newer = imaging.last_image.as_ref().map_or(true, |li| evt.time >= li.at);
        if newer {
            imaging.last_image = Some(LastImage { at: evt.time, file_path: path.to_owned() });
        }
    }
    if let Some(exp) = get_f64(evt, &["ExposureTime", "Exposure", "ExposureSeconds"]) {
        imaging.exposure_seconds = Some(exp);
    }
    if let Some(filter) = get_str(evt, &["Filter"]) {
        imaging.current_filter = Some(filter.to_owned());
    }
    let frame = get_str(evt, &["ImageType", "FrameType"]).and_then(parse_frame_type);
    if let Some(frame) = frame {
        imaging.frame_type = Some(frame);
    }
    if let (Some(index), Some(total)) =
        (get_i64(evt, &["FrameIndex", "ExposureCount"]), get_i64(evt, &["TotalFrames", "TotalExposures"]))
    {
        imaging.progress =
            Some(crate::model::Progress { frame_index: index as u32, total_frames: total as u32 });
    }

    // A saved light frame clears a sticky plate-solve alert.
    if frame == Some(FrameType::Light) {
        state.safety.alerts.retain(|a| a != ALERT_PLATESOLVE);
    }

    Delta::new(UpdateKind::Image, "image-saved").with_changed(Changed {
        path: "currentSession.imaging.lastImage".to_owned(),
        summary: summarize(evt),
        meta: ring_meta(evt),
    })
}

fn filter_change(state: &mut UnifiedState, evt: &NormalizedEvent) -> Delta {
    if let Some(filter) = get_str(evt, &["NewFilter", "Filter", "Name"]) {
        state.current_session.imaging.current_filter = Some(filter.to_owned());
    }
    // A no-op change still refreshes the equipment row's lastChange.
    upsert_equipment(state, EquipmentKind::FilterWheel, evt, Some(true), "idle");
    Delta::new(UpdateKind::Session, "filter-changed")
}

fn guider_rms(state: &mut UnifiedState, evt: &NormalizedEvent) -> Delta {
    let guiding = &mut state.current_session.guiding;
    if let Some(total) = get_f64(evt, &["RmsTotal", "Total"]) {
        guiding.last_rms_total = Some(total);
    }
    if let Some(ra) = get_f64(evt, &["RmsRa", "Ra"]) {
        guiding.last_rms_ra = Some(ra);
    }
    if let Some(dec) = get_f64(evt, &["RmsDec", "Dec"]) {
        guiding.last_rms_dec = Some(dec);
    }
    guiding.last_update = Some(evt.time);
    Delta::new(UpdateKind::Session, "guiding-rms")
}

// -- Equipment -----------------------------------------------------------------

fn equipment_event(state: &mut UnifiedState, evt: &NormalizedEvent) -> Delta {
    let Some((kind, suffix)) = parse_device(&evt.kind) else {
        return Delta::new(UpdateKind::Events, "event-logged");
    };
    let (connected, status, reason) = match suffix {
        "CONNECTED" => (Some(true), "idle", "equipment-connected"),
        "DISCONNECTED" => (Some(false), "disconnected", "equipment-disconnected"),
        "EXPOSING" => (Some(true), "exposing", "equipment-updated"),
        "TRACKING" => (Some(true), "tracking", "equipment-updated"),
        "SLEWING" => (Some(true), "slewing", "equipment-updated"),
        "HOMING" => (Some(true), "homing", "equipment-updated"),
        "HOMED" | "MOVED" | "CHANGED" | "STOPPED" => (Some(true), "idle", "equipment-updated"),
        "MOVING" => (Some(true), "moving", "equipment-updated"),
        "PARKED" => (Some(true), "parked", "equipment-updated"),
        _ => (None, "idle", "equipment-updated"),
    };
    let key = upsert_equipment(state, kind, evt, connected, status);
    equipment_delta(key, reason)
}

fn equipment_delta(key: String, reason: &str) -> Delta {
    let path = format!("equipment.{key}");
    Delta::new(UpdateKind::Equipment, reason).with_changed(Changed {
        path,
        summary: key,
        meta: serde_json::Map::new(),
    })
}

/// Split a device event kind into its equipment kind and action suffix.
fn parse_device(kind: &str) -> Option<(EquipmentKind, &str)> {
    let (prefix, suffix) = kind.split_once('-')?;
    let device = match prefix {
        "MOUNT" => EquipmentKind::Mount,
        "CAMERA" => EquipmentKind::Camera,
        "FILTERWHEEL" => EquipmentKind::FilterWheel,
        "FOCUSER" => EquipmentKind::Focuser,
        "GUIDER" => EquipmentKind::Guider,
        "ROTATOR" => EquipmentKind::Rotator,
        "SWITCH" => EquipmentKind::Switch,
        "FLAT" => EquipmentKind::FlatPanel,
        "WEATHER" => EquipmentKind::Weather,
        "DOME" => EquipmentKind::Dome,
        "SAFETYMONITOR" => EquipmentKind::SafetyMonitor,
        _ => return None,
    };
    Some((device, suffix))
}

/// Upsert an equipment row keyed `(type, id)`.
///
/// Payload fields merge into `details`, preserving keys the event does
/// not carry. Returns the table key.
fn upsert_equipment(
    state: &mut UnifiedState,
    kind: EquipmentKind,
    evt: &NormalizedEvent,
    connected: Option<bool>,
    status: &str,
) -> String {
    let id = get_str(evt, &["DeviceId", "Id"])
        .map(str::to_owned)
        .or_else(|| get_i64(evt, &["DeviceId", "Id"]).map(|n| n.to_string()))
        .unwrap_or_else(|| "0".to_owned());
    let key = kind.key(&id);

    let entry = state.equipment.entry(key.clone()).or_insert_with(|| EquipmentEntry {
        id,
        kind,
        name: kind.as_str().to_owned(),
        connected: false,
        status: "idle".to_owned(),
        last_change: evt.time,
        details: serde_json::Map::new(),
    });

    if let Some(name) = get_str(evt, &["DeviceName", "Name"]) {
        entry.name = name.to_owned();
    }
    if let Some(connected) = connected {
        entry.connected = connected;
    }
    entry.status = status.to_owned();
    entry.last_change = evt.time;
    for (k, v) in &evt.payload {
        entry.details.insert(k.clone(), v.clone());
    }
    key
}

// -- Activity classification ---------------------------------------------------

/// Pick the current activity by priority: autofocus, guiding, mount
/// slewing/homing, rotator moving, then imaging/idle.
fn classify_activity(state: &UnifiedState) -> Activity {
    let session = &state.current_session;
    if session.autofocus_running {
        return Activity::Autofocus;
    }
    if session.guiding.is_guiding {
        return Activity::Guiding;
    }
    let status_of = |kind: EquipmentKind| {
        state
            .equipment
            .values()
            .filter(|e| e.kind == kind)
            .map(|e| e.status.as_str())
            .next_back()
    };
    if matches!(status_of(EquipmentKind::Mount), Some("slewing" | "homing")) {
        return Activity::Slewing;
    }
    if status_of(EquipmentKind::Rotator) == Some("moving") {
        return Activity::Rotating;
    }
    if session.is_active == Some(true) {
        Activity::Imaging
    } else {
        Activity::Idle
    }
}

// -- Summaries and ring metadata -----------------------------------------------

/// Deterministic one-line summary per event kind for the recent-events ring.
pub fn summarize(evt: &NormalizedEvent) -> String {
    match evt.kind.as_str() {
        "IMAGE-SAVE" => match get_str(evt, &["FilePath", "Path"]) {
            Some(path) => format!("Image saved: {path}"),
            None => "Image saved".to_owned(),
        },
        "SEQUENCE-STARTING" => "Sequence starting".to_owned(),
        "SEQUENCE-STOPPED" => "Sequence stopped".to_owned(),
        "SEQUENCE-COMPLETED" | "SEQUENCE-FINISHED" => "Sequence finished".to_owned(),
        "TS-NEWTARGETSTART" | "TS-TARGETSTART" => {
            format!("Target: {}", get_str(evt, &["TargetName", "Name"]).unwrap_or("unknown"))
        }
        "FILTERWHEEL-CHANGED" => {
            match get_str(evt, &["NewFilter", "Filter", "Name"]) {
                Some(filter) => format!("Filter changed to {filter}"),
                None => "Filter changed".to_owned(),
            }
        }
        "GUIDER-START" => "Guiding started".to_owned(),
        "GUIDER-STOP" => "Guiding stopped".to_owned(),
        "GUIDER-DISCONNECTED" => "Guider disconnected".to_owned(),
        "GUIDER-RMS" => match get_f64(evt, &["RmsTotal", "Total"]) {
            Some(total) => format!("Guiding RMS {total:.2}\""),
            None => "Guiding RMS".to_owned(),
        },
        "AUTOFOCUS-START" => "Autofocus started".to_owned(),
        "AUTOFOCUS-FINISHED" => "Autofocus finished".to_owned(),
        "MOUNT-HOMED" => "Mount homed".to_owned(),
        "SAFETY-CHANGED" => match get_bool(evt, &["IsSafe", "Safe"]) {
            Some(true) => "Safety: safe".to_owned(),
            Some(false) => "Safety: unsafe".to_owned(),
            None => "Safety changed".to_owned(),
        },
        "ERROR-PLATESOLVE" => "Plate solve failed".to_owned(),
        "FLAT-LIGHT-TOGGLED" => "Flat panel light toggled".to_owned(),
        "STACK-UPDATED" => "Stack updated".to_owned(),
        kind => match parse_device(kind) {
            Some((device, "CONNECTED")) => format!("{} connected", device.as_str()),
            Some((device, "DISCONNECTED")) => format!("{} disconnected", device.as_str()),
            _ => kind.to_owned(),
        },
    }
}

/// Ring-entry metadata: image statistics and stack details ride along
/// with their events; everything else gets none.
fn ring_meta(evt: &NormalizedEvent) -> serde_json::Map<String, serde_json::Value> {
    let keys: &[&str] = match evt.category {
        EventCategory::Image => {
            &["HFR", "Stars", "Temperature", "ExposureTime", "Filter", "ImageType", "FrameType"]
        }
        EventCategory::Stack => return evt.payload.clone(),
        _ => return serde_json::Map::new(),
    };
    keys.iter()
        .filter_map(|k| evt.payload.get(*k).map(|v| ((*k).to_owned(), v.clone())))
        .collect()
}

// -- Payload accessors ---------------------------------------------------------

fn get_str<'a>(evt: &'a NormalizedEvent, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| evt.payload.get(*k).and_then(|v| v.as_str()))
}

fn get_f64(evt: &NormalizedEvent, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| {
        let v = evt.payload.get(*k)?;
        v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    })
}

fn get_i64(evt: &NormalizedEvent, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| {
        let v = evt.payload.get(*k)?;
        v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    })
}

fn get_bool(evt: &NormalizedEvent, keys: &[&str]) -> Option<bool> {
    keys.iter().find_map(|k| evt.payload.get(*k).and_then(|v| v.as_bool()))
}

fn parse_frame_type(s: &str) -> Option<FrameType> {
    match s.to_ascii_uppercase().as_str() {
        "LIGHT" => Some(FrameType::Light),
        "DARK" => Some(FrameType::Dark),
        "BIAS" => Some(FrameType::Bias),
        "FLAT" => Some(FrameType::Flat),
        _ => None,
    }
}

#[cfg(test)]
#[path = "reduce_tests.rs"]
mod tests;
