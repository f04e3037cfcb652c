// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Event normalization: raw upstream frames become [`NormalizedEvent`]s.
//!
//! The upstream stream mixes zoned and naive timestamps and has grown
//! three frame shapes over time (`Event`/`Type`/`kind` tags, payload
//! under `Data` or inline). Everything is canonicalized here, once, at
//! the edge; nothing downstream touches timezones again.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};

use crate::error::MalformedEvent;
use crate::model::{EventCategory, NormalizedEvent};

/// Normalize a raw upstream message.
///
/// Naive timestamps are interpreted in `tz`; offset-carrying timestamps
/// keep their offset. Events without a kind or a parseable time are
/// rejected and never reach the reducer.
pub fn normalize(raw: &serde_json::Value, tz: Tz) -> Result<NormalizedEvent, MalformedEvent> {
    let kind = extract_str(raw, &["Event", "Type", "kind", "type"])
        .ok_or(MalformedEvent::MissingKind)?
        .to_owned();

    let time_str = extract_str(raw, &["Time", "time"]).ok_or(MalformedEvent::MissingTime)?;
    let time = parse_time(time_str, tz)?;

    let payload = extract_payload(raw);
    let category = categorize(&kind);
    let idempotency_key = idempotency_key(&kind, time, &payload);

    Ok(NormalizedEvent { idempotency_key, time, category, kind, payload })
}

fn extract_str<'a>(raw: &'a serde_json::Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| raw.get(k).and_then(|v| v.as_str()))
}

/// Payload is whatever `Data`/`data` holds, or the remaining top-level
/// fields for flat frames.
fn extract_payload(raw: &serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    for key in ["Data", "data"] {
        if let Some(obj) = raw.get(key).and_then(|v| v.as_object()) {
            return obj.clone();
        }
    }
    let Some(obj) = raw.as_object() else {
        return serde_json::Map::new();
    };
    obj.iter()
        .filter(|(k, _)| !matches!(k.as_str(), "Event" | "Type" | "kind" | "type" | "Time" | "time"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Parse an upstream timestamp into a UTC instant.
fn parse_time(s: &str, tz: Tz) -> Result<DateTime<Utc>, MalformedEvent> {
    if let Ok(zoned) = DateTime::parse_from_rfc3339(s) {
        return Ok(zoned.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            // Ambiguous local times (DST fold) resolve to the earlier instant.
            return tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|t| t.with_timezone(&Utc))
                .ok_or_else(|| MalformedEvent::BadTime(s.to_owned()));
        }
    }
    Err(MalformedEvent::BadTime(s.to_owned()))
}

/// Device prefixes whose events land in the equipment category.
const DEVICE_PREFIXES: &[&str] = &[
    "MOUNT-",
    "CAMERA-",
    "FILTERWHEEL-",
    "FOCUSER-",
    "ROTATOR-",
    "SWITCH-",
    "FLAT-",
    "WEATHER-",
    "DOME-",
    "SAFETYMONITOR-",
];

/// Derive the canonical category from a kind tag.
pub fn categorize(kind: &str) -> EventCategory {
    if kind == "FLAT-LIGHT-TOGGLED" || kind == "ERROR-PLATESOLVE" || kind.starts_with("SAFETY-") {
        return EventCategory::Safety;
    }
    if kind.starts_with("GUIDER-") {
        return EventCategory::Guiding;
    }
    if kind.starts_with("IMAGE-") {
        return EventCategory::Image;
    }
    if kind.starts_with("STACK-") {
        return EventCategory::Stack;
    }
    if kind.starts_with("TS-") || kind.starts_with("SEQUENCE-") || kind.starts_with("AUTOFOCUS-") {
        return EventCategory::Session;
    }
    if DEVICE_PREFIXES.iter().any(|p| kind.starts_with(p)) {
        return EventCategory::Equipment;
    }
    EventCategory::Other
}

/// Stable key over `(kind, time, payload fingerprint)`.
///
/// History replays carry the same three inputs as the live arrivals they
/// duplicate, so the key lets the reducer short-circuit on events already
/// present in the ring.
fn idempotency_key(
    kind: &str,
    time: DateTime<Utc>,
    payload: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let fingerprint =
        serde_json::to_string(&serde_json::Value::Object(payload.clone())).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b"|");
    hasher.update(time.to_rfc3339().as_bytes());
    hasher.update(b"|");
    hasher.update(fingerprint.as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
#[path = "normalize_tests.rs"]
mod tests;
