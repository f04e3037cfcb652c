// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unified observatory state and the wire types shared with dashboard
//! clients.
//!
//! All timestamps are UTC; conversion to display time is a consumer
//! concern. Field names serialize in camelCase because the state blob is
//! consumed directly by browser dashboards and round-tripped through the
//! embedded SQL store.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Capacity of the in-state recent-events ring.
pub const RECENT_EVENTS_CAP: usize = 50;

// -- Normalized events ---------------------------------------------------------

/// Canonical event category, derived from the kind string at the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Guiding,
    Session,
    Equipment,
    Image,
    Stack,
    Safety,
    Other,
}

/// A raw upstream event after normalization: canonical kind tag, UTC
/// instant, category, and the remaining payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    /// Stable key over `(kind, time, payload)` used to make history
    /// replays idempotent against live arrivals.
    pub idempotency_key: String,
    pub time: DateTime<Utc>,
    pub category: EventCategory,
    pub kind: String,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

// -- Unified state -------------------------------------------------------------

/// The single derived observatory state, replaced atomically on each update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UnifiedState {
    pub current_session: SessionState,
    /// Equipment table keyed `"{type}:{id}"`, in first-seen order.
    pub equipment: IndexMap<String, EquipmentEntry>,
    pub safety: SafetyState,
    /// Newest-first ring of the most recent normalized events.
    pub recent_events: VecDeque<RecentEvent>,
    /// Highest event time observed; chronologically-earlier events arriving
    /// later update history only, never "latest change" projections.
    pub watermark: Option<DateTime<Utc>>,
    pub meta: StateMeta,
}

impl UnifiedState {
    /// True if the ring already contains an event with this idempotency key.
    pub fn has_event(&self, idempotency_key: &str) -> bool {
        self.recent_events.iter().any(|e| e.idempotency_key == idempotency_key)
    }

    /// Insert a ring entry keeping time-descending order (ties go to the
    /// newest arrival), truncating to [`RECENT_EVENTS_CAP`].
    pub fn push_recent(&mut self, entry: RecentEvent) {
        let pos = self
            .recent_events
            .iter()
            .position(|e| e.time <= entry.time)
            .unwrap_or(self.recent_events.len());
        self.recent_events.insert(pos, entry);
        self.recent_events.truncate(RECENT_EVENTS_CAP);
    }
}

/// Imaging session bounded by sequence start/finish events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionState {
    /// Tri-state: `None` until any session-bearing event has been seen.
    pub is_active: Option<bool>,
    pub started_at: Option<DateTime<Utc>>,
    /// Time of the most recent target/sequence event; resets the
    /// stale-target clock.
    pub last_activity_at: Option<DateTime<Utc>>,
    pub target: Option<Target>,
    pub imaging: Imaging,
    pub guiding: Guiding,
    pub activity: Activity,
    /// An `AUTOFOCUS-START` has been seen without a matching finish.
    pub autofocus_running: bool,
}

/// Current imaging target, replaced whenever the scheduler announces a new one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Target {
    pub project_name: Option<String>,
    pub target_name: Option<String>,
    pub ra_deg: Option<f64>,
    pub dec_deg: Option<f64>,
    pub panel_index: Option<i64>,
    pub rotation_deg: Option<f64>,
    /// When this target was set; drives the stale-target safeguard.
    pub started_at: Option<DateTime<Utc>>,
    /// Pre-formatted coordinate strings and other extras, kept as sent.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Imaging {
    pub current_filter: Option<String>,
    pub exposure_seconds: Option<f64>,
    pub frame_type: Option<FrameType>,
    pub sequence_name: Option<String>,
    pub progress: Option<Progress>,
    pub last_image: Option<LastImage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameType {
    Light,
    Dark,
    Bias,
    Flat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Progress {
    pub frame_index: u32,
    pub total_frames: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastImage {
    pub at: DateTime<Utc>,
    pub file_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Guiding {
    pub is_guiding: bool,
    pub since: Option<DateTime<Utc>>,
    pub last_rms_total: Option<f64>,
    pub last_rms_ra: Option<f64>,
    pub last_rms_dec: Option<f64>,
    pub last_update: Option<DateTime<Utc>>,
}

/// What the rig is doing right now, by priority: autofocus, guiding,
/// slewing, rotating, then imaging/idle from the session flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Autofocus,
    Guiding,
    Slewing,
    Rotating,
    Imaging,
    #[default]
    Idle,
}

// -- Equipment -----------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EquipmentKind {
    Mount,
    Camera,
    FilterWheel,
    Focuser,
    Guider,
    Rotator,
    Switch,
    FlatPanel,
    Weather,
    Dome,
    SafetyMonitor,
}

impl EquipmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Camera => "camera",
            Self::FilterWheel => "filterWheel",
            Self::Focuser => "focuser",
            Self::Guider => "guider",
            Self::Rotator => "rotator",
            Self::Switch => "switch",
            Self::FlatPanel => "flatPanel",
            Self::Weather => "weather",
            Self::Dome => "dome",
            Self::SafetyMonitor => "safetyMonitor",
        }
    }

    /// Composite equipment-table key for a device of this kind.
    pub fn key(&self, id: &str) -> String {
        format!("{}:{id}", self.as_str())
    }
}

/// One device row in the equipment table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EquipmentEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EquipmentKind,
    pub name: String,
    pub connected: bool,
    pub status: String,
    pub last_change: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

// -- Safety --------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SafetyState {
    pub is_safe: Option<bool>,
    pub changed_at: Option<DateTime<Utc>>,
    /// Sticky alerts, e.g. a failed plate solve; cleared by the next LIGHT
    /// frame save or guiding start.
    pub alerts: Vec<String>,
}

/// Alert raised on `ERROR-PLATESOLVE`.
pub const ALERT_PLATESOLVE: &str = "plate-solve-failed";

// -- Recent events ring --------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentEvent {
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
    pub idempotency_key: String,
}

// -- State metadata ------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamHealth {
    Live,
    #[default]
    Degraded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateMeta {
    pub upstream: UpstreamHealth,
    /// Frames dropped before the reducer: missing kind/time or bad timestamps.
    pub malformed_events: u64,
    /// Upstream frames that failed JSON parsing.
    pub parse_failures: u64,
}

// -- Deltas and the outbound envelope ------------------------------------------

/// Which state subtree a reduction touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateKind {
    FullSync,
    Session,
    Equipment,
    Image,
    Stack,
    Safety,
    Events,
    Heartbeat,
}

/// Descriptor of the changed subtree attached to a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Changed {
    pub path: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

/// Result of one reduction: the touched subtree and a reason code.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub kind: UpdateKind,
    pub reason: String,
    pub changed: Option<Changed>,
}

impl Delta {
    pub fn new(kind: UpdateKind, reason: impl Into<String>) -> Self {
        Self { kind, reason: reason.into(), changed: None }
    }

    pub fn with_changed(mut self, changed: Changed) -> Self {
        self.changed = Some(changed);
        self
    }
}

/// A state change published by the writer to all subscribers.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub delta: Delta,
    pub state: Arc<UnifiedState>,
}

/// Envelope for every message sent to a dashboard client.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<'a> {
    pub schema_version: u32,
    pub timestamp: DateTime<Utc>,
    pub update_kind: UpdateKind,
    pub update_reason: &'a str,
    pub changed: Option<&'a Changed>,
    pub state: &'a UnifiedState,
}

impl<'a> Envelope<'a> {
    pub fn new(
        kind: UpdateKind,
        reason: &'a str,
        changed: Option<&'a Changed>,
        state: &'a UnifiedState,
    ) -> Self {
        Self {
            schema_version: 1,
            timestamp: Utc::now(),
            update_kind: kind,
            update_reason: reason,
            changed,
            state,
        }
    }
}

#[cfg(test)]
#[path = "model_tests.rs"]
mod tests;
