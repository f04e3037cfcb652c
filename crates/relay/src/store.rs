// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Embedded SQL store: a bounded persistent event ring and the latest
//! derived state.
//!
//! Only the writer task touches the connection, so there is no pooling.
//! The event ring is pruned to the newest [`EVENT_RING_CAP`] rows inside
//! the same transaction as each insert.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::model::{NormalizedEvent, UnifiedState};

/// Maximum number of rows retained in `session_events`.
pub const EVENT_RING_CAP: usize = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS session_events (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT,
    time_utc   TEXT,
    raw_json   TEXT,
    created_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_time ON session_events(time_utc);
CREATE TABLE IF NOT EXISTS session_state (
    id           INTEGER PRIMARY KEY CHECK(id = 1),
    state_json   TEXT,
    last_updated TEXT
);
";

/// One persisted row from the event ring, newest-first on reads.
#[derive(Debug, Clone)]
pub struct PersistedEvent {
    pub id: i64,
    pub event_type: String,
    pub time_utc: String,
    pub raw_json: String,
    pub created_at: String,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at `path`, creating the schema if absent.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Append an event row and prune the ring to the newest
    /// [`EVENT_RING_CAP`] by `(time_utc, id)`, atomically.
    pub fn append_event(
        &mut self,
        evt: &NormalizedEvent,
        raw: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let raw_json = serde_json::to_string(raw)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO session_events (event_type, time_utc, raw_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![evt.kind, evt.time.to_rfc3339(), raw_json, Utc::now().to_rfc3339()],
        )?;
        tx.execute(
            "DELETE FROM session_events WHERE id NOT IN (
                 SELECT id FROM session_events
                 ORDER BY time_utc DESC, id DESC LIMIT ?1
             )",
            params![EVENT_RING_CAP as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Upsert the single current-state row.
    pub fn save_state(&self, state: &UnifiedState) -> Result<(), StoreError> {
        let state_json = serde_json::to_string(state)?;
        self.conn.execute(
            "INSERT INTO session_state (id, state_json, last_updated) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET state_json = ?1, last_updated = ?2",
            params![state_json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Load the stored state, if any. A corrupt blob is discarded with a
    /// warning so the seeder can rebuild from history.
    pub fn load_state(&self) -> Result<Option<UnifiedState>, StoreError> {
        let json: Option<String> = self
            .conn
            .query_row("SELECT state_json FROM session_state WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        let Some(json) = json else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                tracing::warn!(err = %e, "discarding corrupt persisted state");
                Ok(None)
            }
        }
    }

    /// Return the newest `n` events, newest-first by `(time_utc, id)`.
    pub fn load_recent(&self, n: usize) -> Result<Vec<PersistedEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event_type, time_utc, raw_json, created_at FROM session_events
             ORDER BY time_utc DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![n as i64], |row| {
            Ok(PersistedEvent {
                id: row.get(0)?,
                event_type: row.get(1)?,
                time_utc: row.get(2)?,
                raw_json: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Number of rows currently in the event ring.
    pub fn event_count(&self) -> Result<usize, StoreError> {
        let count: i64 =
            self.conn.query_row("SELECT COUNT(*) FROM session_events", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Administrative truncate of both tables, for reset.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.conn.execute("DELETE FROM session_events", [])?;
        self.conn.execute("DELETE FROM session_state", [])?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
