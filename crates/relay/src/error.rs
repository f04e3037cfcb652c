// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error kinds and their recovery policy.
//!
//! Most failures here are absorbed, not propagated: malformed events are
//! counted and dropped, persistence hiccups leave the in-memory state
//! authoritative, and an unreachable upstream only degrades the state
//! envelope. The two fatal variants map to process exit codes.

use std::path::PathBuf;

/// A raw upstream frame that cannot be turned into a normalized event.
///
/// These never reach the reducer — the writer counts and drops them.
#[derive(Debug, thiserror::Error)]
pub enum MalformedEvent {
    #[error("event has no kind field")]
    MissingKind,
    #[error("event has no time field")]
    MissingTime,
    #[error("unparseable event time {0:?}")]
    BadTime(String),
}

/// Failure writing to or reading from the embedded SQL store.
///
/// Writes are retried on the next state change; the in-memory state stays
/// authoritative for broadcasting in the meantime.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Administrative reset could not rebuild any state at all.
#[derive(Debug, thiserror::Error)]
pub enum ResetError {
    #[error("upstream history unreachable and no persisted state")]
    SeederUnavailable,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Startup failure, mapped to a process exit code.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("cannot open event store at {path}: {source}")]
    Init {
        path: PathBuf,
        #[source]
        source: StoreError,
    },
    #[error("cannot bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config: {0}")]
    Config(String),
    #[error("server: {0}")]
    Serve(#[from] std::io::Error),
}

impl FatalError {
    /// Exit code for the process: 1 for init failures, 2 for config errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Init { .. } | Self::Bind { .. } | Self::Serve(_) => 1,
        }
    }
}
