// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use crate::error::FatalError;

/// Configuration for the relay daemon.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "rigrelay", about = "Telemetry aggregator for a remote astrophotography rig")]
pub struct RelayConfig {
    /// Host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "RELAY_HOST")]
    pub host: String,

    /// Port for the HTTP/WebSocket listener.
    #[arg(long, default_value_t = 3001, env = "PORT")]
    pub port: u16,

    /// Base HTTP URL of the imaging-control application.
    #[arg(long, default_value = "http://localhost:1888", env = "IC_URL")]
    pub ic_url: String,

    /// Path of the imaging-control WebSocket endpoint.
    #[arg(long, default_value = "/v2/socket", env = "IC_WS_PATH")]
    pub ic_ws_path: String,

    /// Subscription frame sent after the upstream socket opens.
    #[arg(long, default_value = "SUBSCRIBE /v2/socket", env = "IC_SUBSCRIBE")]
    pub ic_subscribe: String,

    /// Path of the imaging-control event history endpoint.
    #[arg(long, default_value = "/event-history", env = "IC_HISTORY_PATH")]
    pub ic_history_path: String,

    /// IANA timezone used to interpret naive upstream timestamps.
    #[arg(long, default_value = "UTC", env = "IC_TZ")]
    pub ic_tz: String,

    /// Filesystem path of the embedded SQL store.
    #[arg(long, default_value = "rigrelay.db", env = "DB_PATH")]
    pub db_path: PathBuf,

    /// Hours after which a target with no newer session events is considered stale.
    #[arg(long, default_value_t = 8, env = "TARGET_EXPIRY_HOURS")]
    pub target_expiry_hours: u64,

    /// Housekeeping interval in seconds (stale-target sweep).
    #[arg(long, default_value_t = 60, env = "RELAY_HOUSEKEEP_SECS")]
    pub housekeep_secs: u64,
}

impl RelayConfig {
    /// Parse the configured IANA timezone name.
    pub fn tz(&self) -> Result<chrono_tz::Tz, FatalError> {
        self.ic_tz
            .parse()
            .map_err(|_| FatalError::Config(format!("unknown timezone {:?}", self.ic_tz)))
    }

    /// Upstream WebSocket URL derived from the HTTP base URL.
    pub fn ic_ws_url(&self) -> String {
        let ws_base = if self.ic_url.starts_with("https://") {
            self.ic_url.replacen("https://", "wss://", 1)
        } else {
            self.ic_url.replacen("http://", "ws://", 1)
        };
        format!("{}{}", ws_base.trim_end_matches('/'), self.ic_ws_path)
    }

    pub fn target_expiry(&self) -> chrono::Duration {
        chrono::Duration::hours(self.target_expiry_hours as i64)
    }

    pub fn housekeep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.housekeep_secs)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
