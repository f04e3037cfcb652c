// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP client for one-shot queries against the imaging-control app.

use reqwest::Client;

/// HTTP client wrapper for the upstream imaging-control instance.
#[derive(Clone)]
pub struct IcClient {
    base_url: String,
    history_path: String,
    client: Client,
}

impl IcClient {
    pub fn new(base_url: String, history_path: String) -> Self {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { base_url, history_path, client }
    }

    /// Fetch the bounded, chronological event history used for seeding.
    ///
    /// Accepts both the enveloped `{ "Response": [...] }` shape and a
    /// bare array.
    pub async fn event_history(&self) -> anyhow::Result<Vec<serde_json::Value>> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), self.history_path);
        let resp = self.client.get(&url).send().await?;
        let value: serde_json::Value = resp.error_for_status()?.json().await?;

        if let Some(events) = value.get("Response").and_then(|v| v.as_array()) {
            return Ok(events.clone());
        }
        if let Some(events) = value.as_array() {
            return Ok(events.clone());
        }
        anyhow::bail!("unexpected event history shape")
    }
}
