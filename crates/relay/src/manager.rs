// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The state writer: single owner of the authoritative [`UnifiedState`].
//!
//! All mutation flows through one task fed by a bounded channel:
//! normalize, reduce, persist, publish — in that order, serialized.
//! Subscribers receive `(delta, state)` pairs over a broadcast channel
//! and must not block the writer; a receiver that falls behind the
//! channel bound is dropped by its own connection handler.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::ResetError;
use crate::model::{
    Delta, StateUpdate, UnifiedState, UpdateKind, UpstreamHealth,
};
use crate::store::Store;
use crate::upstream::client::IcClient;
use crate::{normalize, reduce};

/// Bound of the writer's inbound queue. The upstream feed blocks when it
/// fills, which is fine — the upstream socket is already serialized.
const INBOUND_QUEUE: usize = 1024;

/// Broadcast capacity; doubles as the per-client outbound bound.
const BROADCAST_CAP: usize = 64;

/// How long the writer drains its queue on shutdown.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

enum Command {
    Apply(serde_json::Value),
    Housekeep,
    ParseFailure,
    Upstream(UpstreamHealth),
    Sync(oneshot::Sender<()>),
    Reset(oneshot::Sender<Result<(), ResetError>>),
}

/// Handle to the state writer task.
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<Command>,
    updates: broadcast::Sender<StateUpdate>,
    snapshot: Arc<RwLock<Arc<UnifiedState>>>,
}

impl StateManager {
    /// Spawn the writer task and return its handle.
    pub fn spawn(
        store: Store,
        ic: IcClient,
        tz: chrono_tz::Tz,
        target_expiry: chrono::Duration,
        initial: UnifiedState,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let (updates, _) = broadcast::channel(BROADCAST_CAP);
        let snapshot = Arc::new(RwLock::new(Arc::new(initial.clone())));

        let writer = Writer {
            state: initial,
            store,
            ic,
            tz,
            target_expiry,
            updates: updates.clone(),
            snapshot: Arc::clone(&snapshot),
        };
        tokio::spawn(writer.run(rx, shutdown));

        Self { tx, updates, snapshot }
    }

    /// Queue a raw upstream frame for normalization and reduction.
    /// Blocks when the writer's inbound queue is full.
    pub async fn apply(&self, raw: serde_json::Value) {
        let _ = self.tx.send(Command::Apply(raw)).await;
    }

    /// Trigger the stale-target sweep.
    pub async fn housekeep(&self) {
        let _ = self.tx.send(Command::Housekeep).await;
    }

    /// Record an upstream frame that failed JSON parsing.
    pub async fn note_parse_failure(&self) {
        let _ = self.tx.send(Command::ParseFailure).await;
    }

    /// Record upstream connectivity; transitions are broadcast.
    pub async fn set_upstream(&self, health: UpstreamHealth) {
        let _ = self.tx.send(Command::Upstream(health)).await;
    }

    /// Wait until every previously queued command has been processed.
    pub async fn sync(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Sync(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Administrative reset: clear state and the event ring, then re-seed
    /// from upstream history (or fall back to the persisted state).
    pub async fn reset(&self) -> Result<(), ResetError> {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Reset(ack)).await.is_err() {
            return Err(ResetError::SeederUnavailable);
        }
        done.await.unwrap_or(Err(ResetError::SeederUnavailable))
    }

    /// Subscribe to state updates. Each receiver gets every delta in
    /// writer order, starting from the moment of subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<StateUpdate> {
        self.updates.subscribe()
    }

    /// Immutable snapshot of the current state, safe to serialize
    /// concurrently with writer progress.
    pub async fn snapshot(&self) -> Arc<UnifiedState> {
        Arc::clone(&*self.snapshot.read().await)
    }
}

// -- Writer task ---------------------------------------------------------------

struct Writer {
    state: UnifiedState,
    store: Store,
    ic: IcClient,
    tz: chrono_tz::Tz,
    target_expiry: chrono::Duration,
    updates: broadcast::Sender<StateUpdate>,
    snapshot: Arc<RwLock<Arc<UnifiedState>>>,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.drain(&mut rx).await;
                    if let Err(e) = self.store.save_state(&self.state) {
                        tracing::warn!(err = %e, "final state save failed");
                    }
                    break;
                }
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
            }
        }
    }

    /// Drain queued commands for up to [`DRAIN_TIMEOUT`] before shutdown.
    async fn drain(&mut self, rx: &mut mpsc::Receiver<Command>) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while let Ok(Some(cmd)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            self.handle(cmd).await;
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Apply(raw) => self.apply(raw).await,
            Command::Housekeep => {
                if let Some(delta) = reduce::housekeep(&mut self.state, Utc::now(), self.target_expiry)
                {
                    tracing::info!(reason = %delta.reason, "housekeeping cleared stale target");
                    self.persist_state();
                    self.publish(delta).await;
                }
            }
            Command::ParseFailure => {
                self.state.meta.parse_failures += 1;
            }
            Command::Upstream(health) => {
                if self.state.meta.upstream != health {
                    self.state.meta.upstream = health;
                    let reason = match health {
                        UpstreamHealth::Live => "upstream-restored",
                        UpstreamHealth::Degraded => "upstream-degraded",
                    };
                    self.persist_state();
                    self.publish(Delta::new(UpdateKind::Events, reason)).await;
                }
            }
            Command::Sync(ack) => {
                let _ = ack.send(());
            }
            Command::Reset(ack) => {
                let _ = ack.send(self.reset().await);
            }
        }
    }

    async fn apply(&mut self, raw: serde_json::Value) {
        let evt = match normalize::normalize(&raw, self.tz) {
            Ok(evt) => evt,
            Err(e) => {
                self.state.meta.malformed_events += 1;
                tracing::warn!(err = %e, "dropping malformed event");
                return;
            }
        };
        let Some(delta) = reduce::reduce(&mut self.state, &evt) else {
            return; // duplicate of an event already in the ring
        };
        if let Err(e) = self.store.append_event(&evt, &raw) {
            tracing::error!(err = %e, kind = %evt.kind, "event persist failed, will retry next write");
        }
        self.persist_state();
        self.publish(delta).await;
    }

    /// Persistence failures are logged and retried on the next state
    /// change; the in-memory state stays authoritative for broadcasting.
    fn persist_state(&self) {
        if let Err(e) = self.store.save_state(&self.state) {
            tracing::error!(err = %e, "state persist failed, will retry next write");
        }
    }

    async fn publish(&mut self, delta: Delta) {
        let state = Arc::new(self.state.clone());
        *self.snapshot.write().await = Arc::clone(&state);
        let _ = self.updates.send(StateUpdate { delta, state });
    }

    async fn reset(&mut self) -> Result<(), ResetError> {
        match self.ic.event_history().await {
            Ok(events) => {
                self.store.clear()?;
                self.state = UnifiedState::default();
                for raw in &events {
                    let Ok(evt) = normalize::normalize(raw, self.tz) else {
                        self.state.meta.malformed_events += 1;
                        continue;
                    };
                    if reduce::reduce(&mut self.state, &evt).is_some() {
                        if let Err(e) = self.store.append_event(&evt, raw) {
                            tracing::error!(err = %e, "event persist failed during reset");
                        }
                    }
                }
                self.persist_state();
                self.publish(Delta::new(UpdateKind::FullSync, "reset")).await;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(err = %e, "reset: upstream history unreachable");
                match self.store.load_state()? {
                    Some(persisted) => {
                        self.state = persisted;
                        self.publish(Delta::new(UpdateKind::FullSync, "reset")).await;
                        Ok(())
                    }
                    None => Err(ResetError::SeederUnavailable),
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
