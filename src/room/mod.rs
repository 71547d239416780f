//! The Room actor: owns one room's [`RoomState`] exclusively
//! and is the only thing ever allowed to mutate it. Every other module
//! talks to a room through a [`RoomHandle`], never the state directly.
//!
//! Uses the mailbox-actor shape for per-shard state ownership: a command
//! enum, a cloneable handle, and `oneshot` replies for anything the caller
//! needs back.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::broadcaster;
use crate::coordinator::{encode_for_wire, Coordinator};
use crate::delta::{self, compute_delta, is_empty, EntityDelta, FullDelta, SnapshotRecord};
use crate::entity::{merge_fields, Entity, EntityId, EntityMap};
use crate::error::EngineError;
use crate::protocol::BinaryFrame;
use crate::telemetry::Metrics;

pub type RoomId = String;
pub type SessionId = String;

/// Recommended default resource bound (§5): rooms reject new entities past
/// this count. Existing entities can still be updated; only inserts of a
/// brand-new `entityId` are turned away.
pub const MAX_ENTITIES_PER_ROOM: usize = 100;

/// Recommended default snapshot cadence, in locally-applied ticks.
pub const DEFAULT_SNAPSHOT_INTERVAL_TICKS: u64 = 100;

/// Fresh: created, no session has attached yet. Active: at least one local
/// session attached. Draining: the last local session detached (remote
/// deltas keep applying while draining; cold remote-only rooms are never
/// garbage-collected by design, so Draining never times out into
/// Destroyed on its own). Destroyed: torn down via an explicit
/// [`RoomCommand::Shutdown`] from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomLifecycle {
    Fresh,
    Active,
    Draining,
    Destroyed,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RoomStats {
    pub room_id: RoomId,
    pub entity_count: usize,
    pub session_count: usize,
    pub seq: u64,
    pub tick: u64,
    pub lifecycle: String,
    pub is_applying_remote: bool,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: RoomId,
    pub entities: EntityMap,
    pub seq: u64,
    pub tick: u64,
}

impl RoomState {
    fn fresh(room_id: RoomId) -> Self {
        Self { room_id, entities: EntityMap::new(), seq: 0, tick: 0 }
    }

    fn from_snapshot(room_id: RoomId, snapshot: SnapshotRecord) -> Self {
        Self { room_id, entities: snapshot.entities, seq: snapshot.seq, tick: snapshot.tick }
    }
}

enum RoomCommand {
    Attach {
        session_id: SessionId,
        sink: mpsc::UnboundedSender<Vec<u8>>,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Detach {
        session_id: SessionId,
    },
    ApplyInput {
        player_entity_id: EntityId,
        payload: Entity,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    ApplyRemoteDelta {
        fd: FullDelta,
        reply: oneshot::Sender<bool>,
    },
    RemoveEntity {
        entity_id: EntityId,
    },
    GetSnapshotMessage {
        reply: oneshot::Sender<Vec<u8>>,
    },
    SaveSnapshot {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    GetStats {
        reply: oneshot::Sender<RoomStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A cheaply-cloneable reference to a running room actor.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: RoomId,
    tx: mpsc::UnboundedSender<RoomCommand>,
    /// Test/debug-observable marker: true only for the duration of an
    /// `ApplyRemoteDelta` handler body. Correctness of "no publish while
    /// applying a remote delta" does not depend on this flag — it holds by
    /// construction, since `ApplyRemoteDelta`'s handler never calls
    /// `publish` — but the flag keeps the invariant directly testable.
    applying_remote: Arc<AtomicBool>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote.load(Ordering::SeqCst)
    }

    /// Attach a session's local sink and receive the current snapshot as an
    /// encoded binary frame to send immediately.
    pub async fn attach(
        &self,
        session_id: SessionId,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Vec<u8>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Attach { session_id, sink, reply })?;
        rx.await.map_err(|_| EngineError::Coordinator("room actor gone".into()))
    }

    pub fn detach(&self, session_id: SessionId) -> Result<(), EngineError> {
        self.send(RoomCommand::Detach { session_id })
    }

    pub async fn apply_input(&self, player_entity_id: EntityId, payload: Entity) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::ApplyInput { player_entity_id, payload, reply })?;
        rx.await.map_err(|_| EngineError::Coordinator("room actor gone".into()))?
    }

    pub async fn apply_remote_delta(&self, fd: FullDelta) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::ApplyRemoteDelta { fd, reply })?;
        rx.await.map_err(|_| EngineError::Coordinator("room actor gone".into()))
    }

    pub fn remove_entity(&self, entity_id: EntityId) -> Result<(), EngineError> {
        self.send(RoomCommand::RemoveEntity { entity_id })
    }

    pub async fn get_snapshot_message(&self) -> Result<Vec<u8>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::GetSnapshotMessage { reply })?;
        rx.await.map_err(|_| EngineError::Coordinator("room actor gone".into()))
    }

    pub async fn save_snapshot(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::SaveSnapshot { reply })?;
        rx.await.map_err(|_| EngineError::Coordinator("room actor gone".into()))?
    }

    pub async fn get_stats(&self) -> Result<RoomStats, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::GetStats { reply })?;
        rx.await.map_err(|_| EngineError::Coordinator("room actor gone".into()))
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(RoomCommand::Shutdown { reply })?;
        let _ = rx.await;
        Ok(())
    }

    fn send(&self, cmd: RoomCommand) -> Result<(), EngineError> {
        self.tx
            .send(cmd)
            .map_err(|_| EngineError::Coordinator("room actor gone".into()))
    }
}

struct RoomActor {
    state: RoomState,
    lifecycle: RoomLifecycle,
    sessions: HashMap<SessionId, mpsc::UnboundedSender<Vec<u8>>>,
    coordinator: Arc<dyn Coordinator>,
    instance_id: String,
    applying_remote: Arc<AtomicBool>,
    metrics: Arc<Metrics>,
    snapshot_interval_ticks: u64,
    last_snapshot_tick: u64,
}

impl RoomActor {
    fn channel_name(&self) -> String {
        format!("room:{}:channel", self.state.room_id)
    }

    fn snapshot_key(&self) -> String {
        format!("room:{}:snapshot", self.state.room_id)
    }

    fn encode_snapshot_frame(&self) -> Vec<u8> {
        let frame = BinaryFrame::Snapshot {
            room_id: self.state.room_id.clone(),
            entities: self.state.entities.clone(),
            tick: self.state.tick,
            seq: self.state.seq,
        };
        delta::encode_binary(&frame).unwrap_or_default()
    }

    /// Called only from locally-originated mutations (`ApplyInput`,
    /// `RemoveEntity`). Remote delta absorption never reaches here, so
    /// snapshot cadence is driven solely by this instance's own ticks —
    /// every instance in the fleet would otherwise redundantly persist the
    /// same state on every fan-out.
    ///
    /// `seq`/`tick` advance unconditionally on every local mutation, even
    /// one whose computed delta turns out empty (e.g. a same-millisecond
    /// input that reproduces the entity's current fields): every successful
    /// `applyInput`/`removeEntity` must leave `new.seq > old.seq`. Only the
    /// broadcast/publish/snapshot-trigger steps that follow are conditioned
    /// on the delta being non-empty.
    async fn apply_local_mutation(&mut self, entity_delta: EntityDelta) {
        self.state.seq += 1;
        self.state.tick += 1;

        if self.state.tick.saturating_sub(self.last_snapshot_tick) >= self.snapshot_interval_ticks {
            self.spawn_snapshot_save();
        }

        if is_empty(&entity_delta) {
            return;
        }

        let fd = FullDelta {
            room_id: self.state.room_id.clone(),
            delta: entity_delta,
            tick: self.state.tick,
            seq: self.state.seq,
            ts: now_millis(),
            instance_id: self.instance_id.clone(),
        };

        self.broadcast_locally(&fd);

        match delta::encode_binary(&fd) {
            Ok(bytes) => {
                let channel = self.channel_name();
                let payload = encode_for_wire(&bytes).into_bytes();
                match self.coordinator.publish(&channel, payload).await {
                    Ok(()) => self.metrics.deltas_published.inc(),
                    Err(e) => warn!(room_id = %self.state.room_id, error = %e, "failed to publish delta"),
                }
            }
            Err(e) => warn!(room_id = %self.state.room_id, error = %e, "failed to encode delta"),
        }
    }

    fn broadcast_locally(&self, fd: &FullDelta) {
        let frame = BinaryFrame::Delta(fd.clone());
        match delta::encode_binary(&frame) {
            Ok(bytes) => broadcaster::broadcast(&self.sessions, &bytes),
            Err(e) => warn!(room_id = %self.state.room_id, error = %e, "failed to encode local delta frame"),
        }
    }

    /// Fire off a snapshot save without blocking the actor's mailbox loop.
    /// `last_snapshot_tick` advances immediately (optimistically) so a
    /// failed save doesn't retry on every subsequent tick — only the next
    /// full cadence window retries, matching the "next interval retries"
    /// failure policy.
    fn spawn_snapshot_save(&mut self) {
        self.last_snapshot_tick = self.state.tick;
        let record = SnapshotRecord {
            entities: self.state.entities.clone(),
            seq: self.state.seq,
            tick: self.state.tick,
            timestamp: now_millis(),
            instance_id: self.instance_id.clone(),
        };
        let coordinator = self.coordinator.clone();
        let key = self.snapshot_key();
        let room_id = self.state.room_id.clone();
        tokio::spawn(async move {
            let result = match delta::encode_binary(&record) {
                Ok(bytes) => coordinator.hash_set(&key, "data", bytes).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(room_id = %room_id, error = %e, "failed to save periodic snapshot");
            }
        });
    }

    async fn handle(&mut self, cmd: RoomCommand) -> bool {
        match cmd {
            RoomCommand::Attach { session_id, sink, reply } => {
                let frame = self.encode_snapshot_frame();
                self.sessions.insert(session_id, sink);
                if self.lifecycle == RoomLifecycle::Fresh || self.lifecycle == RoomLifecycle::Draining {
                    self.lifecycle = RoomLifecycle::Active;
                }
                let _ = reply.send(frame);
            }
            RoomCommand::Detach { session_id } => {
                self.sessions.remove(&session_id);
                if self.sessions.is_empty() && self.lifecycle == RoomLifecycle::Active {
                    self.lifecycle = RoomLifecycle::Draining;
                }
            }
            RoomCommand::ApplyInput { player_entity_id, payload, reply } => {
                let is_new_entity = !self.state.entities.contains_key(&player_entity_id);
                if is_new_entity && self.state.entities.len() >= MAX_ENTITIES_PER_ROOM {
                    let _ = reply.send(Err(EngineError::RoomFull));
                } else {
                    let before = self.state.entities.clone();
                    let entry = self.state.entities.entry(player_entity_id).or_default();
                    merge_fields(entry, &payload);
                    entry.insert("lastUpdate".to_string(), crate::entity::Value::Int(now_millis()));
                    let entity_delta = compute_delta(&before, &self.state.entities);
                    self.apply_local_mutation(entity_delta).await;
                    let _ = reply.send(Ok(()));
                }
            }
            RoomCommand::RemoveEntity { entity_id } => {
                if self.state.entities.remove(&entity_id).is_some() {
                    let mut entity_delta = EntityDelta::new();
                    entity_delta.insert(entity_id, crate::delta::EntityChange::Removed);
                    self.apply_local_mutation(entity_delta).await;
                }
            }
            RoomCommand::ApplyRemoteDelta { fd, reply } => {
                // Acceptance predicate (§4.2): reject own-echo and stale/
                // duplicate sequences. The subscriber boundary in
                // `remote_sync` already filters own-echo before this call
                // ever happens in production, but this check is the actual
                // correctness guarantee — it must hold regardless of how
                // `apply_remote_delta` gets invoked.
                let accepted = fd.instance_id != self.instance_id && fd.seq > self.state.seq;
                if accepted {
                    self.applying_remote.store(true, Ordering::SeqCst);
                    crate::delta::apply_delta(&mut self.state.entities, &fd.delta);
                    self.state.seq = fd.seq;
                    self.state.tick = self.state.tick.max(fd.tick);
                    self.broadcast_locally(&fd);
                    self.applying_remote.store(false, Ordering::SeqCst);
                    self.metrics.deltas_applied_remote.inc();
                } else {
                    self.metrics.stale_deltas_rejected.inc();
                    debug!(
                        room_id = %self.state.room_id,
                        local_seq = self.state.seq,
                        remote_seq = fd.seq,
                        "rejected stale remote delta"
                    );
                }
                let _ = reply.send(accepted);
            }
            RoomCommand::GetSnapshotMessage { reply } => {
                let _ = reply.send(self.encode_snapshot_frame());
            }
            RoomCommand::SaveSnapshot { reply } => {
                let record = SnapshotRecord {
                    entities: self.state.entities.clone(),
                    seq: self.state.seq,
                    tick: self.state.tick,
                    timestamp: now_millis(),
                    instance_id: self.instance_id.clone(),
                };
                let result = match delta::encode_binary(&record) {
                    Ok(bytes) => self.coordinator.hash_set(&self.snapshot_key(), "data", bytes).await,
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            RoomCommand::GetStats { reply } => {
                let _ = reply.send(RoomStats {
                    room_id: self.state.room_id.clone(),
                    entity_count: self.state.entities.len(),
                    session_count: self.sessions.len(),
                    seq: self.state.seq,
                    tick: self.state.tick,
                    lifecycle: format!("{:?}", self.lifecycle),
                    is_applying_remote: self.applying_remote.load(Ordering::SeqCst),
                });
            }
            RoomCommand::Shutdown { reply } => {
                self.lifecycle = RoomLifecycle::Destroyed;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Spawn a new room actor, optionally recovered from a persisted snapshot,
/// and return the handle other modules use to talk to it.
pub fn spawn(
    room_id: RoomId,
    recovered: Option<SnapshotRecord>,
    coordinator: Arc<dyn Coordinator>,
    instance_id: String,
    metrics: Arc<Metrics>,
    snapshot_interval_ticks: u64,
) -> RoomHandle {
    let state = match recovered {
        Some(snapshot) => RoomState::from_snapshot(room_id.clone(), snapshot),
        None => RoomState::fresh(room_id.clone()),
    };
    let last_snapshot_tick = state.tick;

    let (tx, mut rx) = mpsc::unbounded_channel::<RoomCommand>();
    let applying_remote = Arc::new(AtomicBool::new(false));
    let handle = RoomHandle { room_id: room_id.clone(), tx, applying_remote: applying_remote.clone() };

    let mut actor = RoomActor {
        state,
        lifecycle: RoomLifecycle::Fresh,
        sessions: HashMap::new(),
        coordinator,
        instance_id,
        applying_remote,
        metrics,
        snapshot_interval_ticks,
        last_snapshot_tick,
    };

    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            if !actor.handle(cmd).await {
                break;
            }
        }
    });

    handle
}
