//! Room Registry: the process-wide `roomId -> RoomHandle`
//! table, with de-duplicated concurrent creation and snapshot recovery on
//! first access.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::delta::{self, SnapshotRecord};
use crate::room::{self, RoomHandle, RoomId, RoomStats, SessionId};
use crate::telemetry::Metrics;

#[derive(Debug, Serialize)]
pub struct RegistryStats {
    pub room_count: usize,
    pub session_count: usize,
    pub rooms: Vec<RoomStats>,
}

pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, RoomHandle>>,
    in_flight: Mutex<HashMap<RoomId, Arc<Notify>>>,
    coordinator: Arc<dyn Coordinator>,
    instance_id: String,
    metrics: Arc<Metrics>,
    snapshot_interval_ticks: u64,
}

impl RoomRegistry {
    pub fn new(coordinator: Arc<dyn Coordinator>, instance_id: String, metrics: Arc<Metrics>) -> Arc<Self> {
        Self::with_snapshot_interval(coordinator, instance_id, metrics, room::DEFAULT_SNAPSHOT_INTERVAL_TICKS)
    }

    pub fn with_snapshot_interval(
        coordinator: Arc<dyn Coordinator>,
        instance_id: String,
        metrics: Arc<Metrics>,
        snapshot_interval_ticks: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            rooms: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            coordinator,
            instance_id,
            metrics,
            snapshot_interval_ticks,
        })
    }

    /// Return the handle for `room_id`, creating (and, if a snapshot
    /// exists, recovering) it first if necessary. Concurrent callers for
    /// the same `room_id` converge on the same creation instead of racing
    /// two `RoomActor`s into existence.
    pub async fn get_or_create(&self, room_id: &str) -> RoomHandle {
        const NOTIFY_POLL_INTERVAL: Duration = Duration::from_millis(25);

        loop {
            if let Some(handle) = self.rooms.lock().get(room_id).cloned() {
                return handle;
            }

            let wait_on = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get(room_id) {
                    Some(notify) => Some(notify.clone()),
                    None => {
                        in_flight.insert(room_id.to_string(), Arc::new(Notify::new()));
                        None
                    }
                }
            };

            match wait_on {
                Some(notify) => {
                    // `notify_waiters()` only wakes futures already parked in
                    // its waiter queue; `Notified` registers lazily on first
                    // poll, so a notification fired between dropping the
                    // `in_flight` lock above and this await can be missed,
                    // which would hang this caller forever. Bound the wait
                    // and re-check the rooms map on timeout instead of
                    // trusting the notification alone.
                    let _ = tokio::time::timeout(NOTIFY_POLL_INTERVAL, notify.notified()).await;
                }
                None => return self.create_room(room_id).await,
            }
        }
    }

    async fn create_room(&self, room_id: &str) -> RoomHandle {
        let recovered = self.load_snapshot(room_id).await;
        if recovered.is_some() {
            info!(room_id, "recovered room from snapshot");
        }
        let handle = room::spawn(
            room_id.to_string(),
            recovered,
            self.coordinator.clone(),
            self.instance_id.clone(),
            self.metrics.clone(),
            self.snapshot_interval_ticks,
        );

        self.rooms.lock().insert(room_id.to_string(), handle.clone());
        self.metrics.rooms_active.set(self.rooms.lock().len() as i64);
        if let Some(notify) = self.in_flight.lock().remove(room_id) {
            notify.notify_waiters();
        }
        handle
    }

    async fn load_snapshot(&self, room_id: &str) -> Option<SnapshotRecord> {
        let key = format!("room:{room_id}:snapshot");
        let fields = match self.coordinator.hash_get_all(&key).await {
            Ok(f) => f,
            Err(e) => {
                warn!(room_id, error = %e, "failed to load snapshot, starting fresh");
                return None;
            }
        };
        let bytes = fields.get("data")?;
        match delta::decode_binary::<SnapshotRecord>(bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(room_id, error = %e, "failed to decode snapshot, starting fresh");
                None
            }
        }
    }

    /// A session joins `room_id`: creates the room if needed and attaches
    /// the session's sink, returning the initial snapshot frame to send.
    pub async fn join(
        &self,
        room_id: &str,
        session_id: SessionId,
        sink: tokio::sync::mpsc::UnboundedSender<Vec<u8>>,
    ) -> Vec<u8> {
        let handle = self.get_or_create(room_id).await;
        handle.attach(session_id, sink).await.unwrap_or_default()
    }

    /// Detach a session from a room it previously joined. No-op if the
    /// room no longer exists. If this was the room's last session, the
    /// room is destroyed (final snapshot flushed first) — the actor's
    /// single mailbox guarantees the `Detach` this issues is applied
    /// before the stats check that follows it.
    pub async fn leave(&self, room_id: &str, session_id: SessionId) {
        let Some(handle) = self.rooms.lock().get(room_id).cloned() else {
            return;
        };
        let _ = handle.detach(session_id);
        if let Ok(stats) = handle.get_stats().await {
            if stats.session_count == 0 {
                self.destroy(room_id).await;
            }
        }
    }

    pub fn get(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.lock().get(room_id).cloned()
    }

    /// Tear down a room immediately, regardless of lifecycle state, after
    /// a best-effort final snapshot flush.
    pub async fn destroy(&self, room_id: &str) {
        let handle = self.rooms.lock().remove(room_id);
        self.metrics.rooms_active.set(self.rooms.lock().len() as i64);
        if let Some(handle) = handle {
            if let Err(e) = handle.save_snapshot().await {
                warn!(room_id, error = %e, "failed to flush final snapshot on destroy");
            }
            let _ = handle.shutdown().await;
        }
    }

    /// Persist every live room's state (the periodic snapshot interval
    /// and graceful-shutdown save both call through here).
    pub async fn save_all_snapshots(&self) {
        let handles: Vec<RoomHandle> = self.rooms.lock().values().cloned().collect();
        for handle in handles {
            if let Err(e) = handle.save_snapshot().await {
                warn!(room_id = handle.room_id(), error = %e, "failed to save snapshot");
            }
        }
    }

    pub async fn get_stats(&self) -> RegistryStats {
        let handles: Vec<RoomHandle> = self.rooms.lock().values().cloned().collect();
        let mut rooms = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(stats) = handle.get_stats().await {
                rooms.push(stats);
            }
        }
        let session_count = rooms.iter().map(|r| r.session_count).sum();
        RegistryStats { room_count: rooms.len(), session_count, rooms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::InMemoryCoordinator;

    fn test_metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new().unwrap())
    }

    #[tokio::test]
    async fn get_or_create_returns_same_handle_for_concurrent_callers() {
        let coord = InMemoryCoordinator::new();
        let registry = RoomRegistry::new(coord, "A".into(), test_metrics());

        let r1 = Arc::clone(&registry);
        let r2 = Arc::clone(&registry);
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.get_or_create("r1").await }),
            tokio::spawn(async move { r2.get_or_create("r1").await }),
        );

        assert_eq!(a.unwrap().room_id(), b.unwrap().room_id());
        assert_eq!(registry.get_stats().await.room_count, 1);
    }

    #[tokio::test]
    async fn destroy_removes_room_from_registry() {
        let coord = InMemoryCoordinator::new();
        let registry = RoomRegistry::new(coord, "A".into(), test_metrics());
        registry.get_or_create("r1").await;
        assert!(registry.get("r1").is_some());

        registry.destroy("r1").await;
        assert!(registry.get("r1").is_none());
    }

    #[tokio::test]
    async fn join_recovers_from_saved_snapshot() {
        let coord = InMemoryCoordinator::new();
        let registry = RoomRegistry::new(coord.clone(), "A".into(), test_metrics());

        let handle = registry.get_or_create("r1").await;
        handle
            .apply_input("p1".into(), [("x".to_string(), crate::entity::Value::Int(3))].into_iter().collect())
            .await
            .unwrap();
        handle.save_snapshot().await.unwrap();
        registry.destroy("r1").await;

        let registry2 = RoomRegistry::new(coord, "A".into(), test_metrics());
        let recovered = registry2.get_or_create("r1").await;
        let stats = recovered.get_stats().await.unwrap();
        assert_eq!(stats.seq, 1);
        assert_eq!(stats.entity_count, 1);
    }

    #[tokio::test]
    async fn leave_destroys_room_once_last_session_departs() {
        let coord = InMemoryCoordinator::new();
        let registry = RoomRegistry::new(coord.clone(), "A".into(), test_metrics());

        let handle = registry.get_or_create("r1").await;
        let (sink, _rx) = tokio::sync::mpsc::unbounded_channel();
        handle.attach("s1".into(), sink).await.unwrap();
        handle
            .apply_input("p1".into(), [("x".to_string(), crate::entity::Value::Int(1))].into_iter().collect())
            .await
            .unwrap();

        registry.leave("r1", "s1".into()).await;

        assert!(registry.get("r1").is_none());
        // Destroying flushes a final snapshot so a later rejoin recovers state.
        let stored = coord.hash_get_all("room:r1:snapshot").await.unwrap();
        assert!(stored.contains_key("data"));
    }

    #[tokio::test]
    async fn leave_on_unknown_room_is_a_noop() {
        let coord = InMemoryCoordinator::new();
        let registry = RoomRegistry::new(coord, "A".into(), test_metrics());
        registry.leave("ghost", "s1".into()).await;
    }
}
