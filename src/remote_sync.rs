//! Remote Sync: the long-running subscriber that turns
//! other instances' published deltas into local `ApplyRemoteDelta` calls.
//!
//! A cold room with no local sessions still gets created and kept current
//! here — unbounded retention for remote-only rooms is an accepted
//! tradeoff, so there is no eviction policy to wire in.

use std::sync::Arc;

use regex::Regex;
use tracing::warn;

use crate::coordinator::{decode_from_wire, Coordinator};
use crate::delta::{self, FullDelta};
use crate::registry::RoomRegistry;

const CHANNEL_PATTERN: &str = "room:*:channel";

fn channel_regex() -> Regex {
    Regex::new(r"^room:([^:]+):channel$").expect("literal regex always compiles")
}

/// Subscribe to every room's channel and apply incoming deltas to local
/// room state. Runs until the coordinator's subscription stream ends for
/// good (the coordinator itself is responsible for resubscribing across
/// transient failures).
pub async fn run(registry: Arc<RoomRegistry>, coordinator: Arc<dyn Coordinator>, instance_id: String) {
    let pattern = channel_regex();
    let mut rx = match coordinator.subscribe_pattern(CHANNEL_PATTERN).await {
        Ok(rx) => rx,
        Err(e) => {
            warn!(error = %e, "remote sync could not subscribe, deltas from other instances will not apply");
            return;
        }
    };

    while let Some(msg) = rx.recv().await {
        let Some(captures) = pattern.captures(&msg.channel) else {
            warn!(channel = %msg.channel, "remote sync received message on unrecognized channel, ignoring");
            continue;
        };
        let channel_room_id = captures[1].to_string();

        let payload_text = match std::str::from_utf8(&msg.payload) {
            Ok(s) => s,
            Err(_) => {
                warn!(channel = %msg.channel, "remote sync payload is not valid utf-8, dropping");
                continue;
            }
        };
        let bytes = match decode_from_wire(payload_text) {
            Ok(b) => b,
            Err(e) => {
                warn!(channel = %msg.channel, error = %e, "remote sync failed to base64-decode payload, dropping");
                continue;
            }
        };
        let fd: FullDelta = match delta::decode_binary(&bytes) {
            Ok(fd) => fd,
            Err(e) => {
                warn!(channel = %msg.channel, error = %e, "remote sync failed to decode delta, dropping");
                continue;
            }
        };

        if fd.instance_id == instance_id {
            continue;
        }

        if fd.room_id != channel_room_id {
            warn!(
                channel = %msg.channel,
                payload_room_id = %fd.room_id,
                "remote sync payload room id does not match channel room id, dropping"
            );
            continue;
        }

        let handle = registry.get_or_create(&channel_room_id).await;
        if let Err(e) = handle.apply_remote_delta(fd).await {
            warn!(room_id = %channel_room_id, error = %e, "remote sync failed to apply delta");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{encode_for_wire, InMemoryCoordinator};
    use crate::delta::{EntityChange, EntityDelta};
    use crate::entity::Value;

    fn test_metrics() -> Arc<crate::telemetry::Metrics> {
        Arc::new(crate::telemetry::Metrics::new().unwrap())
    }

    fn sample_fd(room_id: &str, instance_id: &str, seq: u64) -> FullDelta {
        let mut d = EntityDelta::new();
        d.insert(
            "p1".into(),
            EntityChange::Fields([("x".to_string(), Value::Int(1))].into_iter().collect()),
        );
        FullDelta { room_id: room_id.into(), delta: d, tick: seq, seq, ts: 0, instance_id: instance_id.into() }
    }

    #[tokio::test]
    async fn applies_remote_delta_and_ignores_own_echo() {
        let coord = InMemoryCoordinator::new();
        let registry = RoomRegistry::new(coord.clone(), "A".into(), test_metrics());

        let sync_task = tokio::spawn(run(registry.clone(), coord.clone(), "A".into()));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // own echo: must be ignored even though it is a well-formed delta.
        let own = sample_fd("r1", "A", 1);
        let bytes = delta::encode_binary(&own).unwrap();
        coord
            .publish("room:r1:channel", encode_for_wire(&bytes).into_bytes())
            .await
            .unwrap();

        // remote delta: must be applied.
        let remote = sample_fd("r1", "B", 1);
        let bytes = delta::encode_binary(&remote).unwrap();
        coord
            .publish("room:r1:channel", encode_for_wire(&bytes).into_bytes())
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        sync_task.abort();

        let handle = registry.get("r1").expect("room created from remote delta");
        let stats = handle.get_stats().await.unwrap();
        assert_eq!(stats.seq, 1);
        assert_eq!(stats.entity_count, 1);
    }
}
