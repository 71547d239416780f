//! Delta Codec: compute, encode, decode, and apply
//! entity-level diffs, plus the wire-level [`FullDelta`] envelope and the
//! persisted [`SnapshotRecord`] triple.

use serde::{Deserialize, Serialize};

use crate::entity::{merge_fields, Entity, EntityId, EntityMap, Value};
use crate::error::EngineError;

/// One entity's change within a delta: either the entity was removed, or
/// a field-map describes what changed (new entities carry their full
/// field-map here; existing entities carry only the changed fields, with
/// `Value::Null` marking a removed field).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityChange {
    Removed,
    Fields(Entity),
}

/// An overlay describing the change from one room state to another.
/// Absence of an `entityId` key means "no change"; see [`EntityChange`]
/// for what each entry means.
pub type EntityDelta = std::collections::HashMap<EntityId, EntityChange>;

/// True iff the delta has no entries.
pub fn is_empty(delta: &EntityDelta) -> bool {
    delta.is_empty()
}

/// Compute the overlay that turns `prev` into `next`. Equality is
/// structural/by-value; map key order never affects the result.
pub fn compute_delta(prev: &EntityMap, next: &EntityMap) -> EntityDelta {
    let mut delta = EntityDelta::new();

    for (id, next_entity) in next {
        match prev.get(id) {
            Some(prev_entity) => {
                let mut changed_fields = Entity::new();
                for (field, value) in next_entity {
                    if prev_entity.get(field) != Some(value) {
                        changed_fields.insert(field.clone(), value.clone());
                    }
                }
                for field in prev_entity.keys() {
                    if !next_entity.contains_key(field) {
                        changed_fields.insert(field.clone(), Value::Null);
                    }
                }
                if !changed_fields.is_empty() {
                    delta.insert(id.clone(), EntityChange::Fields(changed_fields));
                }
            }
            None => {
                delta.insert(id.clone(), EntityChange::Fields(next_entity.clone()));
            }
        }
    }

    for id in prev.keys() {
        if !next.contains_key(id) {
            delta.insert(id.clone(), EntityChange::Removed);
        }
    }

    delta
}

/// Apply `delta` to `entities` in place.
pub fn apply_delta(entities: &mut EntityMap, delta: &EntityDelta) {
    for (id, change) in delta {
        match change {
            EntityChange::Removed => {
                entities.remove(id);
            }
            EntityChange::Fields(fields) => match entities.get_mut(id) {
                Some(existing) => merge_fields(existing, fields),
                None => {
                    entities.insert(id.clone(), fields.clone());
                }
            },
        }
    }
}

/// Wire form of a delta, carrying the transport metadata needed for
/// cross-instance fan-out and idempotent application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullDelta {
    pub room_id: String,
    pub delta: EntityDelta,
    pub tick: u64,
    pub seq: u64,
    /// Unix epoch millis.
    pub ts: i64,
    pub instance_id: String,
}

/// The persisted `(entities, seq, tick)` triple, stored in the
/// coordinator's hash store under `room:<roomId>:snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub entities: EntityMap,
    pub seq: u64,
    pub tick: u64,
    pub timestamp: i64,
    pub instance_id: String,
}

/// Encode any serializable value with the binary wire codec (MessagePack
/// via `rmp-serde`). Used for `FullDelta`/`SnapshotRecord` and for the
/// binary `snapshot`/`delta` frames sent to clients.
pub fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>, EngineError> {
    rmp_serde::to_vec_named(value).map_err(|e| EngineError::Encode(e.to_string()))
}

/// Decode a value previously produced by [`encode_binary`].
pub fn decode_binary<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, EngineError> {
    rmp_serde::from_slice(bytes).map_err(|e| EngineError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(pairs: &[(&str, Value)]) -> Entity {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn compute_delta_emits_only_changed_fields() {
        let mut prev = EntityMap::new();
        prev.insert("p1".into(), entity(&[("x", Value::Int(10)), ("y", Value::Int(12))]));

        let mut next = EntityMap::new();
        next.insert("p1".into(), entity(&[("x", Value::Int(11)), ("y", Value::Int(12))]));

        let delta = compute_delta(&prev, &next);
        assert_eq!(delta.len(), 1);
        match &delta["p1"] {
            EntityChange::Fields(f) => {
                assert_eq!(f.len(), 1);
                assert_eq!(f["x"], Value::Int(11));
            }
            EntityChange::Removed => panic!("expected Fields"),
        }
    }

    #[test]
    fn compute_delta_marks_new_and_removed_entities() {
        let mut prev = EntityMap::new();
        prev.insert("gone".into(), entity(&[("hp", Value::Int(1))]));

        let mut next = EntityMap::new();
        next.insert("fresh".into(), entity(&[("hp", Value::Int(3))]));

        let delta = compute_delta(&prev, &next);
        assert!(matches!(delta["gone"], EntityChange::Removed));
        match &delta["fresh"] {
            EntityChange::Fields(f) => assert_eq!(f["hp"], Value::Int(3)),
            EntityChange::Removed => panic!("expected Fields"),
        }
    }

    #[test]
    fn apply_delta_is_inverse_of_compute_delta() {
        let mut prev = EntityMap::new();
        prev.insert("p1".into(), entity(&[("x", Value::Int(1)), ("y", Value::Int(2))]));
        prev.insert("stale".into(), entity(&[("hp", Value::Int(5))]));

        let mut next = EntityMap::new();
        next.insert("p1".into(), entity(&[("x", Value::Int(9))]));
        next.insert("new".into(), entity(&[("hp", Value::Int(7))]));

        let delta = compute_delta(&prev, &next);
        let mut applied = prev.clone();
        apply_delta(&mut applied, &delta);

        assert_eq!(applied, next);
    }

    #[test]
    fn apply_delta_with_empty_delta_is_noop() {
        let mut state = EntityMap::new();
        state.insert("p1".into(), entity(&[("x", Value::Int(1))]));
        let before = state.clone();

        apply_delta(&mut state, &EntityDelta::new());
        assert_eq!(state, before);
    }

    #[test]
    fn compute_delta_of_identical_state_is_empty() {
        let mut state = EntityMap::new();
        state.insert("p1".into(), entity(&[("x", Value::Int(1))]));

        let delta = compute_delta(&state, &state.clone());
        assert!(is_empty(&delta));
    }

    #[test]
    fn binary_codec_roundtrips_full_delta() {
        let mut delta = EntityDelta::new();
        delta.insert(
            "p1".into(),
            EntityChange::Fields(entity(&[("x", Value::Int(11))])),
        );
        let fd = FullDelta {
            room_id: "r1".into(),
            delta,
            tick: 2,
            seq: 2,
            ts: 1_700_000_000_000,
            instance_id: "A".into(),
        };

        let bytes = encode_binary(&fd).unwrap();
        let decoded: FullDelta = decode_binary(&bytes).unwrap();

        assert_eq!(decoded.room_id, fd.room_id);
        assert_eq!(decoded.seq, fd.seq);
        assert_eq!(decoded.tick, fd.tick);
        assert_eq!(decoded.instance_id, fd.instance_id);
        assert_eq!(decoded.delta, fd.delta);
    }

    #[test]
    fn removed_entity_serializes_to_null_and_roundtrips() {
        let mut delta = EntityDelta::new();
        delta.insert("gone".into(), EntityChange::Removed);
        let json = serde_json::to_string(&delta).unwrap();
        assert_eq!(json, r#"{"gone":null}"#);

        let decoded: EntityDelta = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, delta);
    }
}
