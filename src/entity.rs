//! The data model shared by the Delta Codec, Room, and wire protocol:
//! [`Value`], [`Entity`], and the `entityId -> Entity` map that makes up
//! [`crate::room::RoomState::entities`].
//!
//! Field semantics are opaque to the engine — only equality
//! and null-vs-present distinction matter, so `Value` is a small
//! JSON-shaped enum rather than anything typed per-game.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// An opaque field value. Deep/structural equality over this tree is what
/// the Delta Codec uses to decide whether a field changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    /// Nested map. `BTreeMap` so MessagePack encoding is byte-stable;
    /// equality is unaffected either way since key order never matters.
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// An untyped field -> value mapping. Identified within a room by an
/// `entityId` string (see [`EntityId`]).
pub type Entity = HashMap<String, Value>;

/// Unique within a room.
pub type EntityId = String;

/// `RoomState.entities`.
pub type EntityMap = HashMap<EntityId, Entity>;

/// Merge `payload` into `entity` field-by-field: a `Value::Null` field
/// removes the field, any other value replaces/inserts it. This is the
/// mutation an input apply step describes ("missing ->
/// inserted; existing -> field-wise overlay").
pub fn merge_fields(entity: &mut Entity, payload: &Entity) {
    for (field, value) in payload {
        match value {
            Value::Null => {
                entity.remove(field);
            }
            other => {
                entity.insert(field.clone(), other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_fields_removes_on_null_and_replaces_otherwise() {
        let mut entity: Entity = HashMap::new();
        entity.insert("x".into(), Value::Int(10));
        entity.insert("y".into(), Value::Int(12));

        let mut payload: Entity = HashMap::new();
        payload.insert("x".into(), Value::Int(11));
        payload.insert("y".into(), Value::Null);
        payload.insert("z".into(), Value::Text("new".into()));

        merge_fields(&mut entity, &payload);

        assert_eq!(entity.get("x"), Some(&Value::Int(11)));
        assert_eq!(entity.get("y"), None);
        assert_eq!(entity.get("z"), Some(&Value::Text("new".into())));
    }

    #[test]
    fn value_equality_ignores_map_key_order() {
        let mut a = BTreeMap::new();
        a.insert("a".to_string(), Value::Int(1));
        a.insert("b".to_string(), Value::Int(2));

        let mut b = BTreeMap::new();
        b.insert("b".to_string(), Value::Int(2));
        b.insert("a".to_string(), Value::Int(1));

        assert_eq!(Value::Map(a), Value::Map(b));
    }
}
