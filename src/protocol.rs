//! Wire message shapes for the Session Dispatcher: JSON
//! control frames and the envelope types carried over the binary channel.

use serde::{Deserialize, Serialize};

use crate::delta::FullDelta;
use crate::entity::{Entity, EntityId, EntityMap};

/// Client -> server control frames, sent as `Message::Text`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientControl {
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: String,
        /// Absent means "assign a fresh opaque id".
        #[serde(default)]
        player_id: Option<EntityId>,
    },
    #[serde(rename_all = "camelCase")]
    Input { room_id: String, player_id: EntityId, payload: Entity },
}

/// Server -> client control frames, sent as `Message::Text`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerControl {
    #[serde(rename_all = "camelCase")]
    Joined { room_id: String, player_id: EntityId },
    #[serde(rename_all = "camelCase")]
    Left { room_id: String },
    #[serde(rename_all = "camelCase")]
    Error { code: ErrorCode, message: String },
}

/// Error codes surfaced to clients over the JSON control channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RoomNotFound,
    RoomFull,
    #[allow(dead_code)]
    InvalidInput,
    InvalidRoom,
    WrongRoom,
    InvalidType,
    ParseError,
    #[allow(dead_code)]
    Unauthorized,
    InternalError,
    #[allow(dead_code)]
    ConnectionError,
}

/// Server -> client binary frames, sent as `Message::Binary` and encoded
/// with [`crate::delta::encode_binary`]. Unlike the coordinator transport
/// leg, these are never base64-wrapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BinaryFrame {
    #[serde(rename_all = "camelCase")]
    Snapshot {
        room_id: String,
        entities: EntityMap,
        tick: u64,
        seq: u64,
    },
    Delta(FullDelta),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_deserializes_with_optional_player_id() {
        let control: ClientControl = serde_json::from_str(r#"{"type":"join","roomId":"r1"}"#).unwrap();
        match control {
            ClientControl::Join { room_id, player_id } => {
                assert_eq!(room_id, "r1");
                assert!(player_id.is_none());
            }
            ClientControl::Input { .. } => panic!("expected Join"),
        }
    }

    #[test]
    fn error_codes_serialize_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::WrongRoom).unwrap();
        assert_eq!(json, "\"WRONG_ROOM\"");
        let json = serde_json::to_string(&ErrorCode::RoomFull).unwrap();
        assert_eq!(json, "\"ROOM_FULL\"");
    }

    #[test]
    fn joined_control_serializes_camel_case_player_id() {
        let msg = ServerControl::Joined { room_id: "r1".into(), player_id: "p1".into() };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"joined","roomId":"r1","playerId":"p1"}"#);
    }
}
