//! Session Dispatcher: multiplexes one socket's JSON control
//! frames (join/input/joined/left/error) and binary frames (snapshot/delta)
//! over the single [`RoomHandle`] the session is attached to, with a
//! receive loop and a dedicated writer task fed by an unbounded channel.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::protocol::{ClientControl, ErrorCode, ServerControl};
use crate::registry::RoomRegistry;

enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

/// What the session believes its current room/player to be. Looked up
/// fresh against the registry on every `input` rather than cached as a
/// handle, so a room destroyed out from under a stale session reports
/// `ROOM_NOT_FOUND` instead of silently talking to a dead actor.
struct SessionState {
    session_id: String,
    room_id: Option<String>,
    player_id: Option<String>,
}

/// Drive one accepted WebSocket connection until it closes.
pub async fn run(socket: WebSocket, registry: Arc<RoomRegistry>) {
    let session_id = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                Outbound::Text(text) => ws_tx.send(Message::Text(text.into())).await,
                Outbound::Binary(bytes) => ws_tx.send(Message::Binary(bytes.into())).await,
            };
            if result.is_err() {
                break;
            }
        }
    });

    // Dedicated channel for the Local Broadcaster's fan-out:
    // attach() wants a plain byte sink, which we forward into the combined
    // outbound channel above.
    let (bin_tx, mut bin_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let outbound_tx_for_binary = outbound_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(bytes) = bin_rx.recv().await {
            if outbound_tx_for_binary.send(Outbound::Binary(bytes)).is_err() {
                break;
            }
        }
    });

    let mut state = SessionState { session_id: session_id.clone(), room_id: None, player_id: None };

    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "websocket receive error, closing session");
                break;
            }
        };

        match frame {
            Message::Text(text) => handle_control(&mut state, &registry, &text, &outbound_tx, &bin_tx).await,
            Message::Binary(_) => {
                debug!(session_id = %session_id, "ignoring unexpected binary frame from client");
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    cleanup(&state, &registry).await;
    forwarder.abort();
    writer.abort();
    info!(session_id = %session_id, "session closed");
}

/// `type` field known but the rest of the frame doesn't parse, or the
/// frame isn't even valid JSON, or `type` names something we don't
/// recognize. Split out so join/input validation failures (`PARSE_ERROR`)
/// are distinguishable from an unrecognized `type` (`INVALID_TYPE`).
fn parse_client_control(text: &str) -> Result<ClientControl, ErrorCode> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|_| ErrorCode::ParseError)?;
    match value.get("type").and_then(|t| t.as_str()) {
        Some("join") | Some("input") => {
            serde_json::from_value(value).map_err(|_| ErrorCode::ParseError)
        }
        _ => Err(ErrorCode::InvalidType),
    }
}

async fn handle_control(
    state: &mut SessionState,
    registry: &Arc<RoomRegistry>,
    text: &str,
    outbound_tx: &mpsc::UnboundedSender<Outbound>,
    bin_tx: &mpsc::UnboundedSender<Vec<u8>>,
) {
    let control = match parse_client_control(text) {
        Ok(c) => c,
        Err(code) => {
            send_error(outbound_tx, code, "failed to parse client message");
            return;
        }
    };

    match control {
        ClientControl::Join { room_id, player_id } => {
            if room_id.is_empty() {
                send_error(outbound_tx, ErrorCode::InvalidRoom, "roomId must not be empty");
                return;
            }

            // A session can only ever hold one room at a time: leaving the
            // old one (which emits removeEntity + publish, same as a
            // disconnect) before joining the new one.
            if let Some(old_room_id) = state.room_id.clone() {
                leave_current_room(state, registry).await;
                send_control(outbound_tx, &ServerControl::Left { room_id: old_room_id });
            }

            let player_id = player_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let snapshot_bytes = registry.join(&room_id, state.session_id.clone(), bin_tx.clone()).await;

            state.room_id = Some(room_id.clone());
            state.player_id = Some(player_id.clone());

            send_control(outbound_tx, &ServerControl::Joined { room_id, player_id });
            let _ = outbound_tx.send(Outbound::Binary(snapshot_bytes));
        }
        ClientControl::Input { room_id, player_id, payload } => {
            let Some(session_room_id) = &state.room_id else {
                send_error(outbound_tx, ErrorCode::WrongRoom, "session has not joined a room");
                return;
            };
            if *session_room_id != room_id {
                send_error(outbound_tx, ErrorCode::WrongRoom, "input roomId does not match the session's joined room");
                return;
            }
            let Some(handle) = registry.get(&room_id) else {
                send_error(outbound_tx, ErrorCode::RoomNotFound, "room no longer exists");
                return;
            };

            match handle.apply_input(player_id, payload).await {
                Ok(()) => {}
                Err(EngineError::RoomFull) => {
                    send_error(outbound_tx, ErrorCode::RoomFull, "room is at its entity capacity");
                }
                Err(e) => {
                    warn!(session_id = %state.session_id, error = %e, "failed to apply input");
                    send_error(outbound_tx, ErrorCode::InternalError, "failed to apply input");
                }
            }
        }
    }
}

async fn leave_current_room(state: &mut SessionState, registry: &Arc<RoomRegistry>) {
    let (Some(room_id), Some(player_id)) = (state.room_id.take(), state.player_id.take()) else {
        return;
    };
    if let Some(handle) = registry.get(&room_id) {
        let _ = handle.remove_entity(player_id);
    }
    registry.leave(&room_id, state.session_id.clone()).await;
}

async fn cleanup(state: &SessionState, registry: &Arc<RoomRegistry>) {
    let (Some(room_id), Some(player_id)) = (&state.room_id, &state.player_id) else {
        return;
    };
    if let Some(handle) = registry.get(room_id) {
        let _ = handle.remove_entity(player_id.clone());
    }
    registry.leave(room_id, state.session_id.clone()).await;
}

fn send_control(outbound_tx: &mpsc::UnboundedSender<Outbound>, msg: &ServerControl) {
    match serde_json::to_string(msg) {
        Ok(text) => {
            let _ = outbound_tx.send(Outbound::Text(text));
        }
        Err(e) => warn!(error = %e, "failed to encode server control message"),
    }
}

fn send_error(outbound_tx: &mpsc::UnboundedSender<Outbound>, code: ErrorCode, message: &str) {
    send_control(outbound_tx, &ServerControl::Error { code, message: message.to_string() });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_yields_invalid_type() {
        let err = parse_client_control(r#"{"type":"teleport","roomId":"r1"}"#).unwrap_err();
        assert_eq!(err, ErrorCode::InvalidType);
    }

    #[test]
    fn malformed_json_yields_parse_error() {
        let err = parse_client_control("{not json").unwrap_err();
        assert_eq!(err, ErrorCode::ParseError);
    }

    #[test]
    fn known_type_missing_fields_yields_parse_error() {
        let err = parse_client_control(r#"{"type":"input","roomId":"r1"}"#).unwrap_err();
        assert_eq!(err, ErrorCode::ParseError);
    }

    #[test]
    fn join_without_player_id_parses_with_none() {
        let control = parse_client_control(r#"{"type":"join","roomId":"r1"}"#).unwrap();
        match control {
            ClientControl::Join { room_id, player_id } => {
                assert_eq!(room_id, "r1");
                assert!(player_id.is_none());
            }
            ClientControl::Input { .. } => panic!("expected Join"),
        }
    }

    #[test]
    fn input_parses_room_and_player_ids() {
        let control =
            parse_client_control(r#"{"type":"input","roomId":"r1","playerId":"p1","payload":{"x":1}}"#).unwrap();
        match control {
            ClientControl::Input { room_id, player_id, .. } => {
                assert_eq!(room_id, "r1");
                assert_eq!(player_id, "p1");
            }
            ClientControl::Join { .. } => panic!("expected Input"),
        }
    }
}
