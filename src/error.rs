//! Crate-local error types.
//!
//! Most call sites log-and-swallow (publish/snapshot/decode
//! failures never abort a room), so `EngineError` only covers failures
//! that a caller actually branches on: codec errors, coordinator I/O,
//! and config validation. Everything else threads through `anyhow`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("delta codec encode error: {0}")]
    Encode(String),

    #[error("delta codec decode error: {0}")]
    Decode(String),

    #[error("coordinator error: {0}")]
    Coordinator(String),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("room is at its entity capacity")]
    RoomFull,
}
