//! Local Broadcaster: best-effort fan-out of an encoded
//! binary frame to every session sink attached to a room. A closed
//! per-socket channel is dropped silently rather than aborting the whole
//! fan-out.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::room::SessionId;

/// Send `bytes` to every sink in `sessions`. A send failure (the session's
/// writer task already exited) is logged and skipped — it never stops the
/// fan-out to the remaining sessions.
pub fn broadcast(sessions: &HashMap<SessionId, UnboundedSender<Vec<u8>>>, bytes: &[u8]) {
    for (session_id, sink) in sessions {
        if sink.send(bytes.to_vec()).is_err() {
            debug!(session_id = %session_id, "dropped frame: session sink closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn broadcast_skips_closed_sinks_without_panicking() {
        let mut sessions = HashMap::new();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        sessions.insert("s1".to_string(), tx1);

        let (tx2, rx2) = mpsc::unbounded_channel();
        drop(rx2);
        sessions.insert("s2".to_string(), tx2);

        broadcast(&sessions, b"hello");

        assert_eq!(rx1.recv().await.unwrap(), b"hello");
    }
}
