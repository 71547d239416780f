//! The abstract coordination capability set: publish/subscribe and a hash
//! store, used by [`crate::remote_sync`] for cross-instance delta fan-out
//! and by [`crate::room`] for snapshot persistence.
//!
//! [`Coordinator`] is deliberately narrow — five operations, no Redis types
//! leaking through — so the engine logic can run against [`InMemoryCoordinator`]
//! in tests and against [`redis_sentinel::RedisSentinelCoordinator`] in
//! production without diverging.

pub mod redis_sentinel;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::mpsc;

use crate::error::EngineError;

/// A message delivered to a pattern subscription: the concrete channel name
/// it matched on, and the raw payload bytes.
#[derive(Debug, Clone)]
pub struct PatternMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), EngineError>;

    /// Subscribe to all channels matching a Redis-style glob `pattern`
    /// (only `*` is supported — the only wildcard the engine ever emits).
    /// Returns a receiver fed for the lifetime of the subscription.
    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<PatternMessage>, EngineError>;

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), EngineError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, EngineError>;

    async fn del(&self, key: &str) -> Result<(), EngineError>;
}

/// Base64-wrap a payload for the pub/sub transport leg (the coordinator
/// channel additionally base64-wraps binary payloads so they
/// survive text-oriented pub/sub transports unmodified).
pub fn encode_for_wire(payload: &[u8]) -> String {
    BASE64.encode(payload)
}

/// Inverse of [`encode_for_wire`].
pub fn decode_from_wire(text: &str) -> Result<Vec<u8>, EngineError> {
    BASE64.decode(text).map_err(|e| EngineError::Decode(e.to_string()))
}

fn glob_to_regex(pattern: &str) -> Regex {
    let mut out = String::from("^");
    for part in pattern.split('*') {
        out.push_str(&regex::escape(part));
        out.push_str(".*");
    }
    // split('*') leaves one trailing ".*" too many; drop it since split
    // already inserts boundaries between literal segments.
    out.truncate(out.len() - 2);
    out.push('$');
    Regex::new(&out).expect("glob pattern always compiles to a valid regex")
}

struct Inner {
    hashes: HashMap<String, HashMap<String, Vec<u8>>>,
    subscribers: Vec<(Regex, mpsc::UnboundedSender<PatternMessage>)>,
}

/// An in-process stand-in for a Redis Sentinel cluster: same pub/sub and
/// hash-store semantics, no network. Used by the test suite so the
/// cross-instance invariants (own-echo suppression, stale-delta rejection)
/// run without a live cluster.
pub struct InMemoryCoordinator {
    inner: Mutex<Inner>,
}

impl InMemoryCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                hashes: HashMap::new(),
                subscribers: Vec::new(),
            }),
        })
    }
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                hashes: HashMap::new(),
                subscribers: Vec::new(),
            }),
        }
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), EngineError> {
        let inner = self.inner.lock();
        for (pattern, tx) in &inner.subscribers {
            if pattern.is_match(channel) {
                let _ = tx.send(PatternMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<PatternMessage>, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push((glob_to_regex(pattern), tx));
        Ok(rx)
    }

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), EngineError> {
        self.inner
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, EngineError> {
        Ok(self.inner.lock().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn del(&self, key: &str) -> Result<(), EngineError> {
        self.inner.lock().hashes.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pattern_subscription_receives_matching_publishes() {
        let coord = InMemoryCoordinator::new();
        let mut rx = coord.subscribe_pattern("room:*:channel").await.unwrap();

        coord.publish("room:abc:channel", b"hello".to_vec()).await.unwrap();
        coord.publish("unrelated:channel", b"nope".to_vec()).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel, "room:abc:channel");
        assert_eq!(msg.payload, b"hello");

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hash_store_roundtrips() {
        let coord = InMemoryCoordinator::new();
        coord.hash_set("room:r1:snapshot", "data", b"xyz".to_vec()).await.unwrap();

        let all = coord.hash_get_all("room:r1:snapshot").await.unwrap();
        assert_eq!(all.get("data"), Some(&b"xyz".to_vec()));

        coord.del("room:r1:snapshot").await.unwrap();
        let after = coord.hash_get_all("room:r1:snapshot").await.unwrap();
        assert!(after.is_empty());
    }

    #[test]
    fn base64_wire_wrap_roundtrips() {
        let original = b"some binary msgpack bytes \x00\x01\x02";
        let wrapped = encode_for_wire(original);
        let unwrapped = decode_from_wire(&wrapped).unwrap();
        assert_eq!(unwrapped, original);
    }
}
