//! Production [`Coordinator`] backed by a Sentinel-aware Redis client.
//!
//! Reconnect/failover is the client's job; this module only adds a
//! thin supervising loop around the pub/sub leg, since a pattern
//! subscription is a long-lived stream that Sentinel failover will
//! eventually terminate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::sentinel::{SentinelClient, SentinelServerType};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::warn;

use super::{Coordinator, PatternMessage};
use crate::error::EngineError;

#[derive(Debug, Clone)]
pub struct RedisSentinelConfig {
    /// `host:port` pairs for the Sentinel fleet.
    pub sentinel_endpoints: Vec<String>,
    pub master_name: String,
    pub password: Option<String>,
}

fn map_err(e: redis::RedisError) -> EngineError {
    EngineError::Coordinator(e.to_string())
}

/// Coordinator implementation used in production. `publish`/`hash_*` go
/// through a [`ConnectionManager`] (auto-reconnecting, safe to share);
/// `subscribe_pattern` opens its own dedicated connection per call since
/// pub/sub connections can't multiplex ordinary commands.
pub struct RedisSentinelCoordinator {
    manager: ConnectionManager,
    config: RedisSentinelConfig,
}

impl RedisSentinelCoordinator {
    pub async fn connect(config: RedisSentinelConfig) -> Result<Arc<Self>, EngineError> {
        let manager = sentinel_master_connection(&config).await?;
        Ok(Arc::new(Self { manager, config }))
    }
}

async fn build_sentinel_client(config: &RedisSentinelConfig) -> Result<SentinelClient, EngineError> {
    let node_info = config.password.as_ref().map(|pw| redis::sentinel::SentinelNodeConnectionInfo {
        tls_mode: None,
        redis_connection_info: Some(redis::RedisConnectionInfo {
            password: Some(pw.clone()),
            ..Default::default()
        }),
    });

    SentinelClient::build(
        config.sentinel_endpoints.clone(),
        config.master_name.clone(),
        node_info,
        SentinelServerType::Master,
    )
    .map_err(map_err)
}

async fn sentinel_master_connection(config: &RedisSentinelConfig) -> Result<ConnectionManager, EngineError> {
    let mut sentinel = build_sentinel_client(config).await?;
    let client = sentinel.get_client().map_err(map_err)?;
    ConnectionManager::new(client).await.map_err(map_err)
}

#[async_trait]
impl Coordinator for RedisSentinelCoordinator {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), EngineError> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload).await.map_err(map_err)
    }

    async fn subscribe_pattern(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<PatternMessage>, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pattern = pattern.to_string();
        let config = self.config.clone();

        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    return;
                }
                if let Err(e) = run_pattern_subscription(&config, &pattern, &tx).await {
                    warn!(error = %e, pattern = %pattern, "pattern subscription ended, resubscribing");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        });

        Ok(rx)
    }

    async fn hash_set(&self, key: &str, field: &str, value: Vec<u8>) -> Result<(), EngineError> {
        let mut conn = self.manager.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await.map_err(map_err)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, EngineError> {
        let mut conn = self.manager.clone();
        conn.hgetall(key).await.map_err(map_err)
    }

    async fn del(&self, key: &str) -> Result<(), EngineError> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await.map_err(map_err)
    }
}

async fn run_pattern_subscription(
    config: &RedisSentinelConfig,
    pattern: &str,
    tx: &mpsc::UnboundedSender<PatternMessage>,
) -> Result<(), EngineError> {
    use futures_util::StreamExt;

    let mut sentinel = build_sentinel_client(config).await?;
    let client = sentinel.get_client().map_err(map_err)?;
    let mut pubsub = client.get_async_pubsub().await.map_err(map_err)?;
    pubsub.psubscribe(pattern).await.map_err(map_err)?;

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: Vec<u8> = msg.get_payload_bytes().to_vec();
        if tx.send(PatternMessage { channel, payload }).is_err() {
            return Ok(());
        }
    }

    Err(EngineError::Coordinator("pattern subscription stream ended".into()))
}
