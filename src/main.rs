//! Process bootstrap: load configuration, build the
//! coordinator and registry, start the gateway and the remote sync
//! subscriber, and save every room's snapshot on shutdown.

use std::sync::Arc;

use clap::Parser;
use kasagi_engine::config::Config;
use kasagi_engine::coordinator::redis_sentinel::{RedisSentinelConfig, RedisSentinelCoordinator};
use kasagi_engine::registry::RoomRegistry;
use kasagi_engine::telemetry::{self, Metrics};
use tracing::{error, info};

/// KasagiEngine: real-time state synchronization backend.
#[derive(Parser, Debug)]
#[command(name = "kasagi-engine", version)]
struct Cli {
    /// Override the WebSocket listen port (falls back to WS_PORT / config.toml).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.ws_port = port;
    }

    telemetry::init_logging(&config.log_level);
    info!(instance_id = %config.instance_id, ws_port = config.ws_port, "starting kasagi-engine");

    let metrics = Arc::new(Metrics::new()?);

    let coordinator = RedisSentinelCoordinator::connect(RedisSentinelConfig {
        sentinel_endpoints: config.redis.sentinel_endpoints.clone(),
        master_name: config.redis.master_name.clone(),
        password: config.redis.password.clone(),
    })
    .await?;

    let registry = RoomRegistry::with_snapshot_interval(
        coordinator.clone(),
        config.instance_id.clone(),
        metrics.clone(),
        config.snapshot_interval_ticks,
    );

    tokio::spawn(kasagi_engine::remote_sync::run(
        registry.clone(),
        coordinator.clone(),
        config.instance_id.clone(),
    ));

    // No process-wide snapshot timer: each room's own `RoomActor` persists
    // itself every `snapshot_interval_ticks` locally-applied ticks (§4.2,
    // §5), so idle or remote-only rooms correctly never snapshot from here.
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.ws_port));
    let shutdown_registry = registry.clone();
    let result = kasagi_engine::gateway::serve(addr, registry, shutdown_signal()).await;

    info!("shutting down, saving room snapshots");
    shutdown_registry.save_all_snapshots().await;

    if let Err(e) = result {
        error!(error = %e, "gateway exited with error");
        return Err(e);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
