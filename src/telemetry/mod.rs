//! Logging/telemetry: `tracing` initialization plus the Prometheus counters
//! backing the debug surface, using the `tracing`/`tracing-subscriber`/
//! `prometheus` stack.

use prometheus::{IntCounter, IntGauge, Registry};
use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber from `log_level` (or
/// `RUST_LOG` if set, which always wins).
pub fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_ansi(true).with_target(false).init();
}

/// Process-wide Prometheus counters, registered once at startup and
/// exposed through `/debug/stats` alongside the registry's live-room
/// stats.
pub struct Metrics {
    pub registry: Registry,
    pub deltas_published: IntCounter,
    pub deltas_applied_remote: IntCounter,
    pub stale_deltas_rejected: IntCounter,
    pub rooms_active: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let deltas_published = IntCounter::new("kasagi_deltas_published_total", "Deltas published to the coordinator")?;
        let deltas_applied_remote =
            IntCounter::new("kasagi_deltas_applied_remote_total", "Remote deltas accepted and applied")?;
        let stale_deltas_rejected =
            IntCounter::new("kasagi_stale_deltas_rejected_total", "Remote deltas rejected for a stale sequence")?;
        let rooms_active = IntGauge::new("kasagi_rooms_active", "Rooms currently tracked by the registry")?;

        registry.register(Box::new(deltas_published.clone()))?;
        registry.register(Box::new(deltas_applied_remote.clone()))?;
        registry.register(Box::new(stale_deltas_rejected.clone()))?;
        registry.register(Box::new(rooms_active.clone()))?;

        Ok(Self { registry, deltas_published, deltas_applied_remote, stale_deltas_rejected, rooms_active })
    }
}
