//! Process configuration: environment
//! variables layered over an optional TOML file, using a plain
//! struct-with-`#[serde(default)]` convention.

use std::path::PathBuf;

use serde::Deserialize;

use crate::error::EngineError;

fn default_ws_port() -> u16 {
    8080
}

fn default_master_name() -> String {
    "kasagi-master".to_string()
}

fn default_snapshot_interval_ticks() -> u64 {
    crate::room::DEFAULT_SNAPSHOT_INTERVAL_TICKS
}

fn default_log_level() -> String {
    "info".to_string()
}

/// On-disk override file, loaded before environment variables so env vars
/// always win. Every field is optional — a missing file is equivalent to
/// an empty one.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    ws_port: Option<u16>,
    instance_id: Option<String>,
    snapshot_interval_ticks: Option<u64>,
    log_level: Option<String>,
    sentinel_endpoints: Option<Vec<String>>,
    redis_master_name: Option<String>,
    redis_password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ws_port: u16,
    pub instance_id: String,
    /// Local ticks between snapshot saves (§5: "every 100 local ticks" by
    /// default). Driven by `RoomActor`'s own tick counter, never by a
    /// process-wide wall-clock timer.
    pub snapshot_interval_ticks: u64,
    pub log_level: String,
    pub redis: RedisConfig,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub sentinel_endpoints: Vec<String>,
    pub master_name: String,
    pub password: Option<String>,
}

impl Config {
    /// Load configuration from (in increasing priority): built-in
    /// defaults, `config.toml` in the platform config directory (if
    /// present), then environment variables.
    pub fn load() -> Result<Self, EngineError> {
        let file = read_config_file().unwrap_or_default();

        let ws_port = env_var("WS_PORT")
            .map(|v| v.parse().map_err(|_| EngineError::Config("WS_PORT must be a u16".into())))
            .transpose()?
            .or(file.ws_port)
            .unwrap_or_else(default_ws_port);

        let instance_id = env_var("INSTANCE_ID")
            .or(file.instance_id)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let snapshot_interval_ticks = env_var("SNAPSHOT_INTERVAL")
            .map(|v| {
                v.parse()
                    .map_err(|_| EngineError::Config("SNAPSHOT_INTERVAL must be a number of ticks".into()))
            })
            .transpose()?
            .or(file.snapshot_interval_ticks)
            .unwrap_or_else(default_snapshot_interval_ticks);

        let log_level = env_var("LOG_LEVEL").or(file.log_level).unwrap_or_else(default_log_level);

        let sentinel_endpoints = sentinel_endpoints_from_env().or(file.sentinel_endpoints).unwrap_or_default();

        let master_name = env_var("REDIS_MASTER_NAME").or(file.redis_master_name).unwrap_or_else(default_master_name);

        let password = env_var("REDIS_PASSWORD").or(file.redis_password);

        let config = Config {
            ws_port,
            instance_id,
            snapshot_interval_ticks,
            log_level,
            redis: RedisConfig { sentinel_endpoints, master_name, password },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.redis.sentinel_endpoints.is_empty() {
            return Err(EngineError::Config(
                "no sentinel endpoints configured: set SENTINEL_1 (and optionally SENTINEL_2, SENTINEL_3) or sentinel_endpoints in config.toml".into(),
            ));
        }
        if self.ws_port == 0 {
            return Err(EngineError::Config("WS_PORT must be nonzero".into()));
        }
        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// `SENTINEL_1`/`SENTINEL_2`/`SENTINEL_3`, each `host:port`. Only `SENTINEL_1`
/// is required; the rest are additional Sentinel nodes for the same fleet.
fn sentinel_endpoints_from_env() -> Option<Vec<String>> {
    let endpoints: Vec<String> = ["SENTINEL_1", "SENTINEL_2", "SENTINEL_3"]
        .into_iter()
        .filter_map(env_var)
        .collect();
    if endpoints.is_empty() {
        None
    } else {
        Some(endpoints)
    }
}

fn config_file_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "kasagi-labs", "kasagi-engine")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn read_config_file() -> Option<ConfigFile> {
    let path = config_file_path()?;
    let text = std::fs::read_to_string(&path).ok()?;
    match toml::from_str(&text) {
        Ok(file) => Some(file),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to parse config.toml, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_defaults_are_all_none() {
        let file = ConfigFile::default();
        assert!(file.ws_port.is_none());
        assert!(file.sentinel_endpoints.is_none());
    }
}
