use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::env;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// HTTP admin surface (health, stats, broadcast ingestion)
    pub port: u16,
    /// Websocket listener
    pub ws_port: u16,
    pub workers: u32,
}

/// Sizing and timing of the worker pool.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub max_connections_per_worker: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub ping_interval_ms: u64,
    pub pong_wait_ms: u64,
    pub write_timeout_ms: u64,
    pub stale_after_ms: u64,
    pub sweep_interval_ms: u64,
    pub max_frame_bytes: usize,
}

impl PoolConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Total number of connections the pool will ever admit at once.
    pub fn capacity(&self) -> usize {
        self.workers.saturating_mul(self.max_connections_per_worker)
    }

    /// Handshake-level limits, so oversized frames are refused before they
    /// are buffered. The read loop enforces the same cap on data frames.
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(self.max_frame_bytes),
            max_frame_size: Some(self.max_frame_bytes),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("pool.workers", self.workers as u64),
            ("pool.max_connections_per_worker", self.max_connections_per_worker as u64),
            ("pool.queue_capacity", self.queue_capacity as u64),
            ("pool.batch_size", self.batch_size as u64),
            ("pool.ping_interval_ms", self.ping_interval_ms),
            ("pool.pong_wait_ms", self.pong_wait_ms),
            ("pool.write_timeout_ms", self.write_timeout_ms),
            ("pool.stale_after_ms", self.stale_after_ms),
            ("pool.sweep_interval_ms", self.sweep_interval_ms),
            ("pool.max_frame_bytes", self.max_frame_bytes as u64),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Message(format!("{} must be greater than zero", key)));
            }
        }

        if self.stale_after_ms <= self.ping_interval_ms {
            return Err(ConfigError::Message(format!(
                "pool.stale_after_ms ({}) must exceed pool.ping_interval_ms ({})",
                self.stale_after_ms, self.ping_interval_ms
            )));
        }

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            max_connections_per_worker: 10_000,
            queue_capacity: 256,
            batch_size: 64,
            ping_interval_ms: 30_000,
            pong_wait_ms: 60_000,
            write_timeout_ms: 10_000,
            stale_after_ms: 120_000,
            sweep_interval_ms: 30_000,
            max_frame_bytes: 512,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub pool: PoolConfig,
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
    environment: &str,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let pool = PoolConfig::default();
    builder
        .set_default("environment", environment)?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("server.ws_port", 8081)?
        .set_default("server.workers", num_cpus::get() as i64)?
        .set_default("pool.workers", pool.workers as i64)?
        .set_default("pool.max_connections_per_worker", pool.max_connections_per_worker as i64)?
        .set_default("pool.queue_capacity", pool.queue_capacity as i64)?
        .set_default("pool.batch_size", pool.batch_size as i64)?
        .set_default("pool.ping_interval_ms", pool.ping_interval_ms as i64)?
        .set_default("pool.pong_wait_ms", pool.pong_wait_ms as i64)?
        .set_default("pool.write_timeout_ms", pool.write_timeout_ms as i64)?
        .set_default("pool.stale_after_ms", pool.stale_after_ms as i64)?
        .set_default("pool.sweep_interval_ms", pool.sweep_interval_ms as i64)?
        .set_default("pool.max_frame_bytes", pool.max_frame_bytes as i64)
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let settings: Settings = with_defaults(Config::builder(), "development")?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // E.g., `APP_POOL__WORKERS=8` would set `Settings.pool.workers`
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?
            .try_deserialize()?;

        settings.pool.validate()?;
        Ok(settings)
    }

    pub fn new_for_test() -> Result<Self, ConfigError> {
        let settings: Settings = with_defaults(Config::builder(), "test")?
            .set_default("pool.workers", 2)?
            .set_default("pool.max_connections_per_worker", 4)?
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?
            .try_deserialize()?;

        settings.pool.validate()?;
        Ok(settings)
    }
}
