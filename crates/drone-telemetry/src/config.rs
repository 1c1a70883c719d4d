// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Simulator and ingestion configuration.
//!
//! Supports both programmatic (builder) and file-based (TOML) configuration.

use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::pipeline::PipelineConfig;
use crate::pool::DEFAULT_POOL_SIZE;
use crate::server::ServerSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Default endpoint shared by the simulator and the ingestion server.
pub const DEFAULT_ENDPOINT: &str = "127.0.0.1:7400";

/// Fleet simulator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Ingestion endpoint (host:port).
    pub endpoint: String,

    /// Number of simulated devices.
    pub devices: usize,

    /// Run duration in seconds (0 = until interrupted).
    pub run_seconds: u64,

    /// Every Nth record per device is a keyframe.
    pub key_frame_gap: u64,

    /// Random keyframe interval, lower bound.
    pub random_key_frame_min: u64,

    /// Random keyframe interval, upper bound (exclusive).
    pub random_key_frame_max: u64,

    /// Pause between records of one device (milliseconds).
    pub message_delay_ms: u64,

    /// Delay before each device starts (milliseconds).
    pub start_delay_ms: u64,

    /// Random extra start delay (milliseconds, 0 = none).
    pub start_jitter_ms: u64,

    /// Per-device buffer capacity.
    pub buffer_capacity: usize,

    /// Concurrent sends per device.
    pub max_concurrent_sends: usize,

    /// Connections in the shared pool.
    pub pool_size: usize,

    /// Stop each device after this many records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<u64>,

    /// Random seed for reproducible runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Largest payload accepted on the wire (bytes).
    pub max_frame_size: usize,

    /// Progress reporting interval (seconds, 0 = off).
    pub stats_interval_secs: u64,
}

impl Default for FleetConfig {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            devices: 1000,
            run_seconds: 0,
            key_frame_gap: pipeline.key_frame_interval,
            random_key_frame_min: pipeline.random_key_frame_min,
            random_key_frame_max: pipeline.random_key_frame_max,
            message_delay_ms: pipeline.message_delay.as_millis() as u64,
            start_delay_ms: pipeline.start_delay.as_millis() as u64,
            start_jitter_ms: 0,
            buffer_capacity: pipeline.buffer_capacity,
            max_concurrent_sends: pipeline.max_concurrent_sends,
            pool_size: DEFAULT_POOL_SIZE,
            max_messages: None,
            seed: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            stats_interval_secs: 10,
        }
    }
}

impl FleetConfig {
    pub fn builder() -> FleetConfigBuilder {
        FleetConfigBuilder::default()
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint is empty".into()));
        }
        if self.devices == 0 {
            return Err(ConfigError::Invalid("devices must be > 0".into()));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be > 0".into()));
        }
        if self.buffer_capacity == 0 {
            return Err(ConfigError::Invalid("buffer_capacity must be > 0".into()));
        }
        if self.max_concurrent_sends == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_sends must be > 0".into(),
            ));
        }
        if self.random_key_frame_min > self.random_key_frame_max {
            return Err(ConfigError::Invalid(format!(
                "random_key_frame_min ({}) > random_key_frame_max ({})",
                self.random_key_frame_min, self.random_key_frame_max
            )));
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid("max_frame_size must be > 0".into()));
        }
        Ok(())
    }

    /// Per-device pipeline parameters.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            key_frame_interval: self.key_frame_gap,
            random_key_frame_min: self.random_key_frame_min,
            random_key_frame_max: self.random_key_frame_max,
            message_delay: Duration::from_millis(self.message_delay_ms),
            buffer_capacity: self.buffer_capacity,
            max_concurrent_sends: self.max_concurrent_sends,
            start_delay: Duration::from_millis(self.start_delay_ms),
            start_jitter: Duration::from_millis(self.start_jitter_ms),
            max_messages: self.max_messages,
        }
    }

    /// `None` when the run is unbounded.
    pub fn run_duration(&self) -> Option<Duration> {
        (self.run_seconds > 0).then(|| Duration::from_secs(self.run_seconds))
    }

    /// `None` when progress reporting is off.
    pub fn report_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

/// Builder for [`FleetConfig`].
#[derive(Debug, Default)]
pub struct FleetConfigBuilder {
    endpoint: Option<String>,
    devices: Option<usize>,
    run_seconds: Option<u64>,
    key_frame_gap: Option<u64>,
    message_delay_ms: Option<u64>,
    start_delay_ms: Option<u64>,
    buffer_capacity: Option<usize>,
    max_concurrent_sends: Option<usize>,
    pool_size: Option<usize>,
    max_messages: Option<u64>,
    seed: Option<u64>,
}

impl FleetConfigBuilder {
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn devices(mut self, devices: usize) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn run_seconds(mut self, secs: u64) -> Self {
        self.run_seconds = Some(secs);
        self
    }

    pub fn key_frame_gap(mut self, gap: u64) -> Self {
        self.key_frame_gap = Some(gap);
        self
    }

    pub fn message_delay_ms(mut self, ms: u64) -> Self {
        self.message_delay_ms = Some(ms);
        self
    }

    pub fn start_delay_ms(mut self, ms: u64) -> Self {
        self.start_delay_ms = Some(ms);
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = Some(capacity);
        self
    }

    pub fn max_concurrent_sends(mut self, n: usize) -> Self {
        self.max_concurrent_sends = Some(n);
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    pub fn max_messages(mut self, n: u64) -> Self {
        self.max_messages = Some(n);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build the configuration
    pub fn build(self) -> FleetConfig {
        let defaults = FleetConfig::default();

        FleetConfig {
            endpoint: self.endpoint.unwrap_or(defaults.endpoint),
            devices: self.devices.unwrap_or(defaults.devices),
            run_seconds: self.run_seconds.unwrap_or(defaults.run_seconds),
            key_frame_gap: self.key_frame_gap.unwrap_or(defaults.key_frame_gap),
            message_delay_ms: self.message_delay_ms.unwrap_or(defaults.message_delay_ms),
            start_delay_ms: self.start_delay_ms.unwrap_or(defaults.start_delay_ms),
            buffer_capacity: self.buffer_capacity.unwrap_or(defaults.buffer_capacity),
            max_concurrent_sends: self
                .max_concurrent_sends
                .unwrap_or(defaults.max_concurrent_sends),
            pool_size: self.pool_size.unwrap_or(defaults.pool_size),
            max_messages: self.max_messages.or(defaults.max_messages),
            seed: self.seed.or(defaults.seed),
            ..defaults
        }
    }
}

/// Ingestion service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Listen address (host:port).
    pub listen: String,

    /// SQLite database path.
    pub database: PathBuf,

    /// Dead-letter file (JSON lines).
    pub dead_letter_path: PathBuf,

    /// Largest payload accepted (bytes).
    pub max_frame_size: usize,

    /// Frames queued between connections and the batch worker.
    pub channel_capacity: usize,

    /// Largest batch handed to the processor.
    pub batch_size: usize,

    /// Statistics reporting interval (seconds, 0 = off).
    pub stats_interval_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let settings = ServerSettings::default();
        Self {
            listen: "0.0.0.0:7400".to_string(),
            database: PathBuf::from("drone-state.db"),
            dead_letter_path: PathBuf::from("dead-letters.jsonl"),
            max_frame_size: settings.max_frame_size,
            channel_capacity: settings.channel_capacity,
            batch_size: settings.batch_size,
            stats_interval_secs: 10,
        }
    }
}

impl IngestConfig {
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder::default()
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("listen address is empty".into()));
        }
        if self.database.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("database path is empty".into()));
        }
        if self.dead_letter_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("dead_letter_path is empty".into()));
        }
        if self.max_frame_size == 0 || self.channel_capacity == 0 || self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "max_frame_size, channel_capacity and batch_size must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            max_frame_size: self.max_frame_size,
            channel_capacity: self.channel_capacity,
            batch_size: self.batch_size,
        }
    }
}

/// Builder for [`IngestConfig`].
#[derive(Debug, Default)]
pub struct IngestConfigBuilder {
    listen: Option<String>,
    database: Option<PathBuf>,
    dead_letter_path: Option<PathBuf>,
    batch_size: Option<usize>,
    stats_interval_secs: Option<u64>,
}

impl IngestConfigBuilder {
    pub fn listen(mut self, addr: impl Into<String>) -> Self {
        self.listen = Some(addr.into());
        self
    }

    pub fn database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = Some(path.into());
        self
    }

    pub fn dead_letter_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.dead_letter_path = Some(path.into());
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn stats_interval_secs(mut self, secs: u64) -> Self {
        self.stats_interval_secs = Some(secs);
        self
    }

    pub fn build(self) -> IngestConfig {
        let defaults = IngestConfig::default();

        IngestConfig {
            listen: self.listen.unwrap_or(defaults.listen),
            database: self.database.unwrap_or(defaults.database),
            dead_letter_path: self.dead_letter_path.unwrap_or(defaults.dead_letter_path),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            stats_interval_secs: self
                .stats_interval_secs
                .unwrap_or(defaults.stats_interval_secs),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fleet_defaults() {
        let config = FleetConfig::default();
        assert_eq!(config.devices, 1000);
        assert_eq!(config.key_frame_gap, 100);
        assert_eq!(config.pool_size, 100);
        assert_eq!(config.message_delay_ms, 1000);
        assert!(config.run_duration().is_none());
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline_config(), PipelineConfig::default());
    }

    #[test]
    fn test_fleet_builder() {
        let config = FleetConfig::builder()
            .endpoint("10.0.0.1:9000")
            .devices(5)
            .run_seconds(30)
            .key_frame_gap(10)
            .pool_size(4)
            .seed(99)
            .build();

        assert_eq!(config.endpoint, "10.0.0.1:9000");
        assert_eq!(config.devices, 5);
        assert_eq!(config.run_duration(), Some(Duration::from_secs(30)));
        assert_eq!(config.pipeline_config().key_frame_interval, 10);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.seed, Some(99));
        assert_eq!(config.message_delay_ms, 1000);
    }

    #[test]
    fn test_fleet_validation() {
        assert!(FleetConfig::builder().devices(0).build().validate().is_err());
        assert!(FleetConfig::builder().pool_size(0).build().validate().is_err());
        let inverted = FleetConfig {
            random_key_frame_min: 100,
            random_key_frame_max: 10,
            ..Default::default()
        };
        assert!(matches!(inverted.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_fleet_toml_roundtrip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fleet.toml");
        let config = FleetConfig::builder().devices(12).max_messages(50).build();
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = FleetConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: FleetConfig = toml::from_str("devices = 3\nrun_seconds = 60\n").unwrap();
        assert_eq!(config.devices, 3);
        assert_eq!(config.run_seconds, 60);
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "devices = 0\n").unwrap();
        assert!(matches!(
            FleetConfig::from_file(&path),
            Err(ConfigError::Invalid(_))
        ));

        std::fs::write(&path, "devices = \"many\"\n").unwrap();
        assert!(matches!(
            FleetConfig::from_file(&path),
            Err(ConfigError::Toml(_))
        ));

        assert!(matches!(
            FleetConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_ingest_config() {
        let config = IngestConfig::builder()
            .listen("127.0.0.1:0")
            .database("/tmp/state.db")
            .batch_size(32)
            .build();
        assert!(config.validate().is_ok());
        assert_eq!(config.server_settings().batch_size, 32);
        assert_eq!(config.dead_letter_path, PathBuf::from("dead-letters.jsonl"));

        let parsed: IngestConfig = toml::from_str(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, config);

        let bad = IngestConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
