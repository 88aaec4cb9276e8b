//! Configuration management for the migration agent.
//!
//! This module provides a centralized configuration system that loads settings from:
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML format)
//! 3. Default values (lowest priority)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration struct for the migration agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Migration tuning knobs read by the driver, ramp, and monitor.
    pub migration: MigrationConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Migration tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Default target downtime, ms, when a request doesn't override it.
    pub downtime_ms: u64,
    /// Number of increments the downtime ramp steps through.
    pub downtime_steps: u32,
    /// Ramp window, ms of delay per GiB of guest memory.
    pub downtime_delay_ms_per_gib: u64,
    /// Bandwidth cap, MiB/s, passed to the hypervisor transfer call. 0 means
    /// unlimited.
    pub max_bandwidth_mib: u64,
    /// Interval between progress samples; 0 disables the progress monitor.
    #[serde(with = "duration_secs")]
    pub monitor_interval: Duration,
    /// Seconds/GiB of guest memory before the monitor aborts an overrunning
    /// migration. 0 disables the wall-clock check.
    pub max_time_per_gib_mem_secs: u64,
    /// Seconds without lowmark improvement before the monitor aborts a
    /// stalled migration.
    #[serde(with = "duration_secs")]
    pub progress_timeout: Duration,
    /// Use TLS for the peer RPC connection and the migration URI.
    pub ssl: bool,
    /// Capacity of the process-wide migration slot. Only takes effect if
    /// applied before the first migration; see `migration::slot`.
    pub max_outgoing_migrations: usize,
    /// Control-plane port the peer agent listens on; used to canonicalize a
    /// bare hostname destination to `host:port`.
    pub control_port: u16,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Directory for log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
    /// Emit structured JSON instead of the human-readable formatter.
    pub json_format: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            migration: MigrationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            downtime_ms: 500,
            downtime_steps: 10,
            downtime_delay_ms_per_gib: 100,
            max_bandwidth_mib: 0,
            monitor_interval: Duration::from_secs(10),
            max_time_per_gib_mem_secs: 150,
            progress_timeout: Duration::from_secs(150),
            ssl: true,
            max_outgoing_migrations: 1,
            control_port: 54321,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            json_format: false,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables and optional config file
    pub fn load() -> Self {
        let mut config = Self::default();

        // Try to load from config file first
        if let Some(config_path) = Self::find_config_file() {
            if let Ok(file_config) = Self::load_from_file(&config_path) {
                config = file_config;
            }
        }

        // Override with environment variables
        config.apply_env_overrides();

        config
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.clone(), e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            // Environment variable override
            std::env::var("MIGRATION_AGENT_CONFIG").ok().map(PathBuf::from),
            // Standard locations
            Some(PathBuf::from("/etc/migration-agent/config.toml")),
            Some(PathBuf::from("./migration-agent.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MIGRATION_DOWNTIME") {
            if let Ok(v) = v.parse() {
                self.migration.downtime_ms = v;
            }
        }
        if let Ok(v) = std::env::var("MIGRATION_DOWNTIME_STEPS") {
            if let Ok(v) = v.parse() {
                self.migration.downtime_steps = v;
            }
        }
        if let Ok(v) = std::env::var("MIGRATION_DOWNTIME_DELAY") {
            if let Ok(v) = v.parse() {
                self.migration.downtime_delay_ms_per_gib = v;
            }
        }
        if let Ok(v) = std::env::var("MIGRATION_MAX_BANDWIDTH") {
            if let Ok(v) = v.parse() {
                self.migration.max_bandwidth_mib = v;
            }
        }
        if let Ok(v) = std::env::var("MIGRATION_MONITOR_INTERVAL") {
            if let Ok(v) = v.parse::<u64>() {
                self.migration.monitor_interval = Duration::from_secs(v);
            }
        }
        if let Ok(v) = std::env::var("MIGRATION_MAX_TIME_PER_GIB_MEM") {
            if let Ok(v) = v.parse() {
                self.migration.max_time_per_gib_mem_secs = v;
            }
        }
        if let Ok(v) = std::env::var("MIGRATION_PROGRESS_TIMEOUT") {
            if let Ok(v) = v.parse::<u64>() {
                self.migration.progress_timeout = Duration::from_secs(v);
            }
        }
        if let Ok(v) = std::env::var("MIGRATION_SSL") {
            self.migration.ssl = v.parse().unwrap_or(true);
        }
        if let Ok(v) = std::env::var("MIGRATION_MAX_OUTGOING") {
            if let Ok(v) = v.parse() {
                self.migration.max_outgoing_migrations = v;
            }
        }
        if let Ok(v) = std::env::var("MIGRATION_AGENT_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("MIGRATION_AGENT_LOG_DIR") {
            self.logging.log_dir = Some(PathBuf::from(v));
        }
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.migration.downtime_steps == 0 {
            return Err(ConfigError::Validation(
                "migration.downtime_steps must be greater than 0".to_string(),
            ));
        }
        if self.migration.control_port == 0 {
            return Err(ConfigError::Validation(
                "migration.control_port cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Failed to read configuration file
    FileRead(PathBuf, String),
    /// Failed to parse configuration
    Parse(String),
    /// Configuration validation failed
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, err) => {
                write!(f, "Failed to read config file {:?}: {}", path, err)
            }
            ConfigError::Parse(err) => write!(f, "Failed to parse config: {}", err),
            ConfigError::Validation(err) => write!(f, "Config validation failed: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}
