// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{DEFAULT_BATCH_SIZE, DEFAULT_COLLECTOR_PORT, DEFAULT_MAX_CONNECTIONS};
use crate::errors::ConfigError;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration for the agent that tails the record stream.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Binary record stream to tail (e.g., /var/adm/wtmpx)
    pub record_file: PathBuf,
    /// Directory holding the staging artifacts and the checkpoint
    pub staging_dir: PathBuf,
    /// Maximum number of records decoded per cycle
    pub batch_size: usize,
    /// Collector address (e.g., 127.0.0.1:8088)
    pub collector_addr: String,
    pub connect_timeout: Duration,
    /// Bounds both sending a batch and waiting for its acknowledgement
    pub response_timeout: Duration,
    /// Pause after a cycle in which no stage made progress
    pub idle_interval: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            record_file: PathBuf::from("wtmpx"),
            staging_dir: PathBuf::from("."),
            batch_size: DEFAULT_BATCH_SIZE,
            collector_addr: format!("127.0.0.1:{DEFAULT_COLLECTOR_PORT}"),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(30),
            idle_interval: Duration::from_secs(1),
            log_level: "info".to_string(),
        }
    }
}

impl AgentConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            record_file: env::var("SESSIONLOG_RECORD_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.record_file),
            staging_dir: env::var("SESSIONLOG_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.staging_dir),
            batch_size: parse_var("SESSIONLOG_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            collector_addr: env::var("SESSIONLOG_COLLECTOR_ADDR")
                .unwrap_or(defaults.collector_addr),
            connect_timeout: parse_var("SESSIONLOG_CONNECT_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            response_timeout: parse_var("SESSIONLOG_RESPONSE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.response_timeout),
            idle_interval: parse_var("SESSIONLOG_IDLE_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_interval),
            log_level: log_level_from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch size must be greater than 0".to_string(),
            ));
        }
        if self.collector_addr.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "collector address cannot be empty".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() || self.response_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "network timeouts must be greater than 0".to_string(),
            ));
        }
        validate_log_level(&self.log_level)
    }
}

/// Configuration for the collector that receives matched sessions.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Host to bind the listener to (e.g., "0.0.0.0")
    pub host: String,
    /// Port to listen on; 0 picks a free port
    pub port: u16,
    /// Append-only log every received line ends up in
    pub output_log: PathBuf,
    /// Maximum number of connections handled at once
    pub max_connections: usize,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_COLLECTOR_PORT,
            output_log: PathBuf::from("server-log.txt"),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            log_level: "info".to_string(),
        }
    }
}

impl CollectorConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            host: env::var("SESSIONLOG_HOST").unwrap_or(defaults.host),
            port: parse_var("SESSIONLOG_PORT")?.unwrap_or(defaults.port),
            output_log: env::var("SESSIONLOG_OUTPUT_LOG")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_log),
            max_connections: parse_var("SESSIONLOG_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            log_level: log_level_from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max connections must be greater than 0".to_string(),
            ));
        }
        if self.host.trim().is_empty() {
            return Err(ConfigError::Invalid("host cannot be empty".to_string()));
        }
        validate_log_level(&self.log_level)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn log_level_from_env() -> String {
    env::var("SESSIONLOG_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or_else(|_| "info".to_string())
}

fn validate_log_level(level: &str) -> Result<(), ConfigError> {
    if !VALID_LOG_LEVELS.contains(&level) {
        return Err(ConfigError::Invalid(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )));
    }
    Ok(())
}

/// Reads and parses an optional variable. Unset is `None`; set but unparseable is an error.
fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{name} has an invalid value '{raw}'"))),
        Err(_) => Ok(None),
    }
}
