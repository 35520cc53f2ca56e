//! # Real-time Layer Configuration
//!
//! Every field is optional on input. Missing fields take the defaults below,
//! so an empty JSON object is a valid configuration file.

use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::backoff::BackoffPolicy;
use crate::error::ConfigError;

/// Topics the distribution service subscribes to when none are configured.
pub const DEFAULT_TOPICS: [&str; 3] = ["production_data", "message", "system_status"];

/// Settings for [`ConnectionManager`](crate::core::ConnectionManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    /// How long `connect()` waits for the transport to open.
    pub connection_timeout_ms: u64,
    /// Base reconnect delay before growth is applied.
    pub min_reconnect_delay_ms: u64,
    /// Upper bound of the uniform jitter added to every reconnect delay.
    pub reconnect_jitter_ms: u64,
    /// Cap on the exponential part of the reconnect delay.
    pub max_reconnect_delay_ms: u64,
    pub reconnect_growth_factor: f64,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub heartbeat_interval_ms: u64,
    pub enable_heartbeat: bool,
    /// Bound on the graceful close handshake during teardown.
    pub close_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 4000,
            min_reconnect_delay_ms: 1000,
            reconnect_jitter_ms: 4000,
            max_reconnect_delay_ms: 60_000,
            reconnect_growth_factor: 1.3,
            max_retries: None,
            heartbeat_interval_ms: 30_000,
            enable_heartbeat: true,
            close_timeout_ms: 1000,
        }
    }
}

impl ConnectionConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// The reconnect policy described by these settings.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            min_delay: Duration::from_millis(self.min_reconnect_delay_ms),
            max_delay: Duration::from_millis(self.max_reconnect_delay_ms),
            growth_factor: self.reconnect_growth_factor,
            jitter: Duration::from_millis(self.reconnect_jitter_ms),
            max_retries: self.max_retries,
        }
    }
}

/// Settings for [`DataDistributionService`](crate::core::DataDistributionService).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DistributionConfig {
    /// Rolling window length of every per-source queue.
    pub capacity_per_source: usize,
    /// Topics the service subscribes to on the connection.
    pub topics: Vec<String>,
    /// How many alarm (`message`) events are retained.
    pub alarm_history: usize,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            capacity_per_source: 60,
            topics: DEFAULT_TOPICS.iter().map(|t| t.to_string()).collect(),
            alarm_history: 50,
        }
    }
}

/// Top-level configuration for the real-time layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeConfig {
    pub connection: ConnectionConfig,
    pub distribution: DistributionConfig,
}

impl RealtimeConfig {
    /// Loads a configuration file. JSON5 is accepted, which makes plain JSON
    /// valid as well.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: RealtimeConfig =
            json5::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a strict JSON document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: RealtimeConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from `REALTIME_*` environment variables.
    ///
    /// Unset variables are ignored; set but unparsable ones are an error so a
    /// typo in a deployment does not silently fall back to defaults.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let c = &mut self.connection;
        override_from_env("REALTIME_CONNECTION_TIMEOUT_MS", &mut c.connection_timeout_ms)?;
        override_from_env("REALTIME_MIN_RECONNECT_DELAY_MS", &mut c.min_reconnect_delay_ms)?;
        override_from_env("REALTIME_RECONNECT_JITTER_MS", &mut c.reconnect_jitter_ms)?;
        override_from_env("REALTIME_MAX_RECONNECT_DELAY_MS", &mut c.max_reconnect_delay_ms)?;
        override_from_env("REALTIME_RECONNECT_GROWTH_FACTOR", &mut c.reconnect_growth_factor)?;
        override_from_env("REALTIME_HEARTBEAT_INTERVAL_MS", &mut c.heartbeat_interval_ms)?;
        override_from_env("REALTIME_ENABLE_HEARTBEAT", &mut c.enable_heartbeat)?;
        override_from_env("REALTIME_CLOSE_TIMEOUT_MS", &mut c.close_timeout_ms)?;
        if let Some(retries) = read_env::<u32>("REALTIME_MAX_RETRIES")? {
            c.max_retries = Some(retries);
        }

        let d = &mut self.distribution;
        override_from_env("REALTIME_CAPACITY_PER_SOURCE", &mut d.capacity_per_source)?;
        override_from_env("REALTIME_ALARM_HISTORY", &mut d.alarm_history)?;
        if let Ok(topics) = env::var("REALTIME_TOPICS") {
            d.topics = topics
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }

        self.validate()
    }

    /// Rejects settings the layer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.connection;
        if c.connection_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connectionTimeoutMs must be > 0".into()));
        }
        if !c.reconnect_growth_factor.is_finite() || c.reconnect_growth_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "reconnectGrowthFactor must be a finite number >= 1".into(),
            ));
        }
        if c.min_reconnect_delay_ms > c.max_reconnect_delay_ms {
            return Err(ConfigError::Invalid(
                "minReconnectDelayMs must not exceed maxReconnectDelayMs".into(),
            ));
        }
        if c.enable_heartbeat && c.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeatIntervalMs must be > 0 when the heartbeat is enabled".into(),
            ));
        }
        if self.distribution.capacity_per_source == 0 {
            return Err(ConfigError::Invalid("capacityPerSource must be > 0".into()));
        }
        Ok(())
    }
}

impl fmt::Display for RealtimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.connection;
        write!(
            f,
            "RealtimeConfig
    Connection timeout: {}ms,
    Reconnect delay: {}ms (+{}ms jitter) x{} up to {}ms,
    Max retries: {},
    Heartbeat: {} every {}ms,
    Capacity per source: {},
    Topics: {:?}
",
            c.connection_timeout_ms,
            c.min_reconnect_delay_ms,
            c.reconnect_jitter_ms,
            c.reconnect_growth_factor,
            c.max_reconnect_delay_ms,
            c.max_retries.map_or_else(|| "unbounded".to_string(), |n| n.to_string()),
            if c.enable_heartbeat { "on" } else { "off" },
            c.heartbeat_interval_ms,
            self.distribution.capacity_per_source,
            self.distribution.topics,
        )
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{} has an invalid value '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

fn override_from_env<T: std::str::FromStr>(key: &str, slot: &mut T) -> Result<(), ConfigError> {
    if let Some(value) = read_env(key)? {
        *slot = value;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = RealtimeConfig::default();
        assert_eq!(config.connection.connection_timeout_ms, 4000);
        assert_eq!(config.connection.max_reconnect_delay_ms, 60_000);
        assert_eq!(config.connection.reconnect_growth_factor, 1.3);
        assert_eq!(config.connection.max_retries, None);
        assert_eq!(config.connection.heartbeat_interval_ms, 30_000);
        assert!(config.connection.enable_heartbeat);
        assert_eq!(config.distribution.capacity_per_source, 60);
        assert_eq!(config.distribution.topics, vec!["production_data", "message", "system_status"]);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = RealtimeConfig::from_json_str(
            r#"{ "connection": { "maxRetries": 5 }, "distribution": { "capacityPerSource": 10 } }"#,
        )
        .unwrap();
        assert_eq!(config.connection.max_retries, Some(5));
        assert_eq!(config.connection.connection_timeout_ms, 4000);
        assert_eq!(config.distribution.capacity_per_source, 10);
        assert_eq!(config.distribution.alarm_history, 50);
    }

    #[test]
    fn test_from_file_accepts_json5() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "{{
                // comments are fine
                connection: {{ heartbeatIntervalMs: 5000, enableHeartbeat: false }},
            }}"
        )
        .unwrap();
        let config = RealtimeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.connection.heartbeat_interval_ms, 5000);
        assert!(!config.connection.enable_heartbeat);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let err = RealtimeConfig::from_json_str(r#"{ "distribution": { "capacityPerSource": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validate_rejects_shrinking_growth_factor() {
        let mut config = RealtimeConfig::default();
        config.connection.reconnect_growth_factor = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = RealtimeConfig::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
