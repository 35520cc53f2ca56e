use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Dummy production-line feed served over WebSocket", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "FEED_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "FEED_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FEED_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FEED_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "FEED_LINES", help = "Number of production lines to simulate.")]
    pub lines: Option<usize>,

    #[clap(long, env = "FEED_INTERVAL_MS", help = "Milliseconds between two readings of the same line.")]
    pub interval_ms: Option<u64>,

    #[clap(long, env = "FEED_DUPLICATE_EVERY", help = "Re-send a previous reading every N ticks (0 disables).")]
    pub duplicate_every: Option<u64>,

    #[clap(long, env = "FEED_STATUS_INTERVAL_SECONDS", help = "Seconds between two system_status frames.")]
    pub status_interval_seconds: Option<u64>,

    #[clap(long, env = "FEED_ALARM_PROBABILITY", help = "Chance per reading (0..1) of raising an alarm.")]
    pub alarm_probability: Option<f64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            lines: other.lines.or(self.lines),
            interval_ms: other.interval_ms.or(self.interval_ms),
            duplicate_every: other.duplicate_every.or(self.duplicate_every),
            status_interval_seconds: other.status_interval_seconds.or(self.status_interval_seconds),
            alarm_probability: other.alarm_probability.or(self.alarm_probability),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(9100),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            lines: Some(3),
            interval_ms: Some(1000),
            duplicate_every: Some(5),
            status_interval_seconds: Some(10),
            alarm_probability: Some(0.02),
            ..Default::default()
        }
    }
}

/// Fully resolved feed settings.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub lines: usize,
    pub interval_ms: u64,
    pub duplicate_every: u64,
    pub status_interval_seconds: u64,
    pub alarm_probability: f64,
}

impl From<Config> for FeedConfig {
    fn from(config: Config) -> Self {
        let defaults = Config::defaults();
        let config = defaults.merge(config);
        FeedConfig {
            port: config.port.unwrap_or(9100),
            log_dir: config.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: config.log_level.unwrap_or_else(|| "info".to_string()),
            lines: config.lines.unwrap_or(3).max(1),
            interval_ms: config.interval_ms.unwrap_or(1000).max(10),
            duplicate_every: config.duplicate_every.unwrap_or(5),
            status_interval_seconds: config.status_interval_seconds.unwrap_or(10).max(1),
            alarm_probability: config.alarm_probability.unwrap_or(0.02).clamp(0.0, 1.0),
        }
    }
}

/// Defaults, then `server_feed.conf` (or `--config-path`), then env/CLI.
pub fn load_config() -> FeedConfig {
    let cli_args = Config::parse();

    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_feed.conf"));

    let mut current_config = Config::defaults();

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => eprintln!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => eprintln!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    }

    FeedConfig::from(current_config.merge(cli_args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_prefers_later_values() {
        let file: Config = serde_json::from_str(r#"{ "port": 9200, "lines": 5 }"#).unwrap();
        let cli = Config {
            lines: Some(7),
            ..Default::default()
        };
        let resolved = FeedConfig::from(Config::defaults().merge(file).merge(cli));
        assert_eq!(resolved.port, 9200);
        assert_eq!(resolved.lines, 7);
        assert_eq!(resolved.interval_ms, 1000);
    }

    #[test]
    fn test_resolved_values_are_clamped() {
        let resolved = FeedConfig::from(Config {
            lines: Some(0),
            alarm_probability: Some(3.0),
            ..Default::default()
        });
        assert_eq!(resolved.lines, 1);
        assert_eq!(resolved.alarm_probability, 1.0);
    }
}
