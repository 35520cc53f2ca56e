use anyhow::{Context, Result};
use clap::Parser;
use lib_realtime::RealtimeConfig;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[clap(about = "Headless consumer of a real-time production feed", version)]
pub struct Args {
    #[clap(long, env = "MONITOR_URL", help = "WebSocket URL of the feed.")]
    pub url: Option<String>,

    #[clap(long, env = "MONITOR_CONFIG_PATH", help = "Path to a JSON/JSON5 real-time layer configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "MONITOR_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "MONITOR_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "MONITOR_STATS_INTERVAL_SECONDS", help = "Seconds between two stats reports.")]
    pub stats_interval_seconds: Option<u64>,

    #[clap(long, env = "MONITOR_WATCH", value_delimiter = ',', help = "Source ids whose latest value is logged on every update.")]
    pub watch: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub url: String,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub stats_interval_seconds: u64,
    pub watch: Vec<String>,
    pub realtime: RealtimeConfig,
}

impl MonitorConfig {
    /// Resolves CLI/env arguments; the real-time layer config is read from
    /// `--config-path` (or `realtime.json5` if present) and then `REALTIME_*`.
    pub fn resolve(args: Args) -> Result<Self> {
        let config_path = args
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("realtime.json5"));

        let mut realtime = if config_path.exists() {
            RealtimeConfig::from_file(&config_path)
                .with_context(|| format!("loading {}", config_path.display()))?
        } else if args.config_path.is_some() {
            anyhow::bail!("config file {} not found", config_path.display());
        } else {
            RealtimeConfig::default()
        };
        realtime.apply_env_overrides()?;

        Ok(Self {
            url: args
                .url
                .unwrap_or_else(|| "ws://127.0.0.1:9100/ws".to_string()),
            log_dir: args.log_dir.unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: args.log_level.unwrap_or_else(|| "info".to_string()),
            stats_interval_seconds: args.stats_interval_seconds.unwrap_or(15).max(1),
            watch: args.watch,
            realtime,
        })
    }
}

pub fn load_config() -> Result<MonitorConfig> {
    MonitorConfig::resolve(Args::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolve_reads_realtime_file() {
        let mut file = tempfile::Builder::new().suffix(".json5").tempfile().unwrap();
        writeln!(file, "{{ distribution: {{ capacityPerSource: 10 }} }}").unwrap();

        let config = MonitorConfig::resolve(Args {
            config_path: Some(file.path().to_path_buf()),
            watch: vec!["line-1".to_string()],
            ..Default::default()
        })
        .unwrap();

        assert_eq!(config.realtime.distribution.capacity_per_source, 10);
        assert_eq!(config.url, "ws://127.0.0.1:9100/ws");
        assert_eq!(config.watch, vec!["line-1".to_string()]);
    }

    #[test]
    fn test_resolve_rejects_missing_explicit_file() {
        let result = MonitorConfig::resolve(Args {
            config_path: Some(PathBuf::from("/definitely/not/here.json5")),
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
