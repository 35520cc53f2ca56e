//! # Configuration Module
//!
//! Typed settings for the connection manager and the distribution service,
//! loadable from JSON/JSON5 files and `REALTIME_*` environment variables.

/// Connection, backoff, heartbeat and queue settings.
pub mod config_realtime;

pub use config_realtime::{ConnectionConfig, DistributionConfig, RealtimeConfig, DEFAULT_TOPICS};
