//! Real-time data distribution over a shared WebSocket connection.
//!
//! Construct one [`ConnectionManager`] and one [`DataDistributionService`] at
//! startup and pass them to whatever needs them:
//!
//! ```no_run
//! use lib_realtime::{ConnectionManager, DataDistributionService, RealtimeConfig};
//!
//! # async fn run() -> lib_realtime::Result<()> {
//! let config = RealtimeConfig::default();
//! let connection = ConnectionManager::new(config.connection.clone());
//! let service = DataDistributionService::new(connection.clone(), config.distribution.clone());
//!
//! connection.connect("ws://127.0.0.1:8080/ws").await?;
//! service.start();
//!
//! let _sub = service.subscribe_latest("line-1", |point| {
//!     if let Some(point) = point {
//!         println!("line-1 @ {}: {}", point.timestamp, point.payload);
//!     }
//! });
//! # Ok(())
//! # }
//! ```

pub mod configs;
pub mod core;
pub mod error;
#[cfg(feature = "loggers")]
pub mod loggers;
pub mod models;

pub use crate::configs::{ConnectionConfig, DistributionConfig, RealtimeConfig};
pub use crate::core::{
    Backoff, BackoffPolicy, ConnectionManager, DataDistributionService, DataQueue, Subscription,
};
pub use crate::error::{ConfigError, ProtocolError, RealtimeError, Result};
pub use crate::models::{ConnectionStatus, DataPoint, Envelope, Message, Payload};
