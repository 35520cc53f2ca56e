//! # Data Models
//!
//! Wire messages and their typed payloads, the data points held in per-source
//! queues, the connection status enum and the diagnostic snapshots.

pub mod connection_status;
pub mod data_point;
pub mod message;
pub mod stats;

pub use connection_status::ConnectionStatus;
pub use data_point::DataPoint;
pub use message::{
    AlarmEvent, DecoderRegistry, Envelope, Heartbeat, Message, Payload, ProductionData,
    SystemStatus, WILDCARD_TOPIC,
};
pub use stats::{ConnectionStats, QueueStats, ServiceStats, SubscriberCounts};
