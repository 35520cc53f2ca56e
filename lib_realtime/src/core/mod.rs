//! # Core Engine Module
//!
//! The real-time distribution layer: one shared WebSocket connection, the
//! per-source buffers fed from it and the subscription plumbing in between.
//!
//! ## Core Components:
//!
//! - **`connection_manager`**: Reference-counted owner of the single logical
//!   connection. Routes inbound frames to topic subscribers (with a `*`
//!   wildcard), publishes status changes and exposes diagnostics.
//!
//! - **`session`**: The task that owns the socket for one connection span,
//!   including heartbeat and automatic reconnection.
//!
//! - **`backoff`**: The reconnect schedule as a pure function plus the
//!   retry state carried between attempts.
//!
//! - **`registry`**: Observer lists and the `Subscription` handle returned by
//!   every `subscribe*` call.
//!
//! - **`data_queue`**: Bounded, deduplicating FIFO of data points for one source.
//!
//! - **`distribution`**: Turns `production_data` messages into per-source queues
//!   and fans updates out to stream, latest and global subscribers.

/// Reconnect backoff policy and state.
pub mod backoff;
/// Reference-counted shared WebSocket connection.
pub mod connection_manager;
/// Bounded per-source buffer with timestamp deduplication.
pub mod data_queue;
/// Per-source buffering and three-tier fan-out.
pub mod distribution;
/// Observer lists and subscription handles.
pub mod registry;
mod session;

// --- Public API Re-exports ---
pub use backoff::{Backoff, BackoffPolicy};
pub use connection_manager::{ConnectionManager, StatusHandler};
pub use data_queue::{DataQueue, DEFAULT_CAPACITY};
pub use distribution::{DataDistributionService, GlobalCallback, LatestCallback, StreamCallback};
pub use registry::{MessageHandler, Subscription};
