//! # Error Taxonomy
//!
//! Errors surfaced by the real-time layer. Only connection establishment is
//! ever returned to a caller; protocol problems are logged and dropped at the
//! dispatch boundary and duplicate data points are not errors at all.

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Errors returned by [`ConnectionManager`](crate::core::ConnectionManager) operations.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The URL passed to `connect` is not a usable WebSocket endpoint.
    #[error("invalid WebSocket URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The transport did not report "open" before the connection timeout elapsed.
    #[error("connection to {url} timed out after {timeout_ms}ms")]
    ConnectionTimeout { url: String, timeout_ms: u64 },

    /// The transport refused or failed the handshake.
    #[error("failed to establish connection to {url}: {source}")]
    ConnectionEstablishment {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// The connection was torn down before the pending `connect` resolved.
    #[error("connection closed before it was established")]
    ConnectionClosed,
}

/// Problems with an inbound frame. These never reach subscribers.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not valid JSON or not a JSON object.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The frame parsed but carries no usable `type` field.
    #[error("frame has no topic")]
    MissingTopic,

    /// A well-known topic carried data its decoder rejected.
    #[error("invalid '{topic}' payload: {source}")]
    InvalidPayload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    /// Binary frames are not part of the protocol.
    #[error("unexpected binary frame ({0} bytes)")]
    BinaryFrame(usize),
}

/// Errors raised while loading a [`RealtimeConfig`](crate::configs::RealtimeConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
