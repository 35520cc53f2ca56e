//! Diagnostic snapshots. All of them serialize to camelCase JSON so a UI can
//! render them directly.

use std::collections::BTreeMap;

use serde::Serialize;

use super::connection_status::ConnectionStatus;

/// Occupancy of one per-source queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    /// `size / max_size * 100`.
    pub utilization_rate: f64,
    /// Milliseconds between the oldest and newest point, 0 with fewer than two.
    pub time_span: i64,
}

/// Subscribers currently registered on the distribution service.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberCounts {
    pub stream: usize,
    pub latest: usize,
    pub global: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub is_running: bool,
    pub messages_received: u64,
    pub data_points_processed: u64,
    pub duplicates_skipped: u64,
    pub alarms_received: u64,
    pub error_count: u64,
    pub subscriber_counts: SubscriberCounts,
    pub queues: BTreeMap<String, QueueStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub status: ConnectionStatus,
    pub url: Option<String>,
    pub ref_count: usize,
    pub client_id: String,
    pub reconnect_attempt: u32,
    pub next_reconnect_delay_ms: Option<u64>,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub protocol_errors: u64,
    pub handler_faults: u64,
    pub connected_since: Option<String>,
    pub last_message_at: Option<String>,
    pub last_heartbeat_at: Option<String>,
    pub topic_count: usize,
    pub handler_count: usize,
}
