use lib_realtime::models::{ConnectionStats, ServiceStats};
use lib_realtime::DataPoint;

/// One-line summary of the service counters.
pub fn summarize(stats: &ServiceStats) -> String {
    format!(
        "running={} received={} processed={} duplicates={} alarms={} errors={} sources={} subscribers={}/{}/{}",
        stats.is_running,
        stats.messages_received,
        stats.data_points_processed,
        stats.duplicates_skipped,
        stats.alarms_received,
        stats.error_count,
        stats.queues.len(),
        stats.subscriber_counts.stream,
        stats.subscriber_counts.latest,
        stats.subscriber_counts.global,
    )
}

/// Per-source queue occupancy, one line per source.
pub fn queue_lines(stats: &ServiceStats) -> Vec<String> {
    stats
        .queues
        .iter()
        .map(|(source, q)| {
            format!(
                "{}: {}/{} ({:.0}%) spanning {}ms",
                source, q.size, q.max_size, q.utilization_rate, q.time_span
            )
        })
        .collect()
}

pub fn connection_line(stats: &ConnectionStats) -> String {
    format!(
        "status={} refs={} received={} sent={} protocol_errors={} reconnect_attempt={}",
        stats.status,
        stats.ref_count,
        stats.messages_received,
        stats.messages_sent,
        stats.protocol_errors,
        stats.reconnect_attempt,
    )
}

pub fn point_line(point: &DataPoint) -> String {
    format!("{} @{} {}", point.source_id, point.timestamp, point.payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_realtime::models::{QueueStats, SubscriberCounts};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_summaries() {
        let mut queues = BTreeMap::new();
        queues.insert(
            "line-1".to_string(),
            QueueStats {
                size: 30,
                max_size: 60,
                utilization_rate: 50.0,
                time_span: 29_000,
            },
        );
        let stats = ServiceStats {
            is_running: true,
            messages_received: 40,
            data_points_processed: 30,
            duplicates_skipped: 5,
            alarms_received: 2,
            error_count: 0,
            subscriber_counts: SubscriberCounts {
                stream: 0,
                latest: 1,
                global: 1,
            },
            queues,
        };

        assert!(summarize(&stats).contains("duplicates=5"));
        assert_eq!(queue_lines(&stats), vec!["line-1: 30/60 (50%) spanning 29000ms"]);
        assert_eq!(
            point_line(&DataPoint::new("line-1", 5, json!({ "t": 1 }))),
            r#"line-1 @5 {"t":1}"#
        );
    }
}
