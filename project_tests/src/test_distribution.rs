//! # Distribution Service Integration Tests
//!
//! Frames pushed by the in-process test server travel through the
//! `ConnectionManager` into the `DataDistributionService` and out to
//! stream, latest and global subscribers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_realtime::{
    ConnectionConfig, ConnectionManager, DataDistributionService, DistributionConfig,
};
use project_tests::{wait_until, within, TestServer};
use serde_json::json;

const STEP: Duration = Duration::from_secs(5);

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn reading(source: &str, ts: i64) -> String {
    json!({
        "type": "production_data",
        "timestamp": "2024-05-01T12:00:00Z",
        "data": { "sourceId": source, "timestamp": ts, "temperature": 70 + ts }
    })
    .to_string()
}

async fn connected_service(server: &TestServer, capacity: usize) -> DataDistributionService {
    let connection = ConnectionManager::new(ConnectionConfig {
        min_reconnect_delay_ms: 20,
        reconnect_jitter_ms: 0,
        max_reconnect_delay_ms: 100,
        ..ConnectionConfig::default()
    });
    let service = DataDistributionService::new(
        connection.clone(),
        DistributionConfig {
            capacity_per_source: capacity,
            ..DistributionConfig::default()
        },
    );
    service.start();
    within(STEP, connection.connect(&server.url())).await.unwrap();
    assert!(wait_until(STEP, || server.open_connections() == 1).await);
    service
}

#[tokio::test]
async fn test_end_to_end_buffering_and_fan_out() {
    init();
    let server = TestServer::start().await;
    let service = connected_service(&server, 3).await;

    let stream_sizes: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let global_calls: Arc<Mutex<Vec<(String, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let (s, g) = (Arc::clone(&stream_sizes), Arc::clone(&global_calls));
    let _stream = service.subscribe("line-1", move |buffer| s.lock().unwrap().push(buffer.len()));
    let _global = service.subscribe_global(move |source, buffer| {
        g.lock().unwrap().push((source.to_string(), buffer.len()))
    });

    for ts in [1, 2, 2, 3, 4] {
        server.push(reading("line-1", ts));
    }
    server.push(reading("line-2", 10));
    server.push(
        json!({ "type": "message", "timestamp": "2024-05-01T12:00:01Z",
                "data": { "sourceId": "line-2", "level": "critical", "content": "Jam at station 4" } })
        .to_string(),
    );
    server.push(json!({ "type": "system_status", "timestamp": "2024-05-01T12:00:02Z", "data": { "status": "degraded" } }).to_string());
    server.push("{ broken");
    server.push(json!({ "timestamp": "2024-05-01T12:00:03Z", "data": { "sourceId": "line-1", "timestamp": 99 } }).to_string());

    let connection = service.connection().clone();
    assert!(wait_until(STEP, || connection.get_connection_stats().messages_received == 10).await);

    let stats = service.get_stats();
    assert_eq!(stats.data_points_processed, 5);
    assert_eq!(stats.duplicates_skipped, 1);
    assert_eq!(stats.alarms_received, 1);
    assert_eq!(stats.error_count, 0);
    assert_eq!(stats.queues["line-1"].size, 3);
    assert_eq!(stats.queues["line-1"].time_span, 2);
    assert_eq!(connection.get_connection_stats().protocol_errors, 2);

    let history: Vec<i64> = service.get_history_data("line-1").iter().map(|p| p.timestamp).collect();
    assert_eq!(history, vec![2, 3, 4]);
    assert_eq!(*stream_sizes.lock().unwrap(), vec![0, 1, 2, 3, 3]);
    assert_eq!(
        *global_calls.lock().unwrap(),
        vec![
            ("line-1".to_string(), 0),
            ("line-1".to_string(), 1),
            ("line-1".to_string(), 2),
            ("line-1".to_string(), 3),
            ("line-1".to_string(), 3),
            ("line-2".to_string(), 0),
            ("line-2".to_string(), 1),
        ]
    );
    assert_eq!(
        service.recent_alarms()[0].content.as_deref(),
        Some("Jam at station 4")
    );
    assert_eq!(
        service.latest_system_status().and_then(|s| s.status).as_deref(),
        Some("degraded")
    );
    assert_eq!(service.get_all_latest_data()["line-2"].timestamp, 10);

    connection.force_disconnect();
}

#[tokio::test]
async fn test_disposed_subscription_stays_silent() {
    init();
    let server = TestServer::start().await;
    let service = connected_service(&server, 60).await;

    let calls = Arc::new(Mutex::new(0usize));
    let c = Arc::clone(&calls);
    let subscription = service.subscribe("line-1", move |_| *c.lock().unwrap() += 1);

    server.push(reading("line-1", 1));
    assert!(wait_until(STEP, || service.get_history_data("line-1").len() == 1).await);
    subscription.unsubscribe();

    server.push(reading("line-1", 2));
    server.push(reading("line-1", 3));
    assert!(wait_until(STEP, || service.get_history_data("line-1").len() == 3).await);
    assert_eq!(*calls.lock().unwrap(), 2);

    service.connection().force_disconnect();
}

#[tokio::test]
async fn test_stop_detaches_from_the_connection() {
    init();
    let server = TestServer::start().await;
    let service = connected_service(&server, 60).await;
    let connection = service.connection().clone();

    server.push(reading("line-1", 1));
    assert!(wait_until(STEP, || service.get_stats().data_points_processed == 1).await);

    service.stop();
    assert!(!service.is_running());
    server.push(reading("line-1", 2));
    assert!(wait_until(STEP, || connection.get_connection_stats().messages_received == 2).await);
    assert_eq!(service.get_stats().data_points_processed, 1);
    assert!(connection.is_connected());

    // Restarting resumes processing; buffered data survived the pause.
    service.start();
    server.push(reading("line-1", 3));
    assert!(wait_until(STEP, || service.get_stats().data_points_processed == 2).await);
    assert_eq!(service.get_history_data("line-1").len(), 2);

    connection.force_disconnect();
}

#[tokio::test]
async fn test_buffers_survive_a_reconnect() {
    init();
    let server = TestServer::start().await;
    let service = connected_service(&server, 60).await;
    let connection = service.connection().clone();

    server.push(reading("line-1", 1));
    assert!(wait_until(STEP, || service.get_stats().data_points_processed == 1).await);

    server.abort_all();
    assert!(wait_until(STEP, || server.accepted() == 2 && connection.is_connected()).await);
    assert!(wait_until(STEP, || server.open_connections() == 1).await);

    // The feed replays its last reading after the reconnect; dedup drops it.
    server.push(reading("line-1", 1));
    server.push(reading("line-1", 2));
    assert!(wait_until(STEP, || service.get_stats().data_points_processed == 2).await);
    assert_eq!(service.get_stats().duplicates_skipped, 1);
    assert_eq!(service.get_history_data("line-1").len(), 2);

    connection.force_disconnect();
}
