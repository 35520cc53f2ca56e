//! # Connection Manager Integration Tests
//!
//! Drives a real `ConnectionManager` against the in-process test server:
//! reference counting, forced teardown, outbound sends, heartbeats, routing,
//! close-code handling, reconnection and the retry budget.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_realtime::{ConnectionConfig, ConnectionManager, ConnectionStatus, Envelope, RealtimeError};
use project_tests::{wait_until, within, TestServer};
use serde_json::json;
use tokio::net::TcpListener;

const STEP: Duration = Duration::from_secs(5);

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_config() -> ConnectionConfig {
    ConnectionConfig {
        connection_timeout_ms: 1000,
        min_reconnect_delay_ms: 20,
        reconnect_jitter_ms: 0,
        max_reconnect_delay_ms: 100,
        close_timeout_ms: 200,
        ..ConnectionConfig::default()
    }
}

/// Accepts TCP connections and holds them without answering the handshake.
async fn stalled_listener() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    (url, holder)
}

fn record_statuses(manager: &ConnectionManager) -> (Arc<Mutex<Vec<ConnectionStatus>>>, lib_realtime::Subscription) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let subscription = manager.on_status_change(move |status| s.lock().unwrap().push(status));
    (seen, subscription)
}

#[tokio::test]
async fn test_two_connects_share_one_socket() {
    init();
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(fast_config());

    within(STEP, manager.connect(&server.url())).await.unwrap();
    within(STEP, manager.connect(&server.url())).await.unwrap();
    assert!(manager.is_connected());
    assert_eq!(manager.ref_count(), 2);
    assert!(wait_until(STEP, || server.accepted() == 1).await);

    manager.disconnect();
    assert!(manager.is_connected());
    assert_eq!(manager.ref_count(), 1);

    manager.disconnect();
    assert!(!manager.is_connected());
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert_eq!(manager.ref_count(), 0);
    assert!(wait_until(STEP, || server.open_connections() == 0).await);
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn test_force_disconnect_ignores_outstanding_references() {
    init();
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(fast_config());
    for _ in 0..3 {
        within(STEP, manager.connect(&server.url())).await.unwrap();
    }
    assert_eq!(manager.ref_count(), 3);

    manager.force_disconnect();
    assert_eq!(manager.ref_count(), 0);
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    assert!(wait_until(STEP, || server.open_connections() == 0).await);

    // A later disconnect has nothing left to release.
    manager.disconnect();
    assert_eq!(manager.ref_count(), 0);
}

#[tokio::test]
async fn test_send_only_while_connected() {
    init();
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(fast_config());
    let command = Envelope::new("command", json!({ "op": "reset", "line": "line-1" }));
    assert!(!manager.send(&command));

    within(STEP, manager.connect(&server.url())).await.unwrap();
    assert!(manager.send(&command));
    assert!(wait_until(STEP, || server.received_of_type("command").len() == 1).await);
    assert_eq!(server.received_of_type("command")[0]["data"]["op"], "reset");
    assert!(wait_until(STEP, || manager.get_connection_stats().messages_sent == 1).await);

    manager.disconnect();
    assert!(!manager.send(&command));
}

#[tokio::test]
async fn test_heartbeat_carries_client_id() {
    init();
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(ConnectionConfig {
        heartbeat_interval_ms: 50,
        ..fast_config()
    });
    within(STEP, manager.connect(&server.url())).await.unwrap();

    assert!(wait_until(STEP, || server.received_of_type("ping").len() >= 2).await);
    let ping = &server.received_of_type("ping")[0];
    assert_eq!(ping["data"]["client_id"], manager.client_id());
    assert!(ping["data"]["last_heartbeat"].is_string());
    assert!(manager.get_connection_stats().last_heartbeat_at.is_some());
    manager.disconnect();
}

#[tokio::test]
async fn test_heartbeat_can_be_disabled() {
    init();
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(ConnectionConfig {
        heartbeat_interval_ms: 20,
        enable_heartbeat: false,
        ..fast_config()
    });
    within(STEP, manager.connect(&server.url())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(server.received_of_type("ping").is_empty());
    manager.disconnect();
}

#[tokio::test]
async fn test_inbound_frames_are_routed_by_topic() {
    init();
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(fast_config());
    let exact = Arc::new(AtomicUsize::new(0));
    let wildcard = Arc::new(AtomicUsize::new(0));
    let (e, w) = (Arc::clone(&exact), Arc::clone(&wildcard));
    let _exact = manager.subscribe("production_data", move |_| {
        e.fetch_add(1, Ordering::SeqCst);
    });
    let _wild = manager.subscribe("*", move |_| {
        w.fetch_add(1, Ordering::SeqCst);
    });

    within(STEP, manager.connect(&server.url())).await.unwrap();
    assert!(wait_until(STEP, || server.open_connections() == 1).await);

    server.push(
        json!({ "type": "production_data", "timestamp": "2024-05-01T12:00:00Z",
                "data": { "sourceId": "line-1", "timestamp": 1, "temperature": 70.5 } })
        .to_string(),
    );
    server.push(json!({ "type": "system_status", "timestamp": "2024-05-01T12:00:00Z", "data": { "status": "ok" } }).to_string());
    server.push("this is not json");
    server.push(json!({ "timestamp": "2024-05-01T12:00:00Z", "data": {} }).to_string());

    assert!(wait_until(STEP, || manager.get_connection_stats().messages_received == 4).await);
    assert_eq!(exact.load(Ordering::SeqCst), 1);
    assert_eq!(wildcard.load(Ordering::SeqCst), 2);
    assert_eq!(manager.get_connection_stats().protocol_errors, 2);
    manager.disconnect();
}

#[tokio::test]
async fn test_abnormal_drop_triggers_reconnect() {
    init();
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(fast_config());
    within(STEP, manager.connect(&server.url())).await.unwrap();
    let (statuses, _sub) = record_statuses(&manager);
    assert!(wait_until(STEP, || server.open_connections() == 1).await);

    server.abort_all();

    assert!(wait_until(STEP, || server.accepted() == 2 && manager.is_connected()).await);
    assert!(statuses.lock().unwrap().contains(&ConnectionStatus::Reconnecting));
    assert_eq!(manager.ref_count(), 1);
    assert_eq!(manager.get_connection_stats().reconnect_attempt, 0);
    manager.disconnect();
}

#[tokio::test]
async fn test_error_close_code_triggers_reconnect() {
    init();
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(fast_config());
    within(STEP, manager.connect(&server.url())).await.unwrap();
    assert!(wait_until(STEP, || server.open_connections() == 1).await);

    server.close_all(1011);

    assert!(wait_until(STEP, || server.accepted() == 2 && manager.is_connected()).await);
    manager.disconnect();
}

#[tokio::test]
async fn test_normal_close_ends_the_connection() {
    init();
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(fast_config());
    within(STEP, manager.connect(&server.url())).await.unwrap();
    assert!(wait_until(STEP, || server.open_connections() == 1).await);

    server.close_all(1000);

    assert!(wait_until(STEP, || manager.status() == ConnectionStatus::Disconnected).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.accepted(), 1);
    assert_eq!(manager.ref_count(), 1);

    // The next connect opens a fresh socket.
    within(STEP, manager.connect(&server.url())).await.unwrap();
    assert!(manager.is_connected());
    assert!(wait_until(STEP, || server.accepted() == 2).await);
    manager.force_disconnect();
}

#[tokio::test]
async fn test_manual_reconnect_replaces_the_socket() {
    init();
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(fast_config());
    within(STEP, manager.connect(&server.url())).await.unwrap();
    assert!(wait_until(STEP, || server.accepted() == 1).await);

    manager.reconnect();

    assert!(wait_until(STEP, || server.accepted() == 2 && manager.is_connected()).await);
    assert!(wait_until(STEP, || server.open_connections() == 1).await);
    manager.disconnect();
}

#[tokio::test]
async fn test_connect_times_out_when_handshake_stalls() {
    init();
    let (url, holder) = stalled_listener().await;
    let manager = ConnectionManager::new(ConnectionConfig {
        connection_timeout_ms: 150,
        ..fast_config()
    });
    let err = within(STEP, manager.connect(&url))
        .await
        .unwrap_err();

    assert!(matches!(err, RealtimeError::ConnectionTimeout { timeout_ms: 150, .. }));
    assert_eq!(manager.status(), ConnectionStatus::Error);
    assert_eq!(manager.ref_count(), 0);
    holder.abort();
}

#[tokio::test]
async fn test_retry_budget_is_enforced() {
    init();
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(ConnectionConfig {
        max_retries: Some(2),
        min_reconnect_delay_ms: 10,
        max_reconnect_delay_ms: 20,
        ..fast_config()
    });
    within(STEP, manager.connect(&server.url())).await.unwrap();
    assert!(wait_until(STEP, || server.open_connections() == 1).await);

    server.shutdown();

    let exhausted = || {
        let stats = manager.get_connection_stats();
        stats.status == ConnectionStatus::Error
            && stats.reconnect_attempt == 2
            && stats.next_reconnect_delay_ms.is_none()
    };
    assert!(wait_until(STEP, exhausted).await);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(manager.status(), ConnectionStatus::Error);
    assert_eq!(manager.ref_count(), 1);

    // A manual reconnect starts a fresh attempt sequence.
    let (statuses, _sub) = record_statuses(&manager);
    manager.reconnect();
    assert!(statuses.lock().unwrap().contains(&ConnectionStatus::Connecting));
    manager.force_disconnect();
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_abandoned_connect_releases_its_reference() {
    init();
    let (url, holder) = stalled_listener().await;
    let manager = ConnectionManager::new(ConnectionConfig {
        connection_timeout_ms: 200,
        ..fast_config()
    });

    // The caller stops waiting long before the session gives up.
    let gave_up = tokio::time::timeout(Duration::from_millis(50), manager.connect(&url))
        .await
        .is_err();
    assert!(gave_up);
    assert_eq!(manager.ref_count(), 1);

    assert!(wait_until(STEP, || manager.status() == ConnectionStatus::Error).await);
    assert_eq!(manager.ref_count(), 0);

    manager.disconnect();
    assert_eq!(manager.ref_count(), 0);
    holder.abort();
}

#[tokio::test]
async fn test_cancelled_connect_leaves_later_references_alone() {
    init();
    let (stalled_url, holder) = stalled_listener().await;
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(fast_config());

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect(&stalled_url).await }
    });
    assert!(wait_until(STEP, || manager.status() == ConnectionStatus::Connecting).await);

    // Forced teardown and a new caller while the first connect is still pending.
    manager.force_disconnect();
    within(STEP, manager.connect(&server.url())).await.unwrap();

    assert!(matches!(
        within(STEP, pending).await.unwrap(),
        Err(RealtimeError::ConnectionClosed)
    ));
    assert_eq!(manager.ref_count(), 1);
    assert!(manager.is_connected());

    manager.disconnect();
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    holder.abort();
}

#[tokio::test]
async fn test_heartbeat_stops_when_leaving_connected() {
    init();
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(ConnectionConfig {
        heartbeat_interval_ms: 20,
        ..fast_config()
    });
    let last_heartbeat = || manager.get_connection_stats().last_heartbeat_at;

    // Disconnect: the server sees no further pings.
    within(STEP, manager.connect(&server.url())).await.unwrap();
    assert!(wait_until(STEP, || server.received_of_type("ping").len() >= 2).await);
    manager.disconnect();
    assert!(wait_until(STEP, || server.open_connections() == 0).await);
    let pings = server.received_of_type("ping").len();
    let stamp = last_heartbeat();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(server.received_of_type("ping").len(), pings);
    assert_eq!(last_heartbeat(), stamp);

    // Lost connection with reconnects failing: no heartbeat while reconnecting.
    within(STEP, manager.connect(&server.url())).await.unwrap();
    assert!(wait_until(STEP, || server.received_of_type("ping").len() >= pings + 2).await);
    server.shutdown();
    assert!(wait_until(STEP, || !manager.is_connected()).await);
    let stamp = last_heartbeat();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!manager.is_connected());
    assert_eq!(last_heartbeat(), stamp);
    manager.force_disconnect();
}

#[tokio::test]
async fn test_reconnect_while_opening_keeps_the_new_socket() {
    init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let manager = ConnectionManager::new(fast_config());

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect(&url).await }
    });
    let (stream, _) = within(STEP, listener.accept()).await.unwrap();
    assert_eq!(manager.status(), ConnectionStatus::Connecting);

    manager.reconnect();

    let _ws = within(STEP, tokio_tungstenite::accept_async(stream)).await.unwrap();
    within(STEP, pending).await.unwrap().unwrap();
    assert!(manager.is_connected());

    let another = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(another.is_err(), "the fresh socket was replaced");
    assert!(manager.is_connected());
    manager.force_disconnect();
}

#[tokio::test]
async fn test_server_ping_gets_exactly_one_pong() {
    init();
    let server = TestServer::start().await;
    let manager = ConnectionManager::new(ConnectionConfig {
        enable_heartbeat: false,
        ..fast_config()
    });
    within(STEP, manager.connect(&server.url())).await.unwrap();
    assert!(wait_until(STEP, || server.open_connections() == 1).await);

    server.ping_all();

    assert!(wait_until(STEP, || server.pongs() >= 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.pongs(), 1);
    assert!(manager.is_connected());
    manager.disconnect();
}

#[test]
fn test_release_profile_keeps_unwinding() {
    // Handler panics are caught with catch_unwind; aborting on panic would
    // turn one faulty subscriber into a process exit.
    let manifest = include_str!("../../Cargo.toml");
    let release = manifest
        .split("[profile.release]")
        .nth(1)
        .map(|rest| rest.split("\n[").next().unwrap_or(rest))
        .unwrap_or("");
    let aborts = release
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").replace(' ', ""))
        .any(|line| line == "panic=\"abort\"");
    assert!(!aborts);
}
