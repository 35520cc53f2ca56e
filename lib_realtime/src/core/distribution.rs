//! # Data Distribution Service
//!
//! Sits between the [`ConnectionManager`] and the consumers. Inbound
//! `production_data` readings are appended to one [`DataQueue`] per source id
//! and re-published at three granularities:
//!
//! 1. **Stream** - the full rolling buffer of one source.
//! 2. **Latest** - only the newest point of one source.
//! 3. **Global** - `(source_id, buffer)` for every source.
//!
//! Every registration replays the current state synchronously before it
//! returns. Accepted points notify stream, then latest, then global
//! subscribers; duplicates notify nobody.
//!
//! ## Delivery ordering
//!
//! Mutations and their notification rounds run under a per-service delivery
//! lock, so a subscriber never observes an older buffer after a newer one. A
//! callback that re-enters the same service on the same thread (to subscribe,
//! read or clear) runs without taking the lock again. Snapshot getters only
//! take the short state lock and never wait on callbacks.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::configs::DistributionConfig;
use crate::core::connection_manager::ConnectionManager;
use crate::core::data_queue::DataQueue;
use crate::core::registry::{
    invoke_isolated, lock, prune_empty, ObserverList, Snapshot, Subscription,
};
use crate::models::message::TOPIC_PRODUCTION_DATA;
use crate::models::{
    AlarmEvent, DataPoint, Message, Payload, ProductionData, ServiceStats, SubscriberCounts,
    SystemStatus,
};

/// Receives the full buffer of one source, oldest first.
pub type StreamCallback = dyn Fn(&[DataPoint]) + Send + Sync;
/// Receives the newest point of one source, or `None` when it is empty.
pub type LatestCallback = dyn Fn(Option<&DataPoint>) + Send + Sync;
/// Receives `(source_id, buffer)` for any source.
pub type GlobalCallback = dyn Fn(&str, &[DataPoint]) + Send + Sync;

static NEXT_SERVICE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Services whose delivery lock is held further up this thread's stack.
    static DELIVERING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

struct DeliveryMarker(u64);

impl DeliveryMarker {
    fn enter(service_id: u64) -> Self {
        DELIVERING.with(|d| d.borrow_mut().push(service_id));
        Self(service_id)
    }

    fn is_held(service_id: u64) -> bool {
        DELIVERING.with(|d| d.borrow().contains(&service_id))
    }
}

impl Drop for DeliveryMarker {
    fn drop(&mut self) {
        DELIVERING.with(|d| {
            let mut held = d.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&id| id == self.0) {
                held.remove(pos);
            }
        });
    }
}

#[derive(Default)]
struct ServiceCounters {
    messages_received: AtomicU64,
    data_points_processed: AtomicU64,
    duplicates_skipped: AtomicU64,
    alarms_received: AtomicU64,
    error_count: AtomicU64,
}

#[derive(Default)]
struct ServiceState {
    queues: BTreeMap<String, DataQueue>,
    stream: HashMap<String, Arc<ObserverList<StreamCallback>>>,
    latest: HashMap<String, Arc<ObserverList<LatestCallback>>>,
    alarms: VecDeque<AlarmEvent>,
    system_status: Option<SystemStatus>,
    topic_subscriptions: Vec<Subscription>,
    running: bool,
}

fn stream_lists(state: &mut ServiceState) -> &mut HashMap<String, Arc<ObserverList<StreamCallback>>> {
    &mut state.stream
}

fn latest_lists(state: &mut ServiceState) -> &mut HashMap<String, Arc<ObserverList<LatestCallback>>> {
    &mut state.latest
}

/// Everything one notification round needs, captured under the state lock.
struct Round {
    source_id: String,
    buffer: Vec<DataPoint>,
    /// Global subscribers first see a new source with its empty buffer.
    announce: bool,
    stream: Vec<Snapshot<StreamCallback>>,
    latest: Vec<Snapshot<LatestCallback>>,
    global: Vec<Snapshot<GlobalCallback>>,
}

struct ServiceInner {
    id: u64,
    connection: ConnectionManager,
    config: DistributionConfig,
    state: Mutex<ServiceState>,
    delivery: Mutex<()>,
    global: ObserverList<GlobalCallback>,
    counters: ServiceCounters,
}

impl ServiceInner {
    /// Runs `f` while holding the delivery lock, unless this thread already does.
    fn serialized<R>(&self, f: impl FnOnce() -> R) -> R {
        if DeliveryMarker::is_held(self.id) {
            return f();
        }
        let _delivery = lock(&self.delivery);
        let _marker = DeliveryMarker::enter(self.id);
        f()
    }

    /// Cleanup for a per-source list: drops its map entry once it is empty.
    fn pruner<T>(
        self: &Arc<Self>,
        source_id: &str,
        lists: fn(&mut ServiceState) -> &mut HashMap<String, Arc<ObserverList<T>>>,
    ) -> impl FnOnce() + Send + 'static
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let service = Arc::downgrade(self);
        let source_id = source_id.to_string();
        move || {
            if let Some(service) = service.upgrade() {
                let mut state = lock(&service.state);
                prune_empty(lists(&mut state), &source_id);
            }
        }
    }

    fn record_fault(&self, ok: bool) {
        if !ok {
            self.counters.error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_error(&self, reason: std::fmt::Arguments<'_>) {
        self.counters.error_count.fetch_add(1, Ordering::Relaxed);
        log::warn!("{}", reason);
    }

    fn round(&self, state: &ServiceState, source_id: &str, announce: bool) -> Round {
        Round {
            source_id: source_id.to_string(),
            buffer: state
                .queues
                .get(source_id)
                .map(DataQueue::get_all_data)
                .unwrap_or_default(),
            announce,
            stream: state
                .stream
                .get(source_id)
                .map(|l| l.snapshot())
                .unwrap_or_default(),
            latest: state
                .latest
                .get(source_id)
                .map(|l| l.snapshot())
                .unwrap_or_default(),
            global: self.global.snapshot(),
        }
    }

    /// Invokes stream, latest and global subscribers for one source.
    fn notify(&self, round: &Round) {
        for snapshot in &round.stream {
            if let Some(callback) = snapshot.live() {
                self.record_fault(invoke_isolated("stream subscriber", || {
                    callback(round.buffer.as_slice())
                }));
            }
        }
        for snapshot in &round.latest {
            if let Some(callback) = snapshot.live() {
                self.record_fault(invoke_isolated("latest subscriber", || {
                    callback(round.buffer.last())
                }));
            }
        }
        for snapshot in &round.global {
            if round.announce {
                if let Some(callback) = snapshot.live() {
                    self.record_fault(invoke_isolated("global subscriber", || {
                        callback(round.source_id.as_str(), &[] as &[DataPoint])
                    }));
                }
            }
            if let Some(callback) = snapshot.live() {
                self.record_fault(invoke_isolated("global subscriber", || {
                    callback(round.source_id.as_str(), round.buffer.as_slice())
                }));
            }
        }
    }

    fn ingest(&self, message: &Message) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);

        match &message.payload {
            Payload::ProductionData(data) => self.ingest_production(data, &message.timestamp),
            Payload::Opaque(value) if message.topic == TOPIC_PRODUCTION_DATA => {
                match serde_json::from_value::<ProductionData>(value.clone()) {
                    Ok(data) => self.ingest_production(&data, &message.timestamp),
                    Err(e) => self.record_error(format_args!(
                        "Undecodable production data dropped: {}",
                        e
                    )),
                }
            }
            Payload::Alarm(alarm) => {
                self.counters.alarms_received.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "Alarm [{}] from {}: {}",
                    alarm.level.as_deref().unwrap_or("unknown"),
                    alarm.source_id.as_deref().unwrap_or("backend"),
                    alarm.content.as_deref().unwrap_or("")
                );
                let mut state = lock(&self.state);
                state.alarms.push_back(alarm.clone());
                while state.alarms.len() > self.config.alarm_history {
                    state.alarms.pop_front();
                }
            }
            Payload::SystemStatus(status) => {
                log::debug!(
                    "System status: {}",
                    status.status.as_deref().unwrap_or("unknown")
                );
                lock(&self.state).system_status = Some(status.clone());
            }
            Payload::Heartbeat(_) | Payload::Opaque(_) => {
                log::trace!("Ignoring '{}' message", message.topic);
            }
        }
    }

    fn ingest_production(&self, data: &ProductionData, envelope_timestamp: &str) {
        if data.source_id.trim().is_empty() {
            self.record_error(format_args!("Production data without a source id dropped"));
            return;
        }
        match DataPoint::from_production(data, envelope_timestamp) {
            Some(point) => {
                self.add_data_point(point);
            }
            None => self.record_error(format_args!(
                "Production data for '{}' has no usable timestamp",
                data.source_id
            )),
        }
    }

    fn add_data_point(&self, point: DataPoint) -> bool {
        self.serialized(|| {
            let round = {
                let mut state = lock(&self.state);
                let source_id = point.source_id.clone();
                let created = !state.queues.contains_key(&source_id);
                let queue = state.queues.entry(source_id.clone()).or_insert_with(|| {
                    log::debug!("Created queue for source '{}'", source_id);
                    DataQueue::new(source_id.clone(), self.config.capacity_per_source)
                });
                if !queue.add_data_point(point) {
                    self.counters.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                self.counters.data_points_processed.fetch_add(1, Ordering::Relaxed);
                self.round(&state, &source_id, created)
            };
            self.notify(&round);
            true
        })
    }
}

/// Per-source buffering and fan-out on top of a [`ConnectionManager`].
///
/// Cloning is cheap; clones share queues and subscribers.
#[derive(Clone)]
pub struct DataDistributionService {
    inner: Arc<ServiceInner>,
}

impl DataDistributionService {
    pub fn new(connection: ConnectionManager, config: DistributionConfig) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                id: NEXT_SERVICE_ID.fetch_add(1, Ordering::Relaxed),
                connection,
                config,
                state: Mutex::new(ServiceState::default()),
                delivery: Mutex::new(()),
                global: ObserverList::new(),
                counters: ServiceCounters::default(),
            }),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Subscribes to the configured topics on the connection. Idempotent.
    pub fn initialize(&self) {
        let mut state = lock(&self.inner.state);
        if !state.topic_subscriptions.is_empty() {
            return;
        }
        for topic in &self.inner.config.topics {
            let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);
            let subscription = self.inner.connection.subscribe(topic, move |message| {
                if let Some(inner) = weak.upgrade() {
                    inner.ingest(message);
                }
            });
            state.topic_subscriptions.push(subscription);
        }
        log::info!(
            "Distribution service initialized for topics {:?}",
            self.inner.config.topics
        );
    }

    /// Initializes if needed and marks the service running. Idempotent.
    pub fn start(&self) {
        self.initialize();
        let mut state = lock(&self.inner.state);
        if !state.running {
            state.running = true;
            log::info!("Distribution service started");
        }
    }

    /// Drops the topic subscriptions. Buffers and consumer subscriptions are kept.
    pub fn stop(&self) {
        let subscriptions = {
            let mut state = lock(&self.inner.state);
            state.running = false;
            std::mem::take(&mut state.topic_subscriptions)
        };
        if !subscriptions.is_empty() {
            log::info!("Distribution service stopped");
        }
        drop(subscriptions);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.state).running
    }

    /// Processes one decoded message as if it arrived from the connection.
    pub fn ingest(&self, message: &Message) {
        self.inner.ingest(message);
    }

    /// Appends a point to its source queue and notifies subscribers.
    ///
    /// Returns `false` if the source already holds a point with that timestamp.
    pub fn add_data_point(&self, point: DataPoint) -> bool {
        self.inner.add_data_point(point)
    }

    /// Follows the full buffer of `source_id`.
    ///
    /// `callback` is invoked with the current buffer (possibly empty) before
    /// this returns, then again after every accepted point.
    pub fn subscribe<F>(&self, source_id: &str, callback: F) -> Subscription
    where
        F: Fn(&[DataPoint]) + Send + Sync + 'static,
    {
        let callback: Arc<StreamCallback> = Arc::new(callback);
        let inner = &self.inner;
        inner.serialized(|| {
            let (subscription, buffer) = {
                let mut state = lock(&inner.state);
                let list = Arc::clone(
                    state
                        .stream
                        .entry(source_id.to_string())
                        .or_insert_with(|| Arc::new(ObserverList::new())),
                );
                let buffer = state
                    .queues
                    .get(source_id)
                    .map(DataQueue::get_all_data)
                    .unwrap_or_default();
                let subscription = list.add_with_cleanup(
                    Arc::clone(&callback),
                    inner.pruner(source_id, stream_lists),
                );
                (subscription, buffer)
            };
            inner.record_fault(invoke_isolated("stream subscriber", || callback(buffer.as_slice())));
            subscription
        })
    }

    /// Follows only the newest point of `source_id`.
    pub fn subscribe_latest<F>(&self, source_id: &str, callback: F) -> Subscription
    where
        F: Fn(Option<&DataPoint>) + Send + Sync + 'static,
    {
        let callback: Arc<LatestCallback> = Arc::new(callback);
        let inner = &self.inner;
        inner.serialized(|| {
            let (subscription, latest) = {
                let mut state = lock(&inner.state);
                let list = Arc::clone(
                    state
                        .latest
                        .entry(source_id.to_string())
                        .or_insert_with(|| Arc::new(ObserverList::new())),
                );
                let latest = state
                    .queues
                    .get(source_id)
                    .and_then(DataQueue::get_latest_data);
                let subscription = list.add_with_cleanup(
                    Arc::clone(&callback),
                    inner.pruner(source_id, latest_lists),
                );
                (subscription, latest)
            };
            inner.record_fault(invoke_isolated("latest subscriber", || {
                callback(latest.as_ref())
            }));
            subscription
        })
    }

    /// Follows every source.
    ///
    /// Replays `(source_id, buffer)` once per existing source before this
    /// returns. A source that appears later is first announced with an empty
    /// buffer, then delivered with its first point.
    pub fn subscribe_global<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&str, &[DataPoint]) + Send + Sync + 'static,
    {
        let callback: Arc<GlobalCallback> = Arc::new(callback);
        let inner = &self.inner;
        inner.serialized(|| {
            let (subscription, buffers) = {
                let state = lock(&inner.state);
                let buffers: Vec<(String, Vec<DataPoint>)> = state
                    .queues
                    .iter()
                    .map(|(id, queue)| (id.clone(), queue.get_all_data()))
                    .collect();
                (inner.global.add(Arc::clone(&callback)), buffers)
            };
            for (source_id, buffer) in &buffers {
                if !subscription.is_active() {
                    break;
                }
                inner.record_fault(invoke_isolated("global subscriber", || {
                    callback(source_id.as_str(), buffer.as_slice())
                }));
            }
            subscription
        })
    }

    pub fn get_history_data(&self, source_id: &str) -> Vec<DataPoint> {
        lock(&self.inner.state)
            .queues
            .get(source_id)
            .map(DataQueue::get_all_data)
            .unwrap_or_default()
    }

    pub fn get_latest_data(&self, source_id: &str) -> Option<DataPoint> {
        lock(&self.inner.state)
            .queues
            .get(source_id)
            .and_then(DataQueue::get_latest_data)
    }

    pub fn get_recent_data(&self, source_id: &str, count: usize) -> Vec<DataPoint> {
        lock(&self.inner.state)
            .queues
            .get(source_id)
            .map(|q| q.get_recent_data(count))
            .unwrap_or_default()
    }

    /// Newest point of every non-empty source.
    pub fn get_all_latest_data(&self) -> BTreeMap<String, DataPoint> {
        lock(&self.inner.state)
            .queues
            .iter()
            .filter_map(|(id, queue)| queue.get_latest_data().map(|p| (id.clone(), p)))
            .collect()
    }

    /// Known source ids in sorted order, including cleared ones.
    pub fn source_ids(&self) -> Vec<String> {
        lock(&self.inner.state).queues.keys().cloned().collect()
    }

    /// Empties one source and notifies its subscribers with an empty buffer.
    pub fn clear_line_data(&self, source_id: &str) {
        let inner = &self.inner;
        inner.serialized(|| {
            let round = {
                let mut state = lock(&inner.state);
                let Some(queue) = state.queues.get_mut(source_id) else {
                    log::debug!("clear_line_data: unknown source '{}'", source_id);
                    return;
                };
                queue.clear();
                inner.round(&state, source_id, false)
            };
            log::info!("Cleared data for source '{}'", source_id);
            inner.notify(&round);
        });
    }

    /// Empties every source, notifying each source's subscribers.
    pub fn clear_all_data(&self) {
        let inner = &self.inner;
        inner.serialized(|| {
            let rounds: Vec<Round> = {
                let mut state = lock(&inner.state);
                for queue in state.queues.values_mut() {
                    queue.clear();
                }
                let ids: Vec<String> = state.queues.keys().cloned().collect();
                ids.iter().map(|id| inner.round(&state, id, false)).collect()
            };
            log::info!("Cleared data for {} sources", rounds.len());
            for round in &rounds {
                inner.notify(round);
            }
        });
    }

    /// Alarms received so far, oldest first, bounded by `alarm_history`.
    pub fn recent_alarms(&self) -> Vec<AlarmEvent> {
        lock(&self.inner.state).alarms.iter().cloned().collect()
    }

    pub fn latest_system_status(&self) -> Option<SystemStatus> {
        lock(&self.inner.state).system_status.clone()
    }

    pub fn get_stats(&self) -> ServiceStats {
        let counters = &self.inner.counters;
        let state = lock(&self.inner.state);
        ServiceStats {
            is_running: state.running,
            messages_received: counters.messages_received.load(Ordering::Relaxed),
            data_points_processed: counters.data_points_processed.load(Ordering::Relaxed),
            duplicates_skipped: counters.duplicates_skipped.load(Ordering::Relaxed),
            alarms_received: counters.alarms_received.load(Ordering::Relaxed),
            error_count: counters.error_count.load(Ordering::Relaxed),
            subscriber_counts: SubscriberCounts {
                stream: state.stream.values().map(|l| l.len()).sum(),
                latest: state.latest.values().map(|l| l.len()).sum(),
                global: self.inner.global.len(),
            },
            queues: state
                .queues
                .iter()
                .map(|(id, queue)| (id.clone(), queue.get_stats()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::ConnectionConfig;
    use serde_json::json;

    fn service() -> DataDistributionService {
        DataDistributionService::new(
            ConnectionManager::new(ConnectionConfig::default()),
            DistributionConfig::default(),
        )
    }

    fn point(source: &str, ts: i64) -> DataPoint {
        DataPoint::new(source, ts, json!({ "temp": ts }))
    }

    fn timestamps(points: &[DataPoint]) -> Vec<i64> {
        points.iter().map(|p| p.timestamp).collect()
    }

    fn production_frame(source: &str, ts: i64) -> String {
        json!({
            "type": "production_data",
            "timestamp": "2024-05-01T12:00:00Z",
            "data": { "sourceId": source, "timestamp": ts, "temp": 70 }
        })
        .to_string()
    }

    #[test]
    fn test_subscribe_replays_immediately_then_streams() {
        let service = service();
        let calls: Arc<Mutex<Vec<Vec<i64>>>> = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&calls);
        let _sub = service.subscribe("A", move |buffer| lock(&c).push(timestamps(buffer)));

        assert_eq!(*lock(&calls), vec![Vec::<i64>::new()]);
        assert!(service.add_data_point(point("A", 1)));
        assert_eq!(*lock(&calls), vec![vec![], vec![1]]);
    }

    #[test]
    fn test_disposed_subscription_gets_nothing_more() {
        let service = service();
        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let sub = service.subscribe("A", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        service.add_data_point(point("A", 1));
        sub.unsubscribe();
        sub.unsubscribe();
        service.add_data_point(point("A", 2));
        service.add_data_point(point("A", 3));

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(service.get_history_data("A").len(), 3);
    }

    #[test]
    fn test_source_lists_are_pruned_when_last_subscriber_leaves() {
        let service = service();
        for source in ["A", "B", "C"] {
            let stream = service.subscribe(source, |_| {});
            let latest = service.subscribe_latest(source, |_| {});
            drop(stream);
            latest.unsubscribe();
        }
        {
            let state = lock(&service.inner.state);
            assert!(state.stream.is_empty());
            assert!(state.latest.is_empty());
        }

        let count = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&count);
        let _again = service.subscribe("A", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let other = service.subscribe("A", |_| {});
        drop(other);
        assert_eq!(lock(&service.inner.state).stream.len(), 1);
        service.add_data_point(point("A", 1));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_global_fan_out_announces_new_sources() {
        let service = service();
        let calls: Arc<Mutex<Vec<(String, Vec<i64>)>>> = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&calls);
        let _sub = service.subscribe_global(move |source, buffer| {
            lock(&c).push((source.to_string(), timestamps(buffer)))
        });
        assert!(lock(&calls).is_empty());

        service.add_data_point(point("A", 10));
        service.add_data_point(point("B", 20));

        assert_eq!(
            *lock(&calls),
            vec![
                ("A".to_string(), vec![]),
                ("A".to_string(), vec![10]),
                ("B".to_string(), vec![]),
                ("B".to_string(), vec![20]),
            ]
        );
    }

    #[test]
    fn test_global_replays_existing_sources() {
        let service = service();
        service.add_data_point(point("B", 2));
        service.add_data_point(point("A", 1));
        let calls: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&calls);
        let _sub = service.subscribe_global(move |source, _| lock(&c).push(source.to_string()));
        assert_eq!(*lock(&calls), vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_notification_order_and_duplicate_skip() {
        let service = service();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2, o3) = (Arc::clone(&order), Arc::clone(&order), Arc::clone(&order));
        let _g = service.subscribe_global(move |_, b| {
            if !b.is_empty() {
                lock(&o3).push("global")
            }
        });
        let _l = service.subscribe_latest("A", move |_| lock(&o2).push("latest"));
        let _s = service.subscribe("A", move |_| lock(&o1).push("stream"));
        lock(&order).clear();

        assert!(service.add_data_point(point("A", 5)));
        assert_eq!(*lock(&order), vec!["stream", "latest", "global"]);

        lock(&order).clear();
        assert!(!service.add_data_point(point("A", 5)));
        assert!(lock(&order).is_empty());

        let stats = service.get_stats();
        assert_eq!(stats.data_points_processed, 1);
        assert_eq!(stats.duplicates_skipped, 1);
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.subscriber_counts, SubscriberCounts { stream: 1, latest: 1, global: 1 });
    }

    #[test]
    fn test_latest_subscriber_receives_newest_point() {
        let service = service();
        let seen: Arc<Mutex<Vec<Option<i64>>>> = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = service.subscribe_latest("A", move |p| lock(&s).push(p.map(|p| p.timestamp)));
        service.add_data_point(point("A", 1));
        service.add_data_point(point("A", 2));
        service.clear_line_data("A");
        assert_eq!(*lock(&seen), vec![None, Some(1), Some(2), None]);
    }

    #[test]
    fn test_faulty_subscriber_is_counted_and_isolated() {
        let service = service();
        let _bad = service.subscribe("A", |buffer| {
            if !buffer.is_empty() {
                panic!("consumer bug");
            }
        });
        let good = Arc::new(AtomicU64::new(0));
        let g = Arc::clone(&good);
        let _good = service.subscribe("A", move |_| {
            g.fetch_add(1, Ordering::SeqCst);
        });
        assert!(service.add_data_point(point("A", 1)));
        assert!(service.add_data_point(point("A", 2)));
        assert_eq!(good.load(Ordering::SeqCst), 3);
        assert_eq!(service.get_stats().error_count, 2);
    }

    #[test]
    fn test_frames_flow_from_connection_into_queues() {
        let service = service();
        service.start();
        service.start();
        assert!(service.is_running());

        let connection = service.connection().clone();
        connection.dispatch_frame(&production_frame("L1", 100)).unwrap();
        connection.dispatch_frame(&production_frame("L1", 100)).unwrap();
        connection.dispatch_frame(&production_frame("L2", 200)).unwrap();
        connection
            .dispatch_frame(
                &json!({ "type": "message", "timestamp": "t", "data": { "level": "high", "content": "jam" } })
                    .to_string(),
            )
            .unwrap();
        connection
            .dispatch_frame(&json!({ "type": "system_status", "timestamp": "t", "data": { "status": "ok" } }).to_string())
            .unwrap();

        assert_eq!(service.source_ids(), vec!["L1".to_string(), "L2".to_string()]);
        assert_eq!(service.get_latest_data("L2").map(|p| p.timestamp), Some(200));
        assert_eq!(service.recent_alarms().len(), 1);
        assert_eq!(
            service.latest_system_status().and_then(|s| s.status),
            Some("ok".to_string())
        );
        let stats = service.get_stats();
        assert_eq!(stats.messages_received, 5);
        assert_eq!(stats.duplicates_skipped, 1);
        assert_eq!(stats.alarms_received, 1);

        service.stop();
        assert!(!service.is_running());
        connection.dispatch_frame(&production_frame("L3", 300)).unwrap();
        assert!(service.get_latest_data("L3").is_none());
    }

    #[test]
    fn test_invalid_readings_count_as_errors() {
        let service = service();
        let message = Message {
            topic: TOPIC_PRODUCTION_DATA.to_string(),
            timestamp: "not a time".to_string(),
            payload: Payload::Opaque(json!({ "temp": 1 })),
        };
        service.ingest(&message);

        let no_time = Message {
            topic: TOPIC_PRODUCTION_DATA.to_string(),
            timestamp: "not a time".to_string(),
            payload: Payload::Opaque(json!({ "sourceId": "A" })),
        };
        service.ingest(&no_time);

        let stats = service.get_stats();
        assert_eq!(stats.error_count, 2);
        assert!(stats.queues.is_empty());
    }

    #[test]
    fn test_snapshot_getters_and_clear() {
        let service = service();
        for ts in 1..=5 {
            service.add_data_point(point("A", ts));
        }
        service.add_data_point(point("B", 9));

        assert_eq!(timestamps(&service.get_recent_data("A", 2)), vec![4, 5]);
        assert!(service.get_history_data("missing").is_empty());
        assert_eq!(service.get_all_latest_data().len(), 2);

        let cleared: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&cleared);
        let _sub = service.subscribe("B", move |buffer| lock(&c).push(buffer.len()));
        service.clear_all_data();

        assert_eq!(*lock(&cleared), vec![1, 0]);
        assert!(service.get_all_latest_data().is_empty());
        assert_eq!(service.source_ids().len(), 2);
        assert!(service.add_data_point(point("A", 1)));
    }

    #[test]
    fn test_callback_may_reenter_service() {
        let service = service();
        let reentrant = service.clone();
        let seen = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&seen);
        let _sub = service.subscribe("A", move |buffer| {
            if !buffer.is_empty() {
                s.store(reentrant.get_history_data("A").len() as u64, Ordering::SeqCst);
                reentrant.subscribe_latest("A", |_| {}).detach();
            }
        });
        service.add_data_point(point("A", 1));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(service.get_stats().subscriber_counts.latest, 1);
    }
}
