//! # Per-source Data Queue
//!
//! A bounded FIFO of [`DataPoint`]s for one source with O(1) deduplication on
//! the point timestamp.
//!
//! Invariants:
//! - `len() <= capacity()`
//! - no two held points share a timestamp
//! - points are held in arrival order, oldest first

use std::collections::{HashSet, VecDeque};

use crate::models::{DataPoint, QueueStats};

/// Rolling window length used when none is configured.
pub const DEFAULT_CAPACITY: usize = 60;

#[derive(Debug, Clone)]
pub struct DataQueue {
    source_id: String,
    capacity: usize,
    points: VecDeque<DataPoint>,
    seen: HashSet<i64>,
}

impl DataQueue {
    /// Creates an empty queue. A zero capacity is raised to 1.
    pub fn new(source_id: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            source_id: source_id.into(),
            capacity,
            points: VecDeque::with_capacity(capacity + 1),
            seen: HashSet::with_capacity(capacity + 1),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Appends a point, evicting the oldest one when full.
    ///
    /// Returns `false` without touching the queue if a point with the same
    /// timestamp is already held.
    pub fn add_data_point(&mut self, point: DataPoint) -> bool {
        if !self.seen.insert(point.timestamp) {
            log::debug!(
                "Duplicate data point for '{}' at {} ignored",
                self.source_id,
                point.timestamp
            );
            return false;
        }

        self.points.push_back(point);
        if self.points.len() > self.capacity {
            if let Some(evicted) = self.points.pop_front() {
                self.seen.remove(&evicted.timestamp);
            }
        }
        true
    }

    /// An owned copy of every held point, oldest first.
    pub fn get_all_data(&self) -> Vec<DataPoint> {
        self.points.iter().cloned().collect()
    }

    pub fn get_latest_data(&self) -> Option<DataPoint> {
        self.points.back().cloned()
    }

    /// The last `min(count, len)` points, oldest first.
    pub fn get_recent_data(&self, count: usize) -> Vec<DataPoint> {
        let skip = self.points.len().saturating_sub(count);
        self.points.iter().skip(skip).cloned().collect()
    }

    pub fn get_stats(&self) -> QueueStats {
        let time_span = match (self.points.front(), self.points.back()) {
            // Producer timestamps are arbitrary i64 values and may arrive out of order.
            (Some(oldest), Some(latest)) if self.points.len() >= 2 => {
                latest.timestamp.saturating_sub(oldest.timestamp)
            }
            _ => 0,
        };
        QueueStats {
            size: self.points.len(),
            max_size: self.capacity,
            utilization_rate: self.points.len() as f64 / self.capacity as f64 * 100.0,
            time_span,
        }
    }

    /// Empties the buffer and forgets every seen timestamp.
    pub fn clear(&mut self) {
        self.points.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(ts: i64) -> DataPoint {
        DataPoint::new("A", ts, json!({ "v": ts }))
    }

    fn timestamps(points: &[DataPoint]) -> Vec<i64> {
        points.iter().map(|p| p.timestamp).collect()
    }

    #[test]
    fn test_bounded_eviction_and_dedup() {
        let mut queue = DataQueue::new("A", 3);
        for ts in 1..=4 {
            assert!(queue.add_data_point(point(ts)));
        }
        assert_eq!(timestamps(&queue.get_all_data()), vec![2, 3, 4]);

        assert!(!queue.add_data_point(point(4)));
        assert_eq!(queue.len(), 3);
        assert_eq!(timestamps(&queue.get_all_data()), vec![2, 3, 4]);
    }

    #[test]
    fn test_evicted_timestamp_can_be_re_added() {
        let mut queue = DataQueue::new("A", 2);
        queue.add_data_point(point(1));
        queue.add_data_point(point(2));
        queue.add_data_point(point(3));
        assert!(queue.add_data_point(point(1)));
        assert_eq!(timestamps(&queue.get_all_data()), vec![3, 1]);
    }

    #[test]
    fn test_get_all_data_is_independent_copy() {
        let mut queue = DataQueue::new("A", 3);
        queue.add_data_point(point(1));
        let mut copy = queue.get_all_data();
        copy[0].payload = json!("mutated");
        copy.clear();
        assert_eq!(queue.get_all_data()[0].payload, json!({ "v": 1 }));
    }

    #[test]
    fn test_latest_and_recent() {
        let mut queue = DataQueue::new("A", 5);
        assert!(queue.get_latest_data().is_none());
        assert!(queue.get_recent_data(3).is_empty());
        for ts in [10, 20, 30, 40] {
            queue.add_data_point(point(ts));
        }
        assert_eq!(queue.get_latest_data().map(|p| p.timestamp), Some(40));
        assert_eq!(timestamps(&queue.get_recent_data(2)), vec![30, 40]);
        assert_eq!(timestamps(&queue.get_recent_data(10)), vec![10, 20, 30, 40]);
        assert!(queue.get_recent_data(0).is_empty());
    }

    #[test]
    fn test_stats() {
        let mut queue = DataQueue::new("A", 4);
        assert_eq!(queue.get_stats().time_span, 0);
        queue.add_data_point(point(1_000));
        assert_eq!(queue.get_stats().time_span, 0);
        queue.add_data_point(point(4_000));
        let stats = queue.get_stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.max_size, 4);
        assert_eq!(stats.utilization_rate, 50.0);
        assert_eq!(stats.time_span, 3_000);
    }

    #[test]
    fn test_time_span_saturates_on_extreme_timestamps() {
        let mut queue = DataQueue::new("A", 4);
        queue.add_data_point(point(i64::MIN));
        queue.add_data_point(point(i64::MAX));
        assert_eq!(queue.get_stats().time_span, i64::MAX);

        let mut queue = DataQueue::new("A", 4);
        queue.add_data_point(point(i64::MAX));
        queue.add_data_point(point(i64::MAX - 5));
        assert_eq!(queue.get_stats().time_span, -5);

        let mut queue = DataQueue::new("A", 4);
        queue.add_data_point(point(i64::MAX));
        queue.add_data_point(point(i64::MIN));
        assert_eq!(queue.get_stats().time_span, i64::MIN);
    }

    #[test]
    fn test_clear_resets_dedup_set() {
        let mut queue = DataQueue::new("A", 3);
        queue.add_data_point(point(1));
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.add_data_point(point(1)));
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let mut queue = DataQueue::new("A", 0);
        assert_eq!(queue.capacity(), 1);
        queue.add_data_point(point(1));
        queue.add_data_point(point(2));
        assert_eq!(timestamps(&queue.get_all_data()), vec![2]);
    }
}
