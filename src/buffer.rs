// Lock-free record queues with explicit overflow policy
//
// Queues sit between every pair of pipeline stages. Each instance names
// its overflow policy at construction: live-display paths run bounded
// with drop-oldest, the recording path runs unbounded because losing a
// record there is a correctness failure, caught only at verification.

use crossbeam::queue::{ArrayQueue, SegQueue};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// What a full queue does with an incoming record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Bounded; pushing onto a full queue evicts the oldest record first.
    /// Best for live display data where only recency matters.
    DropOldest,

    /// Never full. Reserved for data that must not be lost silently.
    Unbounded,
}

/// Metrics for queue monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub total_pushed: u64,
    pub total_popped: u64,
    pub total_dropped: u64,
    pub current_len: usize,
    pub peak_len: usize,
    /// `None` for unbounded queues
    pub capacity: Option<usize>,
}

enum Slots {
    Bounded(ArrayQueue<String>),
    Unbounded(SegQueue<String>),
}

/// FIFO queue of records between two pipeline stages
///
/// Built on crossbeam's lock-free queues so producers never contend with
/// the draining consumer.
pub struct RecordQueue {
    slots: Slots,
    policy: OverflowPolicy,

    // Atomic counters for lock-free metrics
    total_pushed: AtomicU64,
    total_popped: AtomicU64,
    total_dropped: AtomicU64,
    peak_len: AtomicUsize,
}

impl RecordQueue {
    /// Create a queue with the given policy. `capacity` bounds a
    /// `DropOldest` queue (minimum one slot) and is ignored for
    /// `Unbounded`.
    pub fn new(policy: OverflowPolicy, capacity: usize) -> Self {
        let slots = match policy {
            OverflowPolicy::DropOldest => Slots::Bounded(ArrayQueue::new(capacity.max(1))),
            OverflowPolicy::Unbounded => Slots::Unbounded(SegQueue::new()),
        };

        Self {
            slots,
            policy,
            total_pushed: AtomicU64::new(0),
            total_popped: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            peak_len: AtomicUsize::new(0),
        }
    }

    /// Push a record. Never fails; under `DropOldest` a full queue evicts
    /// its oldest record first and the drop is counted.
    pub fn push(&self, record: String) {
        match &self.slots {
            Slots::Bounded(queue) => {
                if queue.is_full() && queue.pop().is_some() {
                    let dropped = self.total_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    log::debug!(
                        "record queue full (capacity {}), oldest dropped ({} total)",
                        queue.capacity(),
                        dropped
                    );
                }
                queue.push(record).ok();
            }
            Slots::Unbounded(queue) => queue.push(record),
        }

        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        self.peak_len.fetch_max(self.len(), Ordering::Relaxed);
    }

    /// Pop the oldest record
    pub fn pop(&self) -> Option<String> {
        let record = match &self.slots {
            Slots::Bounded(queue) => queue.pop(),
            Slots::Unbounded(queue) => queue.pop(),
        };

        if record.is_some() {
            self.total_popped.fetch_add(1, Ordering::Relaxed);
        }
        record
    }

    /// Drain everything currently queued, oldest to newest
    pub fn drain_all(&self) -> Vec<String> {
        let mut records = Vec::with_capacity(self.len());
        while let Some(record) = self.pop() {
            records.push(record);
        }
        records
    }

    pub fn len(&self) -> usize {
        match &self.slots {
            Slots::Bounded(queue) => queue.len(),
            Slots::Unbounded(queue) => queue.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// `None` for unbounded queues
    pub fn capacity(&self) -> Option<usize> {
        match &self.slots {
            Slots::Bounded(queue) => Some(queue.capacity()),
            Slots::Unbounded(_) => None,
        }
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_popped: self.total_popped.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            current_len: self.len(),
            peak_len: self.peak_len.load(Ordering::Relaxed),
            capacity: self.capacity(),
        }
    }

    /// Discard all queued records
    pub fn clear(&self) {
        while self.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_fifo() {
        let queue = RecordQueue::new(OverflowPolicy::DropOldest, 10);

        queue.push("1,2".to_string());
        queue.push("3,4".to_string());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop().as_deref(), Some("1,2"));
        assert_eq!(queue.pop().as_deref(), Some("3,4"));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_drop_oldest() {
        let queue = RecordQueue::new(OverflowPolicy::DropOldest, 3);

        // Fill queue
        queue.push("1".to_string());
        queue.push("2".to_string());
        queue.push("3".to_string());
        assert_eq!(queue.len(), 3);

        // Push one more - should drop the oldest ("1")
        queue.push("4".to_string());
        assert_eq!(queue.len(), 3);

        let records = queue.drain_all();
        assert_eq!(records, vec!["2", "3", "4"]);
        assert_eq!(queue.metrics().total_dropped, 1);
    }

    #[test]
    fn test_unbounded_never_drops() {
        let queue = RecordQueue::new(OverflowPolicy::Unbounded, 0);

        for i in 0..10_000 {
            queue.push(i.to_string());
        }

        let metrics = queue.metrics();
        assert_eq!(metrics.total_pushed, 10_000);
        assert_eq!(metrics.total_dropped, 0);
        assert_eq!(metrics.capacity, None);

        let records = queue.drain_all();
        assert_eq!(records.len(), 10_000);
        assert_eq!(records[0], "0");
        assert_eq!(records[9_999], "9999");
    }

    #[test]
    fn test_metrics() {
        let queue = RecordQueue::new(OverflowPolicy::DropOldest, 5);

        queue.push("a".to_string());
        queue.push("b".to_string());

        let metrics = queue.metrics();
        assert_eq!(metrics.total_pushed, 2);
        assert_eq!(metrics.current_len, 2);
        assert_eq!(metrics.peak_len, 2);
        assert_eq!(metrics.capacity, Some(5));

        queue.pop();
        let metrics = queue.metrics();
        assert_eq!(metrics.total_popped, 1);
        assert_eq!(metrics.current_len, 1);
    }

    #[test]
    fn test_clear() {
        let queue = RecordQueue::new(OverflowPolicy::DropOldest, 4);
        queue.push("x".to_string());
        queue.push("y".to_string());

        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.drain_all().is_empty());
    }
}
