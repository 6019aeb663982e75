//! Per-thread lock-free event rings
//!
//! Decouples the hot path (host threads recording events) from the cold path
//! (the worker writing frames to the sink).
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ HOST THREAD n (Hot Path)                                         │
//! │   begin_zone() → encode() → ThreadQueue::push()                  │
//! │   bounded ring owned by this thread, never blocks                │
//! └──────────────────────────────────────────────────────────────────┘
//!                          │  one ring per producer thread
//!                          ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ WORKER THREAD (Cold Path)                                        │
//! │   for ring in registry (round-robin):                            │
//! │     ring.drain_into(batch, batch_size) → frame → sink            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each ring has exactly one producer (its thread) and one consumer (the
//! worker), so records from one thread come out in the order they went in.
//! No ordering holds across rings beyond the timestamps inside records.
//!
//! # Backpressure
//!
//! A full ring drops the *newest* record and bumps the ring's `dropped`
//! counter. Already-queued records are never displaced, so per-thread order
//! is never corrupted. The worker turns the counter into a periodic counter
//! event so loss shows up in the stream.

use crate::event::EventRecord;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Bounded single-producer ring for one thread
#[derive(Debug)]
pub struct ThreadQueue {
    thread_id: u32,
    ring: ArrayQueue<EventRecord>,
    pushed: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl ThreadQueue {
    /// # Panics
    ///
    /// Panics if capacity is 0. Callers validate capacity through `BridgeConfig`.
    pub fn new(thread_id: u32, capacity: usize) -> Self {
        assert!(capacity > 0, "Thread queue capacity must be > 0");
        ThreadQueue {
            thread_id,
            ring: ArrayQueue::new(capacity),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Enqueue a record (hot path)
    ///
    /// Returns `false` if the ring was full and the record was dropped.
    #[inline]
    pub fn push(&self, record: EventRecord) -> bool {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        match self.ring.push(record) {
            Ok(()) => true,
            Err(_newest) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<EventRecord> {
        self.ring.pop()
    }

    /// Move up to `max` records into `out`, oldest first
    pub fn drain_into(&self, out: &mut Vec<EventRecord>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.ring.pop() {
                Some(record) => {
                    out.push(record);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Mark the producer thread as gone; the worker prunes the ring once drained
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            total_pushed: self.pushed.load(Ordering::Relaxed),
            total_dropped: self.dropped.load(Ordering::Relaxed),
            current_size: self.ring.len(),
            capacity: self.ring.capacity(),
        }
    }
}

/// Ring statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueStats {
    pub total_pushed: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl QueueStats {
    /// Calculate drop rate (0.0 to 1.0)
    pub fn drop_rate(&self) -> f64 {
        if self.total_pushed == 0 {
            0.0
        } else {
            self.total_dropped as f64 / self.total_pushed as f64
        }
    }

    /// Calculate ring utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.current_size as f64 / self.capacity as f64
        }
    }

    fn accumulate(&mut self, other: &QueueStats) {
        self.total_pushed += other.total_pushed;
        self.total_dropped += other.total_dropped;
        self.current_size += other.current_size;
        self.capacity += other.capacity;
    }
}

/// Every ring of a session
///
/// Registration happens once per thread per session, so a mutex is fine here;
/// the worker only re-reads the list when `version` moved.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: Mutex<Vec<Arc<ThreadQueue>>>,
    version: AtomicU64,
    /// Totals of rings already pruned
    retired: Mutex<QueueStats>,
    /// Set once the session is over; no ring is kept after that
    released: AtomicBool,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the ring of `thread_id`
    ///
    /// After [`Self::release`] the ring is returned closed and is not kept, so
    /// it lives only as long as the caller holds it.
    pub fn register(&self, thread_id: u32, capacity: usize) -> Arc<ThreadQueue> {
        let queue = Arc::new(ThreadQueue::new(thread_id, capacity));
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        if self.released.load(Ordering::Acquire) {
            queue.close();
            return queue;
        }
        queues.push(queue.clone());
        self.version.fetch_add(1, Ordering::Release);
        queue
    }

    /// Refresh `out` if the registry changed since `seen_version`
    pub fn snapshot_if_changed(&self, seen_version: &mut u64, out: &mut Vec<Arc<ThreadQueue>>) -> bool {
        let version = self.version.load(Ordering::Acquire);
        if version == *seen_version {
            return false;
        }
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        out.clear();
        out.extend(queues.iter().cloned());
        *seen_version = version;
        true
    }

    /// Remove rings whose thread is gone and that hold no records
    ///
    /// Returns the rings removed.
    pub fn prune_closed(&self) -> Vec<Arc<ThreadQueue>> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = Vec::new();
        queues.retain(|q| {
            let dead = q.is_closed() && q.is_empty();
            if dead {
                retired.accumulate(&retired_stats(q));
                removed.push(Arc::clone(q));
            }
            !dead
        });
        if !removed.is_empty() {
            self.version.fetch_add(1, Ordering::Release);
        }
        removed
    }

    /// Close and remove every ring, and keep no new ones
    ///
    /// Totals stay available through [`Self::stats`]. Returns the rings removed.
    pub fn release(&self) -> Vec<Arc<ThreadQueue>> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let mut retired = self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        self.released.store(true, Ordering::Release);
        for q in queues.iter() {
            q.close();
            retired.accumulate(&retired_stats(q));
        }
        self.version.fetch_add(1, Ordering::Release);
        std::mem::take(&mut *queues)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records currently waiting across every ring
    pub fn pending(&self) -> usize {
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues.iter().map(|q| q.len()).sum()
    }

    /// Totals across live and pruned rings
    pub fn stats(&self) -> QueueStats {
        // Lock order: queues, then retired (same as prune_closed)
        let queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let mut total = *self.retired.lock().unwrap_or_else(PoisonError::into_inner);
        for q in queues.iter() {
            total.accumulate(&q.stats());
        }
        total
    }
}

/// What a ring leaves behind in the registry totals
fn retired_stats(queue: &ThreadQueue) -> QueueStats {
    QueueStats {
        current_size: 0,
        capacity: 0,
        ..queue.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{decode_record, encode};
    use crate::event::Event;

    fn record(depth: u32) -> EventRecord {
        encode(&Event::ZoneEnd {
            timestamp_ns: depth as u64,
            depth,
        })
    }

    #[test]
    fn test_queue_creation() {
        let queue = ThreadQueue::new(1, 1024);
        let stats = queue.stats();
        assert_eq!(stats.capacity, 1024);
        assert_eq!(stats.current_size, 0);
        assert_eq!(stats.total_pushed, 0);
        assert_eq!(stats.total_dropped, 0);
    }

    #[test]
    #[should_panic(expected = "Thread queue capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _ = ThreadQueue::new(1, 0);
    }

    #[test]
    fn test_fifo_order() {
        let queue = ThreadQueue::new(1, 16);
        for i in 1..=10 {
            assert!(queue.push(record(i)));
        }
        let mut out = Vec::new();
        assert_eq!(queue.drain_into(&mut out, 100), 10);
        let depths: Vec<u32> = out
            .iter()
            .map(|r| match decode_record(r).unwrap() {
                Event::ZoneEnd { depth, .. } => depth,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(depths, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_backpressure_drops_newest() {
        let queue = ThreadQueue::new(1, 2);
        assert!(queue.push(record(1)));
        assert!(queue.push(record(2)));
        assert!(!queue.push(record(3)));
        assert!(!queue.push(record(4)));

        let stats = queue.stats();
        assert_eq!(stats.total_pushed, 4);
        assert_eq!(stats.total_dropped, 2);
        assert_eq!(queue.pop(), Some(record(1)));
        assert_eq!(queue.pop(), Some(record(2)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_drain_respects_max() {
        let queue = ThreadQueue::new(1, 16);
        for i in 1..=5 {
            queue.push(record(i));
        }
        let mut out = Vec::new();
        assert_eq!(queue.drain_into(&mut out, 3), 3);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drop_rate_calculation() {
        let stats = QueueStats {
            total_pushed: 100,
            total_dropped: 5,
            current_size: 50,
            capacity: 1024,
        };

        assert_eq!(stats.drop_rate(), 0.05);
        assert_eq!(stats.utilization(), 50.0 / 1024.0);
    }

    #[test]
    fn test_registry_snapshot_and_prune() {
        let registry = QueueRegistry::new();
        let mut seen = 0;
        let mut snapshot = Vec::new();
        assert!(!registry.snapshot_if_changed(&mut seen, &mut snapshot));

        let a = registry.register(1, 4);
        let b = registry.register(2, 4);
        assert!(registry.snapshot_if_changed(&mut seen, &mut snapshot));
        assert_eq!(snapshot.len(), 2);
        assert!(!registry.snapshot_if_changed(&mut seen, &mut snapshot));

        a.push(record(1));
        a.close();
        // Closed but not empty: kept
        assert!(registry.prune_closed().is_empty());
        a.pop();
        let pruned = registry.prune_closed();
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].thread_id(), a.thread_id());
        assert!(registry.snapshot_if_changed(&mut seen, &mut snapshot));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].thread_id(), b.thread_id());

        // Pruned rings still count in totals
        assert_eq!(registry.stats().total_pushed, 1);
    }

    #[test]
    fn test_release_frees_rings_and_keeps_totals() {
        let registry = QueueRegistry::new();
        let a = registry.register(1, 4);
        a.push(record(1));
        let weak = Arc::downgrade(&a);
        drop(a);

        let released = registry.release();
        assert_eq!(released.len(), 1);
        assert!(released[0].is_closed());
        drop(released);
        assert!(weak.upgrade().is_none());
        assert!(registry.is_empty());

        let stats = registry.stats();
        assert_eq!(stats.total_pushed, 1);
        assert_eq!(stats.capacity, 0);

        // Late registrations are not kept
        let late = registry.register(2, 4);
        assert!(late.is_closed());
        assert!(registry.is_empty());
    }
}
