//! Non-fatal diagnostic channel
//!
//! Usage errors (mismatched zone ends, double init, unmatched frees, ...) are
//! never returned to the host call site as failures. They land here instead:
//! counted per kind, logged, and kept in a bounded ring of recent entries the
//! host (or a test) can drain.
//!
//! The first occurrence of each kind is logged at `warn`; repeats go to
//! `debug` so a per-frame bug cannot flood the host log.

use crate::error::UsageError;
use crossbeam::queue::ArrayQueue;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// One reported usage error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub error: UsageError,
    /// Bridge thread id of the reporting thread (0 = worker)
    pub thread_id: u32,
    pub timestamp_ns: u64,
}

#[derive(Debug)]
pub struct Diagnostics {
    recent: ArrayQueue<Diagnostic>,
    counts: [AtomicU64; UsageError::KIND_COUNT],
    overwritten: AtomicU64,
}

impl Diagnostics {
    pub fn new(capacity: usize) -> Self {
        Diagnostics {
            recent: ArrayQueue::new(capacity.max(1)),
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
            overwritten: AtomicU64::new(0),
        }
    }

    pub fn report(&self, error: UsageError, thread_id: u32, timestamp_ns: u64) {
        let previous = self.counts[error.kind_index()].fetch_add(1, Ordering::Relaxed);
        if previous == 0 {
            tracing::warn!(
                kind = error.kind_name(),
                thread = thread_id,
                "tracing usage error: {}",
                error
            );
        } else {
            tracing::debug!(
                kind = error.kind_name(),
                thread = thread_id,
                occurrences = previous + 1,
                "tracing usage error: {}",
                error
            );
        }

        // Keep the newest entries
        let entry = Diagnostic {
            error,
            thread_id,
            timestamp_ns,
        };
        if self.recent.force_push(entry).is_some() {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Occurrences of the kind of `error`
    pub fn count_of(&self, error: &UsageError) -> u64 {
        self.counts[error.kind_index()].load(Ordering::Relaxed)
    }

    /// Occurrences across every kind
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Entries that fell out of the recent ring
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    /// Take the recent entries, oldest first
    pub fn drain(&self) -> Vec<Diagnostic> {
        let mut out = Vec::with_capacity(self.recent.len());
        while let Some(d) = self.recent.pop() {
            out.push(d);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts_per_kind() {
        let diag = Diagnostics::new(8);
        diag.report(UsageError::ZoneEndWithoutBegin { depth: 1 }, 1, 10);
        diag.report(UsageError::ZoneEndWithoutBegin { depth: 2 }, 1, 20);
        diag.report(UsageError::InvalidUtf8, 2, 30);

        assert_eq!(diag.count_of(&UsageError::ZoneEndWithoutBegin { depth: 0 }), 2);
        assert_eq!(diag.count_of(&UsageError::InvalidUtf8), 1);
        assert_eq!(diag.total(), 3);

        let drained = diag.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].timestamp_ns, 10);
        assert!(diag.drain().is_empty());
        // Counts survive draining
        assert_eq!(diag.total(), 3);
    }

    #[test]
    fn test_recent_ring_keeps_newest() {
        let diag = Diagnostics::new(2);
        for depth in 1..=5 {
            diag.report(UsageError::ZoneEndWithoutBegin { depth }, 1, depth as u64);
        }
        assert_eq!(diag.overwritten(), 3);
        let drained = diag.drain();
        assert_eq!(
            drained.iter().map(|d| d.timestamp_ns).collect::<Vec<_>>(),
            vec![4, 5]
        );
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let diag = Diagnostics::new(0);
        diag.report(UsageError::InvalidUtf8, 0, 0);
        assert_eq!(diag.drain().len(), 1);
    }
}
