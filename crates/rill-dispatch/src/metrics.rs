//! Cumulative per-dispatcher counters.
//!
//! Counters are monotonic and updated with relaxed atomics; readers
//! take a [`MetricsSnapshot`] and never observe torn values per field.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by a dispatcher.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    dropped_oldest: AtomicU64,
    dropped_newest: AtomicU64,
    panics: AtomicU64,
}

impl DispatchMetrics {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_oldest(&self) {
        self.dropped_oldest.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped_newest(&self) {
        self.dropped_newest.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_panic(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped_oldest: self.dropped_oldest.load(Ordering::Relaxed),
            dropped_newest: self.dropped_newest.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a dispatcher's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Tasks accepted for execution.
    pub submitted: u64,
    /// Tasks that ran to completion.
    pub completed: u64,
    /// Submissions refused (queue full with a rejecting policy, or
    /// dispatcher shut down).
    pub rejected: u64,
    /// Queued tasks discarded to make room for newer ones.
    pub dropped_oldest: u64,
    /// Incoming tasks discarded because the queue was full.
    pub dropped_newest: u64,
    /// Tasks that panicked at the worker barrier.
    pub panics: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_events() {
        let metrics = DispatchMetrics::new();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_completed();
        metrics.record_dropped_newest();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.submitted, 2);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.dropped_newest, 1);
        assert_eq!(snapshot.panics, 0);
    }
}
