//! The unit-of-work contract shared by all dispatcher variants.

use std::error::Error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use crate::metrics::{DispatchMetrics, MetricsSnapshot};

/// A unit of work submitted to a dispatcher.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Why a submission was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// The dispatcher has been shut down and accepts no new work.
    Shutdown {
        /// Dispatcher name.
        name: String,
    },
    /// The dispatcher's bounded queue is full and its overflow policy
    /// rejects rather than blocks or drops.
    Full {
        /// Dispatcher name.
        name: String,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown { name } => write!(f, "dispatcher '{name}' is shut down"),
            Self::Full { name } => write!(f, "dispatcher '{name}' queue is full"),
        }
    }
}

impl Error for DispatchError {}

/// An executor abstraction accepting unit-of-work submissions.
///
/// # Contract
///
/// - `dispatch` returns immediately; the task runs on a dispatcher
///   thread (or inline for the synchronous variant).
/// - After `shutdown` returns, no queued task is still running and no
///   new submission is accepted.
/// - A panicking task never kills a worker: panics are caught at the
///   worker's barrier, counted, and reported to the error sink.
pub trait Dispatcher: Send + Sync {
    /// Dispatcher name (unique within an environment).
    fn name(&self) -> &str;

    /// Enqueue `task` for execution.
    fn dispatch(&self, task: Task) -> Result<(), DispatchError>;

    /// Whether the calling thread is a worker of this dispatcher. Used
    /// by boundary operators to avoid redundant re-submission.
    fn in_context(&self) -> bool;

    /// Whether tasks run in submission order with no overlap. Operators
    /// only rely on signal ordering across a boundary when this holds.
    fn ordered(&self) -> bool;

    /// Stop accepting submissions, drain queued tasks up to `timeout`,
    /// then give up on the stragglers. Returns whether the queue
    /// drained cleanly. Idempotent.
    fn shutdown(&self, timeout: Duration) -> bool;

    /// Cumulative counters for this dispatcher.
    fn metrics(&self) -> MetricsSnapshot;
}

/// Convenience submissions that don't fit in the object-safe trait.
pub trait DispatcherExt {
    /// Submit `move || consumer(data)`.
    fn dispatch_with<T, F>(&self, data: T, consumer: F) -> Result<(), DispatchError>
    where
        T: Send + 'static,
        F: FnOnce(T) + Send + 'static;
}

impl<D: Dispatcher + ?Sized> DispatcherExt for D {
    fn dispatch_with<T, F>(&self, data: T, consumer: F) -> Result<(), DispatchError>
    where
        T: Send + 'static,
        F: FnOnce(T) + Send + 'static,
    {
        self.dispatch(Box::new(move || consumer(data)))
    }
}

/// Run one task behind the panic barrier. The worker thread survives
/// user-code panics; the failure is counted and logged.
pub(crate) fn run_guarded(name: &str, task: Task, metrics: &DispatchMetrics) {
    let outcome = catch_unwind(AssertUnwindSafe(task));
    match outcome {
        Ok(()) => metrics.record_completed(),
        Err(_) => {
            metrics.record_panic();
            log::error!("dispatcher '{name}': task panicked; worker continues");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncDispatcher;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[test]
    fn panic_barrier_counts_and_survives() {
        let metrics = DispatchMetrics::new();
        run_guarded("t", Box::new(|| panic!("boom")), &metrics);
        run_guarded("t", Box::new(|| {}), &metrics);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.panics, 1);
        assert_eq!(snapshot.completed, 1);
    }

    #[test]
    fn dispatch_with_carries_the_data() {
        let dispatcher = SyncDispatcher::new("sync");
        let seen = Arc::new(AtomicI64::new(0));
        let seen_in = Arc::clone(&seen);
        dispatcher
            .dispatch_with(41, move |v| {
                seen_in.store(v + 1, Ordering::Relaxed);
            })
            .unwrap();
        assert_eq!(seen.load(Ordering::Relaxed), 42);
    }
}
