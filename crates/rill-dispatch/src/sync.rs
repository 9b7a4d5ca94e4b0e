//! Inline dispatcher: tasks run on the caller's thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::metrics::{DispatchMetrics, MetricsSnapshot};
use crate::task::{run_guarded, DispatchError, Dispatcher, Task};

/// Runs every task synchronously in `dispatch` itself.
///
/// Ordering is trivially the caller's order. The caller is always "in
/// context". Useful as the default boundary-free execution context and
/// in tests.
pub struct SyncDispatcher {
    name: String,
    shut_down: AtomicBool,
    metrics: DispatchMetrics,
}

impl SyncDispatcher {
    /// Create an inline dispatcher.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shut_down: AtomicBool::new(false),
            metrics: DispatchMetrics::new(),
        }
    }
}

impl Dispatcher for SyncDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, task: Task) -> Result<(), DispatchError> {
        if self.shut_down.load(Ordering::Acquire) {
            self.metrics.record_rejected();
            return Err(DispatchError::Shutdown {
                name: self.name.clone(),
            });
        }
        self.metrics.record_submitted();
        run_guarded(&self.name, task, &self.metrics);
        Ok(())
    }

    fn in_context(&self) -> bool {
        true
    }

    fn ordered(&self) -> bool {
        true
    }

    fn shutdown(&self, _timeout: Duration) -> bool {
        self.shut_down.store(true, Ordering::Release);
        true
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn tasks_run_inline_in_order() {
        let d = SyncDispatcher::new("sync");
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            d.dispatch(Box::new(move || order.lock().unwrap().push(i)))
                .unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn shutdown_rejects_new_tasks() {
        let d = SyncDispatcher::new("sync");
        assert!(d.shutdown(Duration::from_millis(1)));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in = Arc::clone(&ran);
        let result = d.dispatch(Box::new(move || {
            ran_in.fetch_add(1, Ordering::Relaxed);
        }));
        assert!(matches!(result, Err(DispatchError::Shutdown { .. })));
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }
}
