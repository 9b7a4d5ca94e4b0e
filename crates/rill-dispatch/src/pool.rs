//! Multi-worker dispatcher with a shared injector queue.
//!
//! N workers compete for tasks on one channel. Throughput scales with
//! workers; there is no ordering across submissions and tasks may run
//! in parallel, so only operators that tolerate reordering bind here.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::config::OverflowPolicy;
use crate::metrics::{DispatchMetrics, MetricsSnapshot};
use crate::task::{run_guarded, DispatchError, Dispatcher, Task};
use crate::thread::submit_with_policy;

/// Work-pool dispatcher: N workers, one shared FIFO injector, no
/// cross-submission ordering guarantee.
pub struct PoolDispatcher {
    name: String,
    tx: Mutex<Option<Sender<Task>>>,
    drain_rx: Receiver<Task>,
    worker_ids: Arc<Mutex<HashSet<ThreadId>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    done_rx: Receiver<()>,
    worker_count: usize,
    shut_down: AtomicBool,
    overflow: OverflowPolicy,
    metrics: Arc<DispatchMetrics>,
}

// Compile-time assertion: PoolDispatcher must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<PoolDispatcher>();
};

impl PoolDispatcher {
    /// Spawn `worker_count` workers sharing one queue.
    ///
    /// # Panics
    ///
    /// Panics if `worker_count` is zero.
    pub fn new(
        name: impl Into<String>,
        worker_count: usize,
        queue_size: Option<usize>,
        overflow: OverflowPolicy,
    ) -> Self {
        assert!(worker_count > 0, "pool needs at least one worker");
        let name = name.into();
        let (tx, rx) = match queue_size {
            Some(cap) => crossbeam_channel::bounded::<Task>(cap),
            None => crossbeam_channel::unbounded::<Task>(),
        };
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(worker_count);
        let metrics = Arc::new(DispatchMetrics::new());
        let worker_ids = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_rx = rx.clone();
            let worker_metrics = Arc::clone(&metrics);
            let worker_ids = Arc::clone(&worker_ids);
            let worker_done = done_tx.clone();
            let worker_name = name.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rill-pool-{name}-{index}"))
                .spawn(move || {
                    worker_ids.lock().unwrap().insert(std::thread::current().id());
                    while let Ok(task) = worker_rx.recv() {
                        run_guarded(&worker_name, task, &worker_metrics);
                    }
                    let _ = worker_done.send(());
                })
                .expect("failed to spawn pool worker");
            handles.push(handle);
        }

        Self {
            name,
            tx: Mutex::new(Some(tx)),
            drain_rx: rx,
            worker_ids,
            handles: Mutex::new(handles),
            done_rx,
            worker_count,
            shut_down: AtomicBool::new(false),
            overflow,
            metrics,
        }
    }
}

impl Dispatcher for PoolDispatcher {
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
        let tx = self.tx.lock().unwrap().clone();
        let Some(tx) = tx else {
            self.metrics.record_rejected();
            return Err(DispatchError::Shutdown {
                name: self.name.clone(),
            });
        };
        submit_with_policy(
            &self.name,
            &tx,
            &self.drain_rx,
            self.overflow,
            &self.metrics,
            task,
        )
    }

    fn in_context(&self) -> bool {
        self.worker_ids
            .lock()
            .unwrap()
            .contains(&std::thread::current().id())
    }

    fn ordered(&self) -> bool {
        false
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return self.handles.lock().unwrap().is_empty();
        }
        self.tx.lock().unwrap().take();
        let deadline = std::time::Instant::now() + timeout;
        let mut finished = 0;
        while finished < self.worker_count {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() || self.done_rx.recv_timeout(remaining).is_err() {
                log::warn!(
                    "dispatcher '{}': {} of {} workers still draining after {timeout:?}",
                    self.name,
                    self.worker_count - finished,
                    self.worker_count
                );
                return false;
            }
            finished += 1;
        }
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        true
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for PoolDispatcher {
    fn drop(&mut self) {
        self.shutdown(Duration::from_millis(100));
    }
}
