//! Single-worker FIFO dispatcher.
//!
//! One dedicated thread drains a crossbeam channel in submission
//! order. This is the ordered boundary of choice for operators that
//! need signals serialized across threads without pinning a core.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::config::OverflowPolicy;
use crate::metrics::{DispatchMetrics, MetricsSnapshot};
use crate::task::{run_guarded, DispatchError, Dispatcher, Task};

/// Submit one task into a possibly-bounded channel, applying the
/// overflow policy. Shared by the single-thread and pool dispatchers.
pub(crate) fn submit_with_policy(
    name: &str,
    tx: &Sender<Task>,
    drain_rx: &Receiver<Task>,
    policy: OverflowPolicy,
    metrics: &DispatchMetrics,
    task: Task,
) -> Result<(), DispatchError> {
    match policy {
        OverflowPolicy::Block => {
            // send only errors when the worker side is gone.
            if tx.send(task).is_err() {
                metrics.record_rejected();
                return Err(DispatchError::Shutdown {
                    name: name.to_string(),
                });
            }
            metrics.record_submitted();
            Ok(())
        }
        OverflowPolicy::Error => match tx.try_send(task) {
            Ok(()) => {
                metrics.record_submitted();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                metrics.record_rejected();
                Err(DispatchError::Full {
                    name: name.to_string(),
                })
            }
            Err(TrySendError::Disconnected(_)) => {
                metrics.record_rejected();
                Err(DispatchError::Shutdown {
                    name: name.to_string(),
                })
            }
        },
        OverflowPolicy::DropNewest => match tx.try_send(task) {
            Ok(()) => {
                metrics.record_submitted();
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                metrics.record_dropped_newest();
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                metrics.record_rejected();
                Err(DispatchError::Shutdown {
                    name: name.to_string(),
                })
            }
        },
        OverflowPolicy::DropOldest => {
            let mut task = task;
            loop {
                match tx.try_send(task) {
                    Ok(()) => {
                        metrics.record_submitted();
                        return Ok(());
                    }
                    Err(TrySendError::Full(back)) => {
                        // Steal the oldest queued task to make room.
                        if drain_rx.try_recv().is_ok() {
                            metrics.record_dropped_oldest();
                        }
                        task = back;
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        metrics.record_rejected();
                        return Err(DispatchError::Shutdown {
                            name: name.to_string(),
                        });
                    }
                }
            }
        }
    }
}

/// FIFO dispatcher with a single worker thread.
pub struct ThreadDispatcher {
    name: String,
    tx: Mutex<Option<Sender<Task>>>,
    drain_rx: Receiver<Task>,
    worker_id: Arc<Mutex<Option<ThreadId>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    done_rx: Receiver<()>,
    shut_down: AtomicBool,
    overflow: OverflowPolicy,
    metrics: Arc<DispatchMetrics>,
}

// Compile-time assertion: ThreadDispatcher must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<ThreadDispatcher>();
};

impl ThreadDispatcher {
    /// Spawn the worker. `queue_size: None` is an unbounded queue (the
    /// overflow policy then never applies).
    pub fn new(name: impl Into<String>, queue_size: Option<usize>, overflow: OverflowPolicy) -> Self {
        let name = name.into();
        let (tx, rx) = match queue_size {
            Some(cap) => crossbeam_channel::bounded::<Task>(cap),
            None => crossbeam_channel::unbounded::<Task>(),
        };
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let metrics = Arc::new(DispatchMetrics::new());
        let worker_id = Arc::new(Mutex::new(None));

        let worker_rx = rx.clone();
        let worker_metrics = Arc::clone(&metrics);
        let worker_id_slot = Arc::clone(&worker_id);
        let worker_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("rill-dispatch-{name}"))
            .spawn(move || {
                *worker_id_slot.lock().unwrap() = Some(std::thread::current().id());
                while let Ok(task) = worker_rx.recv() {
                    run_guarded(&worker_name, task, &worker_metrics);
                }
                let _ = done_tx.send(());
            })
            .expect("failed to spawn dispatcher worker");

        Self {
            name,
            tx: Mutex::new(Some(tx)),
            drain_rx: rx,
            worker_id,
            handle: Mutex::new(Some(handle)),
            done_rx,
            shut_down: AtomicBool::new(false),
            overflow,
            metrics,
        }
    }
}

impl Dispatcher for ThreadDispatcher {
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
        *self.worker_id.lock().unwrap() == Some(std::thread::current().id())
    }

    fn ordered(&self) -> bool {
        true
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            // Already shut down; report whether the worker was joined.
            return self.handle.lock().unwrap().is_none();
        }
        // Closing the channel lets the worker drain and exit.
        self.tx.lock().unwrap().take();
        let drained = self.done_rx.recv_timeout(timeout).is_ok();
        if drained {
            if let Some(handle) = self.handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        } else {
            log::warn!(
                "dispatcher '{}': queue did not drain within {timeout:?}",
                self.name
            );
        }
        drained
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

impl Drop for ThreadDispatcher {
    fn drop(&mut self) {
        self.shutdown(Duration::from_millis(100));
    }
}
