//! Bounded slot-ring dispatcher with a single consumer thread.
//!
//! Producers claim monotonically increasing sequence numbers and write
//! into `seq % capacity`; each slot carries a published tag so the
//! consumer knows exactly when the slot for its next sequence is ready.
//! Slot writes are serialized by a per-slot mutex; the sequence
//! counters are atomics with acquire/release pairing.
//!
//! The consumer burns wait time according to the configured
//! [`WaitStrategy`]; producers facing a full ring either wait the same
//! way ([`OverflowPolicy::Block`]) or get an immediate
//! [`DispatchError::Full`] ([`OverflowPolicy::Error`]). Drop policies
//! do not apply to rings — a claimed sequence must be consumed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::config::{OverflowPolicy, ProducerType, WaitStrategy};
use crate::metrics::{DispatchMetrics, MetricsSnapshot};
use crate::task::{run_guarded, DispatchError, Dispatcher, Task};

/// How long a blocking waiter parks before rechecking shutdown flags.
const PARK_INTERVAL: Duration = Duration::from_millis(10);

struct RingShared {
    slots: Vec<Mutex<Option<Task>>>,
    /// `seq + 1` when the slot holds the task for `seq`; 0 when empty.
    published: Vec<AtomicU64>,
    /// Next sequence to claim.
    claim: AtomicU64,
    /// Sequences fully consumed.
    consumed: AtomicU64,
    capacity: u64,
    shut_down: AtomicBool,
    stop: AtomicBool,
    abandon: AtomicBool,
    gate: Mutex<()>,
    not_full: Condvar,
    not_empty: Condvar,
    wait: WaitStrategy,
    metrics: DispatchMetrics,
}

impl RingShared {
    fn idle(&self, empty_wait: bool) {
        match self.wait {
            WaitStrategy::Blocking => {
                let guard = self.gate.lock().unwrap();
                let condvar = if empty_wait {
                    &self.not_empty
                } else {
                    &self.not_full
                };
                let _unused = condvar.wait_timeout(guard, PARK_INTERVAL).unwrap();
            }
            WaitStrategy::BusySpin => std::hint::spin_loop(),
            WaitStrategy::Yielding => std::thread::yield_now(),
            WaitStrategy::Sleeping => std::thread::sleep(Duration::from_micros(50)),
        }
    }

    fn wake_consumer(&self) {
        if self.wait == WaitStrategy::Blocking {
            self.not_empty.notify_one();
        }
    }

    fn wake_producers(&self) {
        if self.wait == WaitStrategy::Blocking {
            self.not_full.notify_all();
        }
    }

    fn pending(&self) -> u64 {
        self.claim.load(Ordering::Acquire) - self.consumed.load(Ordering::Acquire)
    }
}

fn consumer_loop(name: String, shared: Arc<RingShared>, id_slot: Arc<Mutex<Option<ThreadId>>>) {
    *id_slot.lock().unwrap() = Some(std::thread::current().id());
    let capacity = shared.capacity;
    let mut next: u64 = 0;
    loop {
        let index = (next % capacity) as usize;
        if shared.published[index].load(Ordering::Acquire) == next + 1 {
            let task = shared.slots[index].lock().unwrap().take();
            shared.published[index].store(0, Ordering::Release);
            shared.consumed.store(next + 1, Ordering::Release);
            shared.wake_producers();
            if let Some(task) = task {
                run_guarded(&name, task, &shared.metrics);
            }
            next += 1;
        } else {
            let drained = next == shared.claim.load(Ordering::Acquire);
            if shared.stop.load(Ordering::Acquire)
                && (drained || shared.abandon.load(Ordering::Acquire))
            {
                break;
            }
            shared.idle(true);
        }
    }
}

/// Fixed-capacity ring dispatcher. Single consumer; producer discipline
/// per [`ProducerType`].
pub struct RingDispatcher {
    name: String,
    shared: Arc<RingShared>,
    producer_type: ProducerType,
    overflow: OverflowPolicy,
    consumer_id: Arc<Mutex<Option<ThreadId>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

// Compile-time assertion: RingDispatcher must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<RingDispatcher>();
};

impl RingDispatcher {
    /// Build the ring and spawn its consumer thread.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        producer_type: ProducerType,
        wait: WaitStrategy,
        overflow: OverflowPolicy,
    ) -> Self {
        assert!(capacity > 0, "ring capacity must be at least 1");
        let name = name.into();
        let shared = Arc::new(RingShared {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            published: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            claim: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            capacity: capacity as u64,
            shut_down: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            abandon: AtomicBool::new(false),
            gate: Mutex::new(()),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            wait,
            metrics: DispatchMetrics::new(),
        });
        let consumer_id = Arc::new(Mutex::new(None));
        let handle = std::thread::Builder::new()
            .name(format!("rill-ring-{name}"))
            .spawn({
                let shared = Arc::clone(&shared);
                let consumer_id = Arc::clone(&consumer_id);
                let name = name.clone();
                move || consumer_loop(name, shared, consumer_id)
            })
            .expect("failed to spawn ring consumer");

        Self {
            name,
            shared,
            producer_type,
            overflow,
            consumer_id,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// The configured producer discipline. With
    /// [`ProducerType::Single`], at most one thread may call
    /// [`dispatch`](Dispatcher::dispatch); the ring stays safe either
    /// way but the single-producer contract documents intent.
    pub fn producer_type(&self) -> ProducerType {
        self.producer_type
    }

    fn claim_sequence(&self) -> Result<u64, DispatchError> {
        let shared = &self.shared;
        loop {
            if shared.shut_down.load(Ordering::Acquire) {
                return Err(DispatchError::Shutdown {
                    name: self.name.clone(),
                });
            }
            let claim = shared.claim.load(Ordering::Acquire);
            if claim - shared.consumed.load(Ordering::Acquire) >= shared.capacity {
                match self.overflow {
                    OverflowPolicy::Error => {
                        return Err(DispatchError::Full {
                            name: self.name.clone(),
                        })
                    }
                    _ => {
                        shared.idle(false);
                        continue;
                    }
                }
            }
            if shared
                .claim
                .compare_exchange(claim, claim + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(claim);
            }
        }
    }
}

impl Dispatcher for RingDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatch(&self, task: Task) -> Result<(), DispatchError> {
        let sequence = match self.claim_sequence() {
            Ok(sequence) => sequence,
            Err(err) => {
                self.shared.metrics.record_rejected();
                return Err(err);
            }
        };
        let index = (sequence % self.shared.capacity) as usize;
        *self.shared.slots[index].lock().unwrap() = Some(task);
        self.shared.published[index].store(sequence + 1, Ordering::Release);
        self.shared.metrics.record_submitted();
        self.shared.wake_consumer();
        Ok(())
    }

    fn in_context(&self) -> bool {
        *self.consumer_id.lock().unwrap() == Some(std::thread::current().id())
    }

    fn ordered(&self) -> bool {
        true
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        self.shared.shut_down.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;
        let mut drained = self.shared.pending() == 0;
        while !drained && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
            drained = self.shared.pending() == 0;
        }
        if !drained {
            log::warn!(
                "dispatcher '{}': {} tasks abandoned after {timeout:?}",
                self.name,
                self.shared.pending()
            );
            self.shared.abandon.store(true, Ordering::Release);
        }
        self.shared.stop.store(true, Ordering::Release);
        self.shared.wake_consumer();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        drained
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

impl Drop for RingDispatcher {
    fn drop(&mut self) {
        self.shutdown(Duration::from_millis(100));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ring(wait: WaitStrategy, overflow: OverflowPolicy, capacity: usize) -> RingDispatcher {
        RingDispatcher::new("test-ring", capacity, ProducerType::Multi, wait, overflow)
    }

    #[test]
    fn single_producer_preserves_fifo() {
        let d = ring(WaitStrategy::Blocking, OverflowPolicy::Block, 8);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let order = Arc::clone(&order);
            d.dispatch(Box::new(move || order.lock().unwrap().push(i)))
                .unwrap();
        }
        assert!(d.shutdown(Duration::from_secs(5)));
        assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn multi_producer_delivers_everything() {
        let d = Arc::new(ring(WaitStrategy::Yielding, OverflowPolicy::Block, 16));
        let count = Arc::new(AtomicUsize::new(0));
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let d = Arc::clone(&d);
                let count = Arc::clone(&count);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        let count = Arc::clone(&count);
                        d.dispatch(Box::new(move || {
                            count.fetch_add(1, Ordering::Relaxed);
                        }))
                        .unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        assert!(d.shutdown(Duration::from_secs(10)));
        assert_eq!(count.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn error_policy_rejects_when_full() {
        let d = ring(WaitStrategy::Sleeping, OverflowPolicy::Error, 2);
        // Park the consumer on the first task so the ring backs up.
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        d.dispatch(Box::new(move || {
            let _ = gate_rx.recv();
        }))
        .unwrap();
        // The ring eventually reports Full once its slots are claimed.
        let mut saw_full = false;
        for _ in 0..16 {
            if matches!(
                d.dispatch(Box::new(|| {})),
                Err(DispatchError::Full { .. })
            ) {
                saw_full = true;
                break;
            }
        }
        let _ = gate_tx.send(());
        assert!(saw_full);
        d.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn shutdown_drains_queued_tasks() {
        let d = ring(WaitStrategy::Blocking, OverflowPolicy::Block, 32);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let count = Arc::clone(&count);
            d.dispatch(Box::new(move || {
                count.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        }
        assert!(d.shutdown(Duration::from_secs(5)));
        assert_eq!(count.load(Ordering::Relaxed), 32);
    }
}
