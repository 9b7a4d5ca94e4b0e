//! Dedicated-thread monotonic timer service.
//!
//! Callbacks run on the timer's own thread and must be cheap —
//! typically they post a task to a dispatcher or flip a flag. Periodic
//! registrations are scheduled at fixed offsets from the registration
//! time, not from the previous fire, so drift stays bounded.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default minimum resolution: delays and periods below this are
/// clamped up to it.
pub const DEFAULT_RESOLUTION: Duration = Duration::from_millis(50);

enum Schedule {
    OneShot,
    Periodic {
        origin: Instant,
        initial_delay: Duration,
        period: Duration,
        fired: AtomicU64,
    },
}

struct TimerEntry {
    cancelled: AtomicBool,
    callback: Box<dyn Fn() + Send + Sync>,
    schedule: Schedule,
}

impl TimerEntry {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Handle to a scheduled task. Cancelling is idempotent; a fire already
/// in flight may still complete once.
pub struct TimerRegistration {
    entry: Arc<TimerEntry>,
}

impl TimerRegistration {
    /// Cancel the registration.
    pub fn cancel(&self) {
        self.entry.cancelled.store(true, Ordering::Release);
    }

    /// Whether the registration has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.entry.is_cancelled()
    }
}

struct Fire {
    deadline: Instant,
    seq: u64,
    entry: Arc<TimerEntry>,
}

impl PartialEq for Fire {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Fire {}
impl PartialOrd for Fire {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Fire {
    // Reversed: the earliest deadline is the max of the heap.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct HeapState {
    heap: BinaryHeap<Fire>,
    next_seq: u64,
}

struct TimerShared {
    state: Mutex<HeapState>,
    signal: Condvar,
    shut_down: AtomicBool,
    resolution: Duration,
}

/// Monotonic scheduler with a dedicated worker thread.
pub struct TimerService {
    shared: Arc<TimerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

// Compile-time assertion: TimerService must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<TimerService>();
};

impl TimerService {
    /// A timer with the default 50 ms resolution.
    pub fn new() -> Self {
        Self::with_resolution(DEFAULT_RESOLUTION)
    }

    /// A timer with a custom minimum resolution (floored at 1 ms).
    pub fn with_resolution(resolution: Duration) -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(HeapState {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            signal: Condvar::new(),
            shut_down: AtomicBool::new(false),
            resolution: resolution.max(Duration::from_millis(1)),
        });
        let handle = std::thread::Builder::new()
            .name("rill-timer".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || timer_loop(shared)
            })
            .expect("failed to spawn timer thread");
        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// The effective minimum resolution.
    pub fn resolution(&self) -> Duration {
        self.shared.resolution
    }

    /// Run `callback` once after `delay` (clamped to the resolution).
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerRegistration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let delay = delay.max(self.shared.resolution);
        let entry = Arc::new(TimerEntry {
            cancelled: AtomicBool::new(false),
            callback: Box::new(callback),
            schedule: Schedule::OneShot,
        });
        self.push(Instant::now() + delay, Arc::clone(&entry));
        TimerRegistration { entry }
    }

    /// Run `callback` every `period`, first after one full period.
    pub fn schedule_periodic<F>(&self, period: Duration, callback: F) -> TimerRegistration
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule_periodic_with_delay(period, period, callback)
    }

    /// Run `callback` every `period`, first after `initial_delay`.
    /// Subsequent fires land at `registration + initial_delay + k·period`
    /// regardless of how long earlier fires took.
    pub fn schedule_periodic_with_delay<F>(
        &self,
        period: Duration,
        initial_delay: Duration,
        callback: F,
    ) -> TimerRegistration
    where
        F: Fn() + Send + Sync + 'static,
    {
        let period = period.max(self.shared.resolution);
        let initial_delay = initial_delay.max(self.shared.resolution);
        let origin = Instant::now();
        let entry = Arc::new(TimerEntry {
            cancelled: AtomicBool::new(false),
            callback: Box::new(callback),
            schedule: Schedule::Periodic {
                origin,
                initial_delay,
                period,
                fired: AtomicU64::new(0),
            },
        });
        self.push(origin + initial_delay, Arc::clone(&entry));
        TimerRegistration { entry }
    }

    /// Stop the worker. Registrations that have not fired are dropped.
    pub fn shutdown(&self) {
        self.shared.shut_down.store(true, Ordering::Release);
        self.shared.signal.notify_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn push(&self, deadline: Instant, entry: Arc<TimerEntry>) {
        let mut state = self.shared.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Fire {
            deadline,
            seq,
            entry,
        });
        drop(state);
        self.shared.signal.notify_all();
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if shared.shut_down.load(Ordering::Acquire) {
            return;
        }
        let now = Instant::now();
        match state.heap.peek() {
            Some(fire) if fire.deadline <= now => {}
            Some(fire) => {
                let wait = fire.deadline - now;
                let (next, _timeout) = shared.signal.wait_timeout(state, wait).unwrap();
                state = next;
                continue;
            }
            None => {
                // Nothing scheduled; park until a push or shutdown.
                let (next, _timeout) = shared
                    .signal
                    .wait_timeout(state, Duration::from_secs(1))
                    .unwrap();
                state = next;
                continue;
            }
        }
        let fire = state.heap.pop().expect("peeked entry present");
        // Callback runs without holding the heap lock, so schedule()
        // from inside a callback cannot deadlock.
        drop(state);
        if !fire.entry.is_cancelled() {
            (fire.entry.callback)();
            if let Schedule::Periodic {
                origin,
                initial_delay,
                period,
                ref fired,
            } = fire.entry.schedule
            {
                if !fire.entry.is_cancelled() {
                    let k = fired.fetch_add(1, Ordering::Relaxed) + 1;
                    let deadline = origin + initial_delay + period * (k as u32);
                    let mut next_state = shared.state.lock().unwrap();
                    let seq = next_state.next_seq;
                    next_state.next_seq += 1;
                    next_state.heap.push(Fire {
                        deadline,
                        seq,
                        entry: Arc::clone(&fire.entry),
                    });
                    drop(next_state);
                }
            }
        }
        state = shared.state.lock().unwrap();
    }
}
