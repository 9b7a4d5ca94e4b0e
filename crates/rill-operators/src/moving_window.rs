//! Timer-ticked snapshots of the most recent values.
//!
//! A fixed ring keeps the latest `backlog` values; a periodic timer
//! tick emits a snapshot list in arrival order without clearing the
//! ring. The arrival pointer is an atomic counter and the derived
//! index is `pointer % backlog`; slot writes are serialized by the
//! operator's mutex so non-primitive payloads cannot tear.
//!
//! Before the ring has filled, a tick emits the `min(arrived, backlog)`
//! values that actually arrived — never uninitialized slots.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rill_core::{
    Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber, Subscription,
    UpstreamCell, UNBOUNDED,
};
use rill_dispatch::{TimerRegistration, TimerService};

/// Emit, every `period`, the latest `backlog` values in arrival order.
/// The first snapshot fires after `delay` (or one `period` when zero).
///
/// # Panics
///
/// Panics if `backlog` is zero.
pub fn moving_window<T>(
    source: Arc<dyn Publisher<T>>,
    timer: Arc<TimerService>,
    period: Duration,
    delay: Duration,
    backlog: usize,
) -> Arc<MovingWindowOp<T>>
where
    T: Clone + Send + 'static,
{
    assert!(backlog > 0, "moving window backlog must be at least 1");
    Arc::new_cyclic(|me| MovingWindowOp {
        timer,
        period,
        delay,
        backlog,
        ring: Mutex::new(vec![None; backlog]),
        pointer: AtomicU64::new(0),
        registration: Mutex::new(None),
        started: AtomicBool::new(false),
        out: Downstream::new(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
        me: me.clone(),
    })
}

/// Operator node for [`moving_window`].
pub struct MovingWindowOp<T> {
    timer: Arc<TimerService>,
    period: Duration,
    delay: Duration,
    backlog: usize,
    ring: Mutex<Vec<Option<T>>>,
    /// Arrival counter; never wraps, never reset.
    pointer: AtomicU64,
    registration: Mutex<Option<TimerRegistration>>,
    started: AtomicBool,
    out: Downstream<Vec<T>>,
    upstream: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<T>>>>,
    me: Weak<Self>,
}

impl<T: Clone + Send + 'static> MovingWindowOp<T> {
    /// Snapshot the ring in arrival order and emit it. No-op while the
    /// ring is empty.
    pub(crate) fn emit_snapshot(&self) {
        let window = {
            let ring = self.ring.lock().unwrap();
            let pointer = self.pointer.load(Ordering::Acquire);
            let arrived = (pointer as usize).min(self.backlog);
            if arrived == 0 {
                return;
            }
            let mut window = Vec::with_capacity(arrived);
            if (pointer as usize) <= self.backlog {
                for slot in ring.iter().take(arrived) {
                    window.extend(slot.clone());
                }
            } else {
                let split = (pointer % self.backlog as u64) as usize;
                for slot in ring[split..].iter().chain(ring[..split].iter()) {
                    window.extend(slot.clone());
                }
            }
            window
        };
        self.out.next(window);
    }

    fn release(&self) {
        if let Some(registration) = self.registration.lock().unwrap().take() {
            registration.cancel();
        }
        self.ring.lock().unwrap().iter_mut().for_each(|slot| *slot = None);
    }
}

impl<T: Clone + Send + 'static> Publisher<Vec<T>> for MovingWindowOp<T> {
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<Vec<T>>>) {
        let subscription = Subscription::new(Arc::downgrade(&self) as Weak<dyn Producer>);
        if !self.out.wire(subscriber, subscription) {
            return;
        }
        let initial_delay = if self.delay.is_zero() {
            self.period
        } else {
            self.delay
        };
        let me = self.me.clone();
        let registration =
            self.timer
                .schedule_periodic_with_delay(self.period, initial_delay, move || {
                    if let Some(op) = me.upgrade() {
                        op.emit_snapshot();
                    }
                });
        *self.registration.lock().unwrap() = Some(registration);

        let source = self.source.lock().unwrap().take();
        if let Some(source) = source {
            source.subscribe(Arc::clone(&self) as Arc<dyn Subscriber<T>>);
        }
    }
}

impl<T: Clone + Send + 'static> Subscriber<T> for MovingWindowOp<T> {
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: T) {
        let mut ring = self.ring.lock().unwrap();
        let index = (self.pointer.fetch_add(1, Ordering::AcqRel) % self.backlog as u64) as usize;
        ring[index] = Some(value);
    }

    fn on_error(&self, error: StreamError) {
        self.upstream.clear();
        self.release();
        self.out.error(error);
    }

    fn on_complete(&self) {
        self.upstream.clear();
        self.release();
        self.out.complete();
    }
}

impl<T: Clone + Send + 'static> Producer for MovingWindowOp<T> {
    fn on_request(&self, _n: u64) {
        // The ring bounds memory; the upstream can flow freely once
        // any snapshot demand exists.
        if !self.started.swap(true, Ordering::AcqRel) {
            self.upstream.request(UNBOUNDED);
        }
        self.out.drain();
    }

    fn on_cancel(&self) {
        self.upstream.cancel();
        self.release();
        self.out.cancelled();
    }

    fn on_invalid_request(&self) {
        self.upstream.cancel();
        self.release();
        self.out.error(StreamError::Protocol(ProtocolError::ZeroRequest));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::broadcast;
    use rill_test_utils::CollectingSubscriber;

    fn quiet_timer() -> Arc<TimerService> {
        // Long period so only explicit emit_snapshot calls fire in the
        // deterministic tests.
        Arc::new(TimerService::with_resolution(Duration::from_millis(5)))
    }

    fn windowed(
        backlog: usize,
    ) -> (
        Arc<crate::broadcast::Broadcaster<i32>>,
        Arc<MovingWindowOp<i32>>,
        Arc<CollectingSubscriber<Vec<i32>>>,
    ) {
        let (broadcaster, stream) = broadcast::<i32>();
        let op = moving_window(
            stream,
            quiet_timer(),
            Duration::from_secs(3600),
            Duration::ZERO,
            backlog,
        );
        let sink = CollectingSubscriber::unbounded();
        Arc::clone(&op).subscribe(sink.clone_as_subscriber());
        (broadcaster, op, sink)
    }

    #[test]
    fn partial_ring_emits_only_arrived_values() {
        let (broadcaster, op, sink) = windowed(5);
        broadcaster.broadcast_next(10);
        broadcaster.broadcast_next(20);
        broadcaster.broadcast_next(30);
        op.emit_snapshot();
        assert_eq!(sink.values(), vec![vec![10, 20, 30]]);
    }

    #[test]
    fn empty_ring_emits_nothing() {
        let (_broadcaster, op, sink) = windowed(4);
        op.emit_snapshot();
        assert!(sink.values().is_empty());
    }

    #[test]
    fn full_ring_reads_in_arrival_order() {
        let (broadcaster, op, sink) = windowed(3);
        for v in [1, 2, 3, 4, 5] {
            broadcaster.broadcast_next(v);
        }
        op.emit_snapshot();
        // Pointer is 5, index 2: window is slots [2..3) ++ [0..2).
        assert_eq!(sink.values(), vec![vec![3, 4, 5]]);
    }

    #[test]
    fn snapshots_do_not_clear_the_ring() {
        let (broadcaster, op, sink) = windowed(3);
        for v in [1, 2, 3] {
            broadcaster.broadcast_next(v);
        }
        op.emit_snapshot();
        broadcaster.broadcast_next(4);
        op.emit_snapshot();
        assert_eq!(sink.values(), vec![vec![1, 2, 3], vec![2, 3, 4]]);
    }

    #[test]
    fn timer_drives_snapshots() {
        let timer = Arc::new(TimerService::with_resolution(Duration::from_millis(5)));
        let (broadcaster, stream) = broadcast::<i32>();
        let op = moving_window(
            stream,
            Arc::clone(&timer),
            Duration::from_millis(30),
            Duration::ZERO,
            8,
        );
        let sink = CollectingSubscriber::unbounded();
        Arc::clone(&op).subscribe(sink.clone_as_subscriber());

        broadcaster.broadcast_next(7);
        assert!(sink.await_count(2, Duration::from_secs(2)));
        assert!(sink.values().iter().all(|w| w == &vec![7]));
        timer.shutdown();
    }
}
