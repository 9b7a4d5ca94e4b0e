//! Reusable subscriber, producer, and dispatcher fixtures.
//!
//! Four standard fixtures for operator and pipeline tests:
//!
//! - [`CollectingSubscriber`] — records every signal and provides
//!   latch-style waits for asynchronous pipelines.
//! - [`ManualProducer`] — hand-driven publisher; scripts upstream
//!   signals and records the demand side of its edge.
//! - [`FailingSubscriber`] — panics deterministically on its N-th
//!   value, for exercising panic barriers without a real defect.
//! - [`CountingDispatcher`] — delegating dispatcher that counts
//!   submissions.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use rill_core::{
    Demand, Downstream, Lifecycle, Producer, ProtocolError, Publisher, StreamError, Subscriber,
    Subscription, UNBOUNDED,
};
use rill_dispatch::{DispatchError, Dispatcher, MetricsSnapshot, Task};

/// Records values, errors, and completions; optionally auto-requests
/// demand at subscribe time.
pub struct CollectingSubscriber<T> {
    values: Mutex<Vec<T>>,
    errors: Mutex<Vec<StreamError>>,
    completions: AtomicUsize,
    subscription: Mutex<Option<Arc<Subscription>>>,
    initial_demand: u64,
    gate: Mutex<()>,
    changed: Condvar,
}

impl<T: Send + 'static> CollectingSubscriber<T> {
    /// A subscriber that requests unbounded demand on subscribe.
    pub fn unbounded() -> Arc<Self> {
        Self::with_demand(UNBOUNDED)
    }

    /// A subscriber that requests `n` on subscribe.
    pub fn with_demand(n: u64) -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            subscription: Mutex::new(None),
            initial_demand: n,
            gate: Mutex::new(()),
            changed: Condvar::new(),
        })
    }

    /// A subscriber that requests nothing until told to.
    pub fn manual() -> Arc<Self> {
        Self::with_demand(0)
    }

    /// Upcast helper so call sites stay terse.
    pub fn clone_as_subscriber(self: &Arc<Self>) -> Arc<dyn Subscriber<T>> {
        Arc::clone(self) as Arc<dyn Subscriber<T>>
    }

    /// Request more demand through the stored subscription.
    pub fn request(&self, n: u64) {
        let subscription = self.subscription.lock().unwrap().clone();
        if let Some(subscription) = subscription {
            subscription.request(n);
        }
    }

    /// Cancel the stored subscription.
    pub fn cancel(&self) {
        let subscription = self.subscription.lock().unwrap().clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    /// Recorded values, in delivery order.
    pub fn values(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.values.lock().unwrap().clone()
    }

    /// Number of values delivered so far.
    pub fn value_count(&self) -> usize {
        self.values.lock().unwrap().len()
    }

    /// Recorded errors (at most one from a conformant publisher).
    pub fn errors(&self) -> Vec<StreamError> {
        self.errors.lock().unwrap().clone()
    }

    /// Number of `on_complete` calls (at most one from a conformant
    /// publisher).
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::Acquire)
    }

    /// Whether a terminal signal has been observed.
    pub fn is_terminated(&self) -> bool {
        self.completions() > 0 || !self.errors.lock().unwrap().is_empty()
    }

    /// Block until a terminal arrives or `timeout` elapses. Returns
    /// whether a terminal was observed.
    pub fn await_terminal(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.is_terminated())
    }

    /// Block until at least `n` values arrived or `timeout` elapses.
    pub fn await_count(&self, n: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.value_count() >= n)
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.gate.lock().unwrap();
        while !done() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (next, _timeout) = self.changed.wait_timeout(guard, remaining).unwrap();
            guard = next;
        }
        true
    }

    fn notify(&self) {
        let _guard = self.gate.lock().unwrap();
        self.changed.notify_all();
    }
}

impl<T: Send + 'static> Subscriber<T> for CollectingSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        *self.subscription.lock().unwrap() = Some(Arc::clone(&subscription));
        if self.initial_demand > 0 {
            subscription.request(self.initial_demand);
        }
    }

    fn on_next(&self, value: T) {
        self.values.lock().unwrap().push(value);
        self.notify();
    }

    fn on_error(&self, error: StreamError) {
        self.errors.lock().unwrap().push(error);
        self.notify();
    }

    fn on_complete(&self) {
        self.completions.fetch_add(1, Ordering::Release);
        self.notify();
    }
}

/// Hand-driven publisher for a single subscriber.
///
/// Scripts upstream signals (`next`/`error`/`complete`) from the test
/// body and records the demand side of the edge: cumulative requested
/// credit and cancellation. Useful for asserting what an operator
/// requests from its upstream (re-crediting, batching multipliers)
/// without a real source in the way.
pub struct ManualProducer<T> {
    out: Downstream<T>,
    requested: Demand,
}

impl<T: Send + 'static> ManualProducer<T> {
    /// A producer with no subscriber yet.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            out: Downstream::new(),
            requested: Demand::new(),
        })
    }

    /// Script a value signal. Parks on the edge while the subscriber
    /// has no credit.
    pub fn next(&self, value: T) {
        self.out.next(value);
    }

    /// Script the error terminal.
    pub fn error(&self, error: StreamError) {
        self.out.error(error);
    }

    /// Script the completion terminal.
    pub fn complete(&self) {
        self.out.complete();
    }

    /// Cumulative demand the subscriber side has issued (saturating at
    /// the unbounded sentinel).
    pub fn requested(&self) -> u64 {
        self.requested.current()
    }

    /// Whether the downstream cancelled the edge.
    pub fn is_cancelled(&self) -> bool {
        self.out.state() == Lifecycle::Cancelled
    }
}

impl<T: Send + 'static> Publisher<T> for ManualProducer<T> {
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Subscription::new(Arc::downgrade(&self) as Weak<dyn Producer>);
        self.out.wire(subscriber, subscription);
    }
}

impl<T: Send + 'static> Producer for ManualProducer<T> {
    fn on_request(&self, n: u64) {
        self.requested.add(n);
        self.out.drain();
    }

    fn on_cancel(&self) {
        self.out.cancelled();
    }

    fn on_invalid_request(&self) {
        self.out.error(StreamError::Protocol(ProtocolError::ZeroRequest));
    }
}

/// Subscriber that panics on its `fail_after`-th value (1-based) and
/// on every value after it.
///
/// Drives panic-barrier paths deterministically: dispatch its
/// `on_next` through a worker and assert the worker survives and the
/// panic was counted.
pub struct FailingSubscriber<T> {
    fail_after: usize,
    seen: AtomicUsize,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + 'static> FailingSubscriber<T> {
    /// A subscriber that fails on the `fail_after`-th value.
    ///
    /// # Panics
    ///
    /// Panics if `fail_after` is zero.
    pub fn new(fail_after: usize) -> Arc<Self> {
        assert!(fail_after > 0, "fail_after is 1-based");
        Arc::new(Self {
            fail_after,
            seen: AtomicUsize::new(0),
            _marker: PhantomData,
        })
    }

    /// Number of values observed, including the failing ones.
    pub fn seen(&self) -> usize {
        self.seen.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> Subscriber<T> for FailingSubscriber<T> {
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        subscription.request(UNBOUNDED);
    }

    fn on_next(&self, _value: T) {
        let nth = self.seen.fetch_add(1, Ordering::AcqRel) + 1;
        if nth >= self.fail_after {
            panic!("failing subscriber reached value {nth}");
        }
    }

    fn on_error(&self, _error: StreamError) {}

    fn on_complete(&self) {}
}

/// Delegating dispatcher that counts `dispatch` calls.
///
/// Wrap any dispatcher to assert how many tasks an operator pushed
/// through it; everything else forwards to the wrapped dispatcher.
pub struct CountingDispatcher {
    inner: Arc<dyn Dispatcher>,
    submissions: AtomicU64,
}

impl CountingDispatcher {
    /// Wrap `inner`.
    pub fn wrap(inner: Arc<dyn Dispatcher>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            submissions: AtomicU64::new(0),
        })
    }

    /// Number of `dispatch` calls observed (accepted or not).
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Acquire)
    }
}

impl Dispatcher for CountingDispatcher {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn dispatch(&self, task: Task) -> Result<(), DispatchError> {
        self.submissions.fetch_add(1, Ordering::AcqRel);
        self.inner.dispatch(task)
    }

    fn in_context(&self) -> bool {
        self.inner.in_context()
    }

    fn ordered(&self) -> bool {
        self.inner.ordered()
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.shutdown(timeout)
    }

    fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics()
    }
}
