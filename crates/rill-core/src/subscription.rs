//! Per-edge subscription handle and upstream bookkeeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::demand::Demand;
use crate::traits::Producer;

/// The bidirectional handle between a subscriber and its immediate
/// upstream node.
///
/// Owned by the downstream subscriber; the upstream keeps only the
/// [`Demand`] view needed to account emissions. The producer reference
/// is weak so a cancelled edge does not keep a dead node alive.
pub struct Subscription {
    demand: Demand,
    cancelled: AtomicBool,
    producer: Weak<dyn Producer>,
}

// Compile-time assertion: Subscription must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Subscription>();
};

impl Subscription {
    /// Create a subscription routing demand callbacks to `producer`.
    pub fn new(producer: Weak<dyn Producer>) -> Arc<Self> {
        Arc::new(Self {
            demand: Demand::new(),
            cancelled: AtomicBool::new(false),
            producer,
        })
    }

    /// A subscription that is already cancelled and routes nowhere.
    /// Handed to subscribers that are rejected at bind time, so they
    /// still observe the `on_subscribe` → terminal ordering.
    pub fn dead() -> Arc<Self> {
        Arc::new(Self {
            demand: Demand::new(),
            cancelled: AtomicBool::new(true),
            producer: Weak::<DeadProducer>::new(),
        })
    }

    /// Authorize `n` more `Next` signals. `request(0)` is a protocol
    /// error surfaced downstream by the producer; requests that would
    /// overflow saturate to unbounded.
    pub fn request(&self, n: u64) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let Some(producer) = self.producer.upgrade() else {
            return;
        };
        if n == 0 {
            producer.on_invalid_request();
            return;
        }
        self.demand.add(n);
        producer.on_request(n);
    }

    /// Cancel the edge. Idempotent; the upstream may still deliver at
    /// most one signal already in flight.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(producer) = self.producer.upgrade() {
            producer.on_cancel();
        }
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The pending-demand counter for this edge.
    pub fn demand(&self) -> &Demand {
        &self.demand
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("demand", &self.demand)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Placeholder producer type for [`Subscription::dead`].
struct DeadProducer;

impl Producer for DeadProducer {
    fn on_request(&self, _n: u64) {}
    fn on_cancel(&self) {}
    fn on_invalid_request(&self) {}
}

/// Holder for an operator node's single upstream subscription.
///
/// Enforces the at-most-one-active-upstream rule and absorbs the
/// subscribe-order race: downstream demand can arrive before the
/// upstream edge exists, so requests issued early are parked and
/// flushed when [`set`](UpstreamCell::set) binds the subscription.
pub struct UpstreamCell {
    subscription: Mutex<Option<Arc<Subscription>>>,
    deferred: Demand,
    cancelled: AtomicBool,
}

// Compile-time assertion: UpstreamCell must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<UpstreamCell>();
};

impl UpstreamCell {
    /// An empty cell.
    pub fn new() -> Self {
        Self {
            subscription: Mutex::new(None),
            deferred: Demand::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Bind the upstream subscription. Returns `false` (and cancels
    /// `subscription`) when the cell is already bound or the node was
    /// cancelled first.
    pub fn set(&self, subscription: Arc<Subscription>) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            subscription.cancel();
            return false;
        }
        {
            let mut slot = self.subscription.lock().unwrap();
            if slot.is_some() {
                drop(slot);
                subscription.cancel();
                return false;
            }
            *slot = Some(Arc::clone(&subscription));
        }
        // Flush demand that arrived before the upstream was bound.
        let parked = self.deferred.current();
        if parked > 0 && self.deferred.try_claim(parked) {
            subscription.request(parked);
        }
        true
    }

    /// Request `n` from the upstream, or park the demand if the
    /// upstream is not bound yet.
    pub fn request(&self, n: u64) {
        let subscription = self.subscription.lock().unwrap().clone();
        match subscription {
            Some(s) => s.request(n),
            None => {
                self.deferred.add(n);
            }
        }
    }

    /// Cancel the upstream edge and drop the handle. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(s) = self.subscription.lock().unwrap().take() {
            s.cancel();
        }
    }

    /// Drop the handle without cancelling — used after the upstream
    /// delivered its terminal and the edge is already finished.
    pub fn clear(&self) {
        self.subscription.lock().unwrap().take();
    }
}

impl Default for UpstreamCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct Recorder {
        requested: AtomicU64,
        cancelled: AtomicBool,
        invalid: AtomicBool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requested: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                invalid: AtomicBool::new(false),
            })
        }
    }

    impl Producer for Recorder {
        fn on_request(&self, n: u64) {
            self.requested.fetch_add(n, Ordering::Relaxed);
        }
        fn on_cancel(&self) {
            self.cancelled.store(true, Ordering::Relaxed);
        }
        fn on_invalid_request(&self) {
            self.invalid.store(true, Ordering::Relaxed);
        }
    }

    #[test]
    fn request_credits_demand_and_notifies() {
        let producer = Recorder::new();
        let sub = Subscription::new(Arc::downgrade(&producer) as Weak<dyn Producer>);
        sub.request(7);
        assert_eq!(sub.demand().current(), 7);
        assert_eq!(producer.requested.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn zero_request_routes_to_invalid_path() {
        let producer = Recorder::new();
        let sub = Subscription::new(Arc::downgrade(&producer) as Weak<dyn Producer>);
        sub.request(0);
        assert!(producer.invalid.load(Ordering::Relaxed));
        assert_eq!(sub.demand().current(), 0);
    }

    #[test]
    fn cancel_is_idempotent_and_notifies_once() {
        let producer = Recorder::new();
        let sub = Subscription::new(Arc::downgrade(&producer) as Weak<dyn Producer>);
        sub.cancel();
        assert!(producer.cancelled.load(Ordering::Relaxed));
        producer.cancelled.store(false, Ordering::Relaxed);
        sub.cancel();
        assert!(!producer.cancelled.load(Ordering::Relaxed));
    }

    #[test]
    fn requests_after_cancel_are_dropped() {
        let producer = Recorder::new();
        let sub = Subscription::new(Arc::downgrade(&producer) as Weak<dyn Producer>);
        sub.cancel();
        sub.request(5);
        assert_eq!(producer.requested.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn upstream_cell_parks_early_demand() {
        let cell = UpstreamCell::new();
        cell.request(10);

        let producer = Recorder::new();
        let sub = Subscription::new(Arc::downgrade(&producer) as Weak<dyn Producer>);
        assert!(cell.set(sub));
        assert_eq!(producer.requested.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn upstream_cell_rejects_second_binding() {
        let cell = UpstreamCell::new();
        let first = Recorder::new();
        let second = Recorder::new();
        assert!(cell.set(Subscription::new(
            Arc::downgrade(&first) as Weak<dyn Producer>
        )));
        let late = Subscription::new(Arc::downgrade(&second) as Weak<dyn Producer>);
        assert!(!cell.set(Arc::clone(&late)));
        assert!(late.is_cancelled());
    }

    #[test]
    fn upstream_cell_cancel_before_set_cancels_incoming() {
        let cell = UpstreamCell::new();
        cell.cancel();
        let producer = Recorder::new();
        let sub = Subscription::new(Arc::downgrade(&producer) as Weak<dyn Producer>);
        assert!(!cell.set(Arc::clone(&sub)));
        assert!(sub.is_cancelled());
    }
}
