//! The downstream edge: demand-gated, exactly-once-terminal delivery.
//!
//! [`Downstream`] is the one emission path every operator node shares.
//! Signals are appended to a pending queue and drained by whichever
//! thread holds the work-in-progress counter, which gives three
//! guarantees with one mechanism:
//!
//! - **Non-reentrance**: a node that emits from within its own
//!   `on_next` frame appends to the queue and unwinds; the outer drain
//!   loop picks the signal up iteratively.
//! - **Serialization**: concurrent emitters (fan-in nodes) enqueue and
//!   race for the drain; exactly one thread delivers at a time, so
//!   subscribers never see overlapping `on_next` calls.
//! - **Demand deferral**: a `Next` at the head of the queue is only
//!   popped when one credit can be claimed from the edge's demand
//!   counter; otherwise it parks until the next `request` drains again.
//!
//! Terminals are not demand-gated, but they are order-gated: a terminal
//! parks behind queued `Next`s so no subscriber observes completion
//! before values it has already been promised.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::StreamError;
use crate::signal::{Lifecycle, StateCell};
use crate::subscription::Subscription;
use crate::traits::Subscriber;

/// What a bounded edge does when its pending queue is full.
///
/// Hot edges (broadcast subscribers) can outrun a slow consumer; the
/// action decides between surfacing `Overflow` and configured loss.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowAction {
    /// Terminate the edge with [`StreamError::Overflow`].
    Error,
    /// Silently discard the incoming signal.
    DropNewest,
    /// Discard the oldest queued value to make room.
    DropOldest,
}

enum Entry<T> {
    /// A value that still needs one demand credit at delivery time.
    Next(T),
    /// A value whose credit was claimed by the emitter (dispatcher
    /// boundaries pre-subtract before enqueueing).
    Preclaimed(T),
    Error(StreamError),
    Complete,
}

impl<T> Entry<T> {
    fn is_terminal(&self) -> bool {
        matches!(self, Entry::Error(_) | Entry::Complete)
    }
}

/// One publisher→subscriber edge.
pub struct Downstream<T> {
    target: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    subscription: Mutex<Option<Arc<Subscription>>>,
    state: StateCell,
    queue: Mutex<VecDeque<Entry<T>>>,
    wip: AtomicU64,
    capacity: Option<usize>,
    on_full: OverflowAction,
    name: String,
}

// Compile-time assertion: Downstream must be Send + Sync for payloads
// that cross threads.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Downstream<u32>>();
};

impl<T: Send + 'static> Downstream<T> {
    /// An unbounded edge. Safe wherever arrivals are already paced by
    /// the demand this edge forwarded upstream.
    pub fn new() -> Self {
        Self {
            target: Mutex::new(None),
            subscription: Mutex::new(None),
            state: StateCell::new(),
            queue: Mutex::new(VecDeque::new()),
            wip: AtomicU64::new(0),
            capacity: None,
            on_full: OverflowAction::Error,
            name: "edge".to_string(),
        }
    }

    /// A bounded edge for hot producers that do not honor demand.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn bounded(name: impl Into<String>, capacity: usize, on_full: OverflowAction) -> Self {
        assert!(capacity > 0, "edge capacity must be at least 1");
        Self {
            capacity: Some(capacity),
            on_full,
            name: name.into(),
            ..Self::new()
        }
    }

    /// Bind the downstream subscriber and its subscription, invoking
    /// `on_subscribe` synchronously. Signals queued before the bind
    /// (early terminals on fan-out edges) are delivered right after.
    ///
    /// Returns `false` if the edge already has a subscriber; the
    /// rejected subscriber observes `on_subscribe` with a dead
    /// subscription followed by an `IllegalArgument` terminal.
    pub fn wire(
        &self,
        target: Arc<dyn Subscriber<T>>,
        subscription: Arc<Subscription>,
    ) -> bool {
        {
            let mut slot = self.target.lock().unwrap();
            if slot.is_some() {
                drop(slot);
                target.on_subscribe(Subscription::dead());
                target.on_error(StreamError::IllegalArgument(
                    "edge already has a subscriber".to_string(),
                ));
                return false;
            }
            if self.state.get() == Lifecycle::Cancelled {
                drop(slot);
                target.on_subscribe(Subscription::dead());
                return false;
            }
            *slot = Some(Arc::clone(&target));
        }
        *self.subscription.lock().unwrap() = Some(Arc::clone(&subscription));
        self.state.advance(Lifecycle::Subscribed);
        target.on_subscribe(subscription);
        self.drain();
        true
    }

    /// Emit a value. One demand credit is claimed at delivery time; the
    /// value parks in the queue while no credit is pending.
    pub fn next(&self, value: T) {
        self.push(Entry::Next(value));
    }

    /// Emit a value whose credit was already claimed via
    /// [`try_claim`](Downstream::try_claim).
    pub fn next_preclaimed(&self, value: T) {
        self.push(Entry::Preclaimed(value));
    }

    /// Emit the error terminal.
    pub fn error(&self, error: StreamError) {
        self.push(Entry::Error(error));
    }

    /// Emit the completion terminal.
    pub fn complete(&self) {
        self.push(Entry::Complete);
    }

    /// Mark the edge cancelled: pending signals are discarded and at
    /// most one in-flight delivery may still reach the subscriber.
    pub fn cancelled(&self) {
        if self.state.terminate(Lifecycle::Cancelled) {
            self.release();
        }
    }

    /// Whether the edge can still deliver signals.
    pub fn active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Current lifecycle state of the edge.
    pub fn state(&self) -> Lifecycle {
        self.state.get()
    }

    /// Pending demand credit on this edge (zero until wired).
    pub fn credit(&self) -> u64 {
        self.subscription
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.demand().current())
            .unwrap_or(0)
    }

    /// Claim one credit ahead of an emission (dispatcher boundaries do
    /// this before enqueueing the delivery task).
    pub fn try_claim(&self) -> bool {
        self.subscription
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.demand().try_claim(1))
            .unwrap_or(false)
    }

    /// Drain deliverable signals. Public so a node's `on_request` can
    /// flush values that parked while the edge had no credit.
    pub fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed: u64 = 1;
        loop {
            loop {
                let entry = self.take_deliverable();
                match entry {
                    Some(entry) => self.deliver(entry),
                    None => break,
                }
            }
            let previous = self.wip.fetch_sub(missed, Ordering::AcqRel);
            if previous == missed {
                break;
            }
            missed = previous - missed;
        }
    }

    fn push(&self, entry: Entry<T>) {
        if self.state.is_terminal() {
            self.report_dropped(&entry);
            return;
        }
        {
            let mut queue = self.queue.lock().unwrap();
            if let Some(capacity) = self.capacity {
                if !entry.is_terminal() && queue.len() >= capacity {
                    match self.on_full {
                        OverflowAction::Error => {
                            // The failure preempts the values that will
                            // never be consumed; a parked terminal would
                            // wait on credit that is not coming.
                            queue.clear();
                            queue.push_back(Entry::Error(StreamError::Overflow {
                                queue: self.name.clone(),
                            }));
                            drop(queue);
                            self.drain();
                            return;
                        }
                        OverflowAction::DropNewest => {
                            log::debug!("edge '{}' full, dropping newest signal", self.name);
                            return;
                        }
                        OverflowAction::DropOldest => {
                            log::debug!("edge '{}' full, dropping oldest signal", self.name);
                            queue.pop_front();
                        }
                    }
                }
            }
            queue.push_back(entry);
        }
        self.drain();
    }

    /// Pop the next entry that can be delivered right now, or `None`.
    fn take_deliverable(&self) -> Option<Entry<T>> {
        if self.target.lock().unwrap().is_none() {
            return None;
        }
        let mut queue = self.queue.lock().unwrap();
        match queue.front() {
            None => None,
            Some(Entry::Next(_)) => {
                if self.claim_one() {
                    queue.pop_front()
                } else {
                    None
                }
            }
            Some(_) => queue.pop_front(),
        }
    }

    fn claim_one(&self) -> bool {
        self.subscription
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.demand().try_claim(1))
            .unwrap_or(false)
    }

    fn deliver(&self, entry: Entry<T>) {
        match entry {
            Entry::Next(value) | Entry::Preclaimed(value) => {
                if self.state.is_terminal() {
                    return;
                }
                self.state.advance(Lifecycle::Running);
                let target = self.target.lock().unwrap().clone();
                if let Some(target) = target {
                    target.on_next(value);
                }
            }
            Entry::Error(error) => {
                if self.state.terminate(Lifecycle::Errored) {
                    let target = self.target.lock().unwrap().take();
                    self.release();
                    if let Some(target) = target {
                        target.on_error(error);
                    }
                } else {
                    self.report_dropped(&Entry::Error(error));
                }
            }
            Entry::Complete => {
                if self.state.terminate(Lifecycle::Completed) {
                    let target = self.target.lock().unwrap().take();
                    self.release();
                    if let Some(target) = target {
                        target.on_complete();
                    }
                }
            }
        }
    }

    /// Drop state so a finished edge holds no payloads, subscriber, or
    /// subscription.
    fn release(&self) {
        self.target.lock().unwrap().take();
        self.subscription.lock().unwrap().take();
        self.queue.lock().unwrap().clear();
    }

    fn report_dropped(&self, entry: &Entry<T>) {
        if let Entry::Error(error) = entry {
            if error.is_fatal() {
                log::error!(
                    "edge '{}' dropped fatal error after terminal: {error}",
                    self.name
                );
            }
        }
    }
}

impl<T: Send + 'static> Default for Downstream<T> {
    fn default() -> Self {
        Self::new()
    }
}
