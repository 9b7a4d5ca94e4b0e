//! Dispatcher boundary: shift downstream delivery onto an executor.
//!
//! Each upstream `Next` is turned into a task on the bound dispatcher.
//! Demand accounting stays precise across the asynchronous hop: the
//! boundary claims the downstream credit *before* enqueueing, so every
//! queued task represents one already-accounted value. `request(n)`
//! flows upstream directly, never through the dispatcher.
//!
//! Terminals must land after every value that preceded them, even on
//! an unordered pool where tasks run in parallel. The boundary counts
//! its in-flight delivery tasks; a terminal parks until the count hits
//! zero and is flushed by whichever side gets there last (the final
//! task, or the terminal itself when nothing is in flight).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rill_core::{
    Downstream, Producer, ProtocolError, Publisher, Signal, StreamError, Subscriber,
    Subscription, UpstreamCell,
};
use rill_dispatch::Dispatcher;

/// Re-deliver every signal of `source` as a task on `dispatcher`.
pub fn dispatch_on<T>(
    source: Arc<dyn Publisher<T>>,
    dispatcher: Arc<dyn Dispatcher>,
) -> Arc<BoundaryOp<T>>
where
    T: Send + 'static,
{
    Arc::new_cyclic(|me| BoundaryOp {
        dispatcher,
        in_flight: AtomicU64::new(0),
        parked_terminal: Mutex::new(None),
        out: Downstream::new(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
        me: me.clone(),
    })
}

/// Operator node for [`dispatch_on`].
pub struct BoundaryOp<T> {
    dispatcher: Arc<dyn Dispatcher>,
    /// Delivery tasks enqueued but not yet finished.
    in_flight: AtomicU64,
    /// Terminal waiting for the in-flight count to reach zero. Only
    /// ever `Signal::Error` or `Signal::Complete`.
    parked_terminal: Mutex<Option<Signal<T>>>,
    out: Downstream<T>,
    upstream: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<T>>>>,
    me: Weak<Self>,
}

impl<T: Send + 'static> BoundaryOp<T> {
    fn transport_failure(&self) {
        self.upstream.cancel();
        self.out.error(StreamError::Overflow {
            queue: self.dispatcher.name().to_string(),
        });
    }

    /// Called at the end of every delivery task.
    fn task_done(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.flush_terminal();
        }
    }

    fn park_terminal(&self, terminal: Signal<T>) {
        *self.parked_terminal.lock().unwrap() = Some(terminal);
        if self.in_flight.load(Ordering::Acquire) == 0 {
            self.flush_terminal();
        }
    }

    fn flush_terminal(&self) {
        let terminal = self.parked_terminal.lock().unwrap().take();
        match terminal {
            Some(Signal::Error(error)) => self.out.error(error),
            Some(Signal::Complete) => self.out.complete(),
            _ => {}
        }
    }
}

impl<T: Send + 'static> Publisher<T> for BoundaryOp<T> {
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Subscription::new(Arc::downgrade(&self) as Weak<dyn Producer>);
        if !self.out.wire(subscriber, subscription) {
            return;
        }
        let source = self.source.lock().unwrap().take();
        if let Some(source) = source {
            source.subscribe(Arc::clone(&self) as Arc<dyn Subscriber<T>>);
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for BoundaryOp<T> {
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: T) {
        // Pre-subtract the credit this value consumes; the queued task
        // delivers without touching the demand counter again.
        if !self.out.try_claim() {
            self.upstream.cancel();
            self.out
                .error(StreamError::Protocol(ProtocolError::UnrequestedNext));
            return;
        }
        if self.dispatcher.in_context() {
            self.out.next_preclaimed(value);
            return;
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let me = self.me.clone();
        let submitted = self.dispatcher.dispatch(Box::new(move || {
            if let Some(op) = me.upgrade() {
                op.out.next_preclaimed(value);
                op.task_done();
            }
        }));
        if submitted.is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.transport_failure();
        }
    }

    fn on_error(&self, error: StreamError) {
        self.upstream.clear();
        self.park_terminal(Signal::Error(error));
    }

    fn on_complete(&self) {
        self.upstream.clear();
        self.park_terminal(Signal::Complete);
    }
}

impl<T: Send + 'static> Producer for BoundaryOp<T> {
    fn on_request(&self, n: u64) {
        self.upstream.request(n);
        self.out.drain();
    }

    fn on_cancel(&self) {
        self.upstream.cancel();
        self.parked_terminal.lock().unwrap().take();
        self.out.cancelled();
    }

    fn on_invalid_request(&self) {
        self.upstream.cancel();
        self.out.error(StreamError::Protocol(ProtocolError::ZeroRequest));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::range;
    use rill_dispatch::{OverflowPolicy, PoolDispatcher, SyncDispatcher, ThreadDispatcher};
    use rill_test_utils::CollectingSubscriber;
    use std::time::Duration;

    #[test]
    fn values_cross_an_ordered_boundary_in_order() {
        let dispatcher = Arc::new(ThreadDispatcher::new(
            "boundary",
            None,
            OverflowPolicy::Block,
        ));
        let sink = CollectingSubscriber::unbounded();
        dispatch_on(range(0, 100), dispatcher.clone()).subscribe(sink.clone_as_subscriber());

        assert!(sink.await_terminal(Duration::from_secs(5)));
        assert_eq!(sink.values(), (0..100).collect::<Vec<_>>());
        assert_eq!(sink.completions(), 1);
        dispatcher.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn inline_dispatcher_short_circuits() {
        let dispatcher = Arc::new(SyncDispatcher::new("inline"));
        let sink = CollectingSubscriber::unbounded();
        dispatch_on(range(0, 5), dispatcher).subscribe(sink.clone_as_subscriber());
        assert_eq!(sink.values(), vec![0, 1, 2, 3, 4]);
        assert_eq!(sink.completions(), 1);
    }

    #[test]
    fn terminal_waits_for_in_flight_values_on_a_pool() {
        let dispatcher = Arc::new(PoolDispatcher::new("pool", 4, None, OverflowPolicy::Block));
        let sink = CollectingSubscriber::unbounded();
        dispatch_on(range(0, 1_000), dispatcher.clone()).subscribe(sink.clone_as_subscriber());

        assert!(sink.await_terminal(Duration::from_secs(10)));
        // Every value precedes the terminal, though their relative
        // order across workers is unspecified.
        assert_eq!(sink.value_count(), 1_000);
        assert_eq!(sink.completions(), 1);
        dispatcher.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn demand_is_respected_across_the_boundary() {
        let dispatcher = Arc::new(ThreadDispatcher::new(
            "paced",
            None,
            OverflowPolicy::Block,
        ));
        let sink = CollectingSubscriber::with_demand(3);
        dispatch_on(range(0, 100), dispatcher.clone()).subscribe(sink.clone_as_subscriber());

        assert!(sink.await_count(3, Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.values(), vec![0, 1, 2]);

        sink.request(2);
        assert!(sink.await_count(5, Duration::from_secs(5)));
        assert_eq!(sink.values(), vec![0, 1, 2, 3, 4]);
        dispatcher.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn shut_down_dispatcher_surfaces_overflow() {
        let dispatcher = Arc::new(ThreadDispatcher::new(
            "closed",
            None,
            OverflowPolicy::Block,
        ));
        dispatcher.shutdown(Duration::from_secs(1));
        let sink = CollectingSubscriber::unbounded();
        dispatch_on(range(0, 5), dispatcher).subscribe(sink.clone_as_subscriber());
        let errors = sink.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], StreamError::Overflow { .. }));
    }
}
