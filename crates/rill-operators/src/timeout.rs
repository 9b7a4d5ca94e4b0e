//! Inactivity watchdog.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rill_core::{
    Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber, Subscription,
    UpstreamCell,
};
use rill_dispatch::{TimerRegistration, TimerService};

/// Forward the input unchanged; if no value arrives within `duration`
/// of the previous one (or of subscription), emit `Error(Timeout)` and
/// cancel the upstream.
pub fn timeout<T>(
    source: Arc<dyn Publisher<T>>,
    timer: Arc<TimerService>,
    duration: Duration,
) -> Arc<TimeoutOp<T>>
where
    T: Send + 'static,
{
    Arc::new_cyclic(|me| TimeoutOp {
        timer,
        duration,
        generation: AtomicU64::new(0),
        registration: Mutex::new(None),
        out: Downstream::new(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
        me: me.clone(),
    })
}

/// Operator node for [`timeout`].
///
/// Each arrival bumps the activity generation and re-arms a one-shot
/// watchdog that captured the previous generation; a watchdog firing
/// with a stale generation is a no-op.
pub struct TimeoutOp<T> {
    timer: Arc<TimerService>,
    duration: Duration,
    generation: AtomicU64,
    registration: Mutex<Option<TimerRegistration>>,
    out: Downstream<T>,
    upstream: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<T>>>>,
    me: Weak<Self>,
}

impl<T: Send + 'static> TimeoutOp<T> {
    fn arm(&self) {
        let generation = self.generation.load(Ordering::Acquire);
        let me = self.me.clone();
        let duration = self.duration;
        let registration = self.timer.schedule(duration, move || {
            if let Some(op) = me.upgrade() {
                op.expired(generation, duration);
            }
        });
        let previous = self.registration.lock().unwrap().replace(registration);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn expired(&self, generation: u64, duration: Duration) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        self.upstream.cancel();
        self.out.error(StreamError::Timeout { idle: duration });
    }

    fn release(&self) {
        if let Some(registration) = self.registration.lock().unwrap().take() {
            registration.cancel();
        }
    }
}

impl<T: Send + 'static> Publisher<T> for TimeoutOp<T> {
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Subscription::new(Arc::downgrade(&self) as Weak<dyn Producer>);
        if !self.out.wire(subscriber, subscription) {
            return;
        }
        // The clock starts at subscription, not at the first value.
        self.arm();
        let source = self.source.lock().unwrap().take();
        if let Some(source) = source {
            source.subscribe(Arc::clone(&self) as Arc<dyn Subscriber<T>>);
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for TimeoutOp<T> {
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: T) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.arm();
        self.out.next(value);
    }

    fn on_error(&self, error: StreamError) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.upstream.clear();
        self.release();
        self.out.error(error);
    }

    fn on_complete(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.upstream.clear();
        self.release();
        self.out.complete();
    }
}

impl<T: Send + 'static> Producer for TimeoutOp<T> {
    fn on_request(&self, n: u64) {
        self.upstream.request(n);
        self.out.drain();
    }

    fn on_cancel(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
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

    fn fast_timer() -> Arc<TimerService> {
        Arc::new(TimerService::with_resolution(Duration::from_millis(5)))
    }

    #[test]
    fn passes_values_through_while_active() {
        let timer = fast_timer();
        let (broadcaster, stream) = broadcast::<i32>();
        let sink = CollectingSubscriber::unbounded();
        timeout(stream, Arc::clone(&timer), Duration::from_secs(3600))
            .subscribe(sink.clone_as_subscriber());

        broadcaster.broadcast_next(1);
        broadcaster.broadcast_next(2);
        broadcaster.broadcast_complete();
        assert_eq!(sink.values(), vec![1, 2]);
        assert_eq!(sink.completions(), 1);
        assert!(sink.errors().is_empty());
        timer.shutdown();
    }

    #[test]
    fn inactivity_surfaces_a_timeout_error() {
        let timer = fast_timer();
        let (broadcaster, stream) = broadcast::<i32>();
        let sink = CollectingSubscriber::unbounded();
        timeout(stream, Arc::clone(&timer), Duration::from_millis(30))
            .subscribe(sink.clone_as_subscriber());

        broadcaster.broadcast_next(1);
        assert!(sink.await_terminal(Duration::from_secs(2)));
        let errors = sink.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], StreamError::Timeout { .. }));
        // The watchdog detached the upstream edge when it fired.
        assert_eq!(broadcaster.subscriber_count(), 0);
        timer.shutdown();
    }

    #[test]
    fn completion_disarms_the_watchdog() {
        let timer = fast_timer();
        let (broadcaster, stream) = broadcast::<i32>();
        let sink = CollectingSubscriber::unbounded();
        timeout(stream, Arc::clone(&timer), Duration::from_millis(30))
            .subscribe(sink.clone_as_subscriber());

        broadcaster.broadcast_complete();
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(sink.completions(), 1);
        assert!(sink.errors().is_empty());
        timer.shutdown();
    }
}
