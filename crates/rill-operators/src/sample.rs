//! Period-based rate limiting: first or last value per window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rill_core::{
    Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber, Subscription,
    UpstreamCell,
};
use rill_dispatch::{TimerRegistration, TimerService};

/// Emit the first value of each period window and drop the rest until
/// the window rolls.
pub fn sample_first<T>(
    source: Arc<dyn Publisher<T>>,
    timer: Arc<TimerService>,
    period: Duration,
) -> Arc<SampleFirstOp<T>>
where
    T: Send + 'static,
{
    Arc::new_cyclic(|me| SampleFirstOp {
        timer,
        period,
        open: AtomicBool::new(true),
        registration: Mutex::new(None),
        out: Downstream::new(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
        me: me.clone(),
    })
}

/// Emit the last value of each period window at the window boundary.
pub fn sample<T>(
    source: Arc<dyn Publisher<T>>,
    timer: Arc<TimerService>,
    period: Duration,
) -> Arc<SampleOp<T>>
where
    T: Send + 'static,
{
    Arc::new_cyclic(|me| SampleOp {
        timer,
        period,
        last: Mutex::new(None),
        registration: Mutex::new(None),
        out: Downstream::new(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
        me: me.clone(),
    })
}

/// Operator node for [`sample_first`].
pub struct SampleFirstOp<T> {
    timer: Arc<TimerService>,
    period: Duration,
    open: AtomicBool,
    registration: Mutex<Option<TimerRegistration>>,
    out: Downstream<T>,
    upstream: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<T>>>>,
    me: Weak<Self>,
}

impl<T: Send + 'static> SampleFirstOp<T> {
    fn release(&self) {
        if let Some(registration) = self.registration.lock().unwrap().take() {
            registration.cancel();
        }
    }
}

impl<T: Send + 'static> Publisher<T> for SampleFirstOp<T> {
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Subscription::new(Arc::downgrade(&self) as Weak<dyn Producer>);
        if !self.out.wire(subscriber, subscription) {
            return;
        }
        let me = self.me.clone();
        let registration = self.timer.schedule_periodic(self.period, move || {
            if let Some(op) = me.upgrade() {
                op.open.store(true, Ordering::Release);
            }
        });
        *self.registration.lock().unwrap() = Some(registration);
        let source = self.source.lock().unwrap().take();
        if let Some(source) = source {
            source.subscribe(Arc::clone(&self) as Arc<dyn Subscriber<T>>);
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for SampleFirstOp<T> {
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: T) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.out.next(value);
        } else {
            // Dropped inside the window: replace the spent credit.
            self.upstream.request(1);
        }
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

impl<T: Send + 'static> Producer for SampleFirstOp<T> {
    fn on_request(&self, n: u64) {
        self.upstream.request(n);
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

/// Operator node for [`sample`].
pub struct SampleOp<T> {
    timer: Arc<TimerService>,
    period: Duration,
    last: Mutex<Option<T>>,
    registration: Mutex<Option<TimerRegistration>>,
    out: Downstream<T>,
    upstream: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<T>>>>,
    me: Weak<Self>,
}

impl<T: Send + 'static> SampleOp<T> {
    fn emit_window(&self) {
        let held = self.last.lock().unwrap().take();
        if let Some(value) = held {
            self.out.next(value);
        }
    }

    fn release(&self) {
        if let Some(registration) = self.registration.lock().unwrap().take() {
            registration.cancel();
        }
    }
}

impl<T: Send + 'static> Publisher<T> for SampleOp<T> {
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Subscription::new(Arc::downgrade(&self) as Weak<dyn Producer>);
        if !self.out.wire(subscriber, subscription) {
            return;
        }
        let me = self.me.clone();
        let registration = self.timer.schedule_periodic(self.period, move || {
            if let Some(op) = me.upgrade() {
                op.emit_window();
            }
        });
        *self.registration.lock().unwrap() = Some(registration);
        let source = self.source.lock().unwrap().take();
        if let Some(source) = source {
            source.subscribe(Arc::clone(&self) as Arc<dyn Subscriber<T>>);
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for SampleOp<T> {
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: T) {
        let replaced = self.last.lock().unwrap().replace(value);
        if replaced.is_some() {
            // The overwritten value will never be emitted.
            self.upstream.request(1);
        }
    }

    fn on_error(&self, error: StreamError) {
        self.upstream.clear();
        self.release();
        self.out.error(error);
    }

    fn on_complete(&self) {
        self.upstream.clear();
        self.release();
        // The window in progress still owes its last value.
        self.emit_window();
        self.out.complete();
    }
}

impl<T: Send + 'static> Producer for SampleOp<T> {
    fn on_request(&self, n: u64) {
        self.upstream.request(n);
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

    fn fast_timer() -> Arc<TimerService> {
        Arc::new(TimerService::with_resolution(Duration::from_millis(5)))
    }

    #[test]
    fn sample_first_takes_the_window_opener() {
        let timer = fast_timer();
        let (broadcaster, stream) = broadcast::<i32>();
        let sink = CollectingSubscriber::unbounded();
        sample_first(stream, Arc::clone(&timer), Duration::from_secs(3600))
            .subscribe(sink.clone_as_subscriber());

        broadcaster.broadcast_next(1);
        broadcaster.broadcast_next(2);
        broadcaster.broadcast_next(3);
        assert_eq!(sink.values(), vec![1]);

        broadcaster.broadcast_complete();
        assert_eq!(sink.completions(), 1);
        timer.shutdown();
    }

    #[test]
    fn sample_first_reopens_on_the_tick() {
        let timer = fast_timer();
        let (broadcaster, stream) = broadcast::<i32>();
        let sink = CollectingSubscriber::unbounded();
        sample_first(stream, Arc::clone(&timer), Duration::from_millis(30))
            .subscribe(sink.clone_as_subscriber());

        broadcaster.broadcast_next(1);
        std::thread::sleep(Duration::from_millis(100));
        broadcaster.broadcast_next(2);
        assert!(sink.await_count(2, Duration::from_secs(2)));
        assert_eq!(sink.values(), vec![1, 2]);
        timer.shutdown();
    }

    #[test]
    fn sample_emits_the_last_of_each_window() {
        let timer = fast_timer();
        let (broadcaster, stream) = broadcast::<i32>();
        let sink = CollectingSubscriber::unbounded();
        sample(stream, Arc::clone(&timer), Duration::from_millis(40))
            .subscribe(sink.clone_as_subscriber());

        broadcaster.broadcast_next(1);
        broadcaster.broadcast_next(2);
        broadcaster.broadcast_next(3);
        assert!(sink.await_count(1, Duration::from_secs(2)));
        assert_eq!(sink.values(), vec![3]);
        timer.shutdown();
    }

    #[test]
    fn sample_flushes_the_held_value_on_complete() {
        let timer = fast_timer();
        let (broadcaster, stream) = broadcast::<i32>();
        let sink = CollectingSubscriber::unbounded();
        sample(stream, Arc::clone(&timer), Duration::from_secs(3600))
            .subscribe(sink.clone_as_subscriber());

        broadcaster.broadcast_next(7);
        broadcaster.broadcast_complete();
        assert_eq!(sink.values(), vec![7]);
        assert_eq!(sink.completions(), 1);
        timer.shutdown();
    }
}
