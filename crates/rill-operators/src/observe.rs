//! Side-effect tap: element pass-through.

use std::sync::{Arc, Mutex, Weak};

use rill_core::{
    Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber, Subscription,
    UpstreamCell,
};

use crate::support::guard;

/// Invoke `callback` for each value, then pass the value through
/// unchanged. A panicking callback is wrapped and surfaced as
/// `Error(User)`.
pub fn observe<T, C>(source: Arc<dyn Publisher<T>>, callback: C) -> Arc<ObserveOp<T, C>>
where
    T: Send + 'static,
    C: Fn(&T) + Send + Sync + 'static,
{
    Arc::new(ObserveOp {
        callback,
        out: Downstream::new(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
    })
}

/// Operator node for [`observe`].
pub struct ObserveOp<T, C> {
    callback: C,
    out: Downstream<T>,
    upstream: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<T>>>>,
}

impl<T, C> Publisher<T> for ObserveOp<T, C>
where
    T: Send + 'static,
    C: Fn(&T) + Send + Sync + 'static,
{
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

impl<T, C> Subscriber<T> for ObserveOp<T, C>
where
    T: Send + 'static,
    C: Fn(&T) + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: T) {
        match guard(|| (self.callback)(&value)) {
            Ok(()) => self.out.next(value),
            Err(error) => {
                self.upstream.cancel();
                self.out.error(error);
            }
        }
    }

    fn on_error(&self, error: StreamError) {
        self.upstream.clear();
        self.out.error(error);
    }

    fn on_complete(&self) {
        self.upstream.clear();
        self.out.complete();
    }
}

impl<T, C> Producer for ObserveOp<T, C>
where
    T: Send + 'static,
    C: Fn(&T) + Send + Sync + 'static,
{
    fn on_request(&self, n: u64) {
        self.upstream.request(n);
        self.out.drain();
    }

    fn on_cancel(&self) {
        self.upstream.cancel();
        self.out.cancelled();
    }

    fn on_invalid_request(&self) {
        self.upstream.cancel();
        self.out.error(StreamError::Protocol(ProtocolError::ZeroRequest));
    }
}
