//! Predicate-based selection.

use std::sync::{Arc, Mutex, Weak};

use rill_core::{
    Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber, Subscription,
    UpstreamCell,
};

use crate::support::guard;

/// Emit only the values for which `predicate` holds. Each discarded
/// value costs the downstream one credit it never sees, so the
/// operator requests one replacement from upstream per drop to keep
/// the pipeline paced.
pub fn filter<T, P>(source: Arc<dyn Publisher<T>>, predicate: P) -> Arc<FilterOp<T, P>>
where
    T: Send + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    Arc::new(FilterOp {
        predicate,
        out: Downstream::new(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
    })
}

/// Operator node for [`filter`].
pub struct FilterOp<T, P> {
    predicate: P,
    out: Downstream<T>,
    upstream: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<T>>>>,
}

impl<T, P> Publisher<T> for FilterOp<T, P>
where
    T: Send + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
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

impl<T, P> Subscriber<T> for FilterOp<T, P>
where
    T: Send + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: T) {
        match guard(|| (self.predicate)(&value)) {
            Ok(true) => self.out.next(value),
            Ok(false) => {
                // Replace the credit consumed by the discarded value.
                self.upstream.request(1);
            }
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

impl<T, P> Producer for FilterOp<T, P>
where
    T: Send + 'static,
    P: Fn(&T) -> bool + Send + Sync + 'static,
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
