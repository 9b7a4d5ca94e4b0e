//! Fan-in over mapped inner publishers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rill_core::{
    Demand, Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber,
    Subscription, UpstreamCell,
};

use crate::support::guard;

/// For each input value, subscribe to `f(value)` and merge the inner
/// streams' values downstream. Completion requires the outer stream
/// and every inner stream to complete; any error cancels everything
/// else and propagates.
pub fn flat_map<I, O, F>(source: Arc<dyn Publisher<I>>, f: F) -> Arc<FlatMapOp<I, O, F>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Arc<dyn Publisher<O>> + Send + Sync + 'static,
{
    Arc::new_cyclic(|me| FlatMapOp {
        f,
        outer: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
        inners: Mutex::new(Vec::new()),
        // One token for the outer stream itself.
        active: AtomicUsize::new(1),
        failed: AtomicBool::new(false),
        started: AtomicBool::new(false),
        requested: Demand::new(),
        out: Downstream::new(),
        me: me.clone(),
    })
}

/// Operator node for [`flat_map`].
///
/// The outer stream is consumed one element at a time: each consumed
/// outer value re-credits the outer upstream, so outer pacing is
/// independent of downstream demand (which gates the merged inner
/// values instead).
pub struct FlatMapOp<I, O, F> {
    f: F,
    outer: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<I>>>>,
    inners: Mutex<Vec<Arc<FlatMapInner<O>>>>,
    active: AtomicUsize,
    failed: AtomicBool,
    started: AtomicBool,
    /// Cumulative downstream demand, granted to inners that join late.
    requested: Demand,
    out: Downstream<O>,
    me: Weak<Self>,
}

/// Callbacks an inner edge routes back to its owning fan-in node,
/// erased over the outer element and mapping types.
trait InnerParent<O>: Send + Sync {
    fn inner_next(&self, value: O);
    fn inner_error(&self, inner: &FlatMapInner<O>, error: StreamError);
    fn inner_complete(&self, inner: &FlatMapInner<O>);
}

impl<I, O, F> FlatMapOp<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Arc<dyn Publisher<O>> + Send + Sync + 'static,
{
    fn cancel_all(&self) {
        self.outer.cancel();
        let inners = std::mem::take(&mut *self.inners.lock().unwrap());
        for inner in inners {
            inner.upstream.cancel();
        }
    }

    fn leave(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.out.complete();
        }
    }
}

impl<I, O, F> Publisher<O> for FlatMapOp<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Arc<dyn Publisher<O>> + Send + Sync + 'static,
{
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<O>>) {
        let subscription = Subscription::new(Arc::downgrade(&self) as Weak<dyn Producer>);
        if !self.out.wire(subscriber, subscription) {
            return;
        }
        let source = self.source.lock().unwrap().take();
        if let Some(source) = source {
            source.subscribe(Arc::clone(&self) as Arc<dyn Subscriber<I>>);
        }
    }
}

impl<I, O, F> Subscriber<I> for FlatMapOp<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Arc<dyn Publisher<O>> + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.outer.set(subscription);
    }

    fn on_next(&self, value: I) {
        let publisher = match guard(|| (self.f)(value)) {
            Ok(publisher) => publisher,
            Err(error) => {
                self.cancel_all();
                self.out.error(error);
                return;
            }
        };
        let me: Weak<dyn InnerParent<O>> = self.me.clone();
        let inner = Arc::new(FlatMapInner {
            parent: me,
            upstream: UpstreamCell::new(),
        });
        self.active.fetch_add(1, Ordering::AcqRel);
        self.inners.lock().unwrap().push(Arc::clone(&inner));
        let credit = self.requested.current();
        if credit > 0 {
            inner.upstream.request(credit);
        }
        publisher.subscribe(inner as Arc<dyn Subscriber<O>>);
        // Pull the next outer element.
        self.outer.request(1);
    }

    fn on_error(&self, error: StreamError) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            self.cancel_all();
            self.out.error(error);
        }
    }

    fn on_complete(&self) {
        self.outer.clear();
        self.leave();
    }
}

impl<I, O, F> InnerParent<O> for FlatMapOp<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Arc<dyn Publisher<O>> + Send + Sync + 'static,
{
    fn inner_next(&self, value: O) {
        self.out.next(value);
    }

    fn inner_error(&self, inner: &FlatMapInner<O>, error: StreamError) {
        inner.upstream.clear();
        if !self.failed.swap(true, Ordering::AcqRel) {
            self.cancel_all();
            self.out.error(error);
        }
    }

    fn inner_complete(&self, inner: &FlatMapInner<O>) {
        inner.upstream.clear();
        self.inners
            .lock()
            .unwrap()
            .retain(|candidate| !std::ptr::eq(candidate.as_ref(), inner));
        self.leave();
    }
}

impl<I, O, F> Producer for FlatMapOp<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Arc<dyn Publisher<O>> + Send + Sync + 'static,
{
    fn on_request(&self, n: u64) {
        self.requested.add(n);
        if !self.started.swap(true, Ordering::AcqRel) {
            self.outer.request(1);
        }
        let inners = self.inners.lock().unwrap().clone();
        for inner in inners {
            inner.upstream.request(n);
        }
        self.out.drain();
    }

    fn on_cancel(&self) {
        self.cancel_all();
        self.out.cancelled();
    }

    fn on_invalid_request(&self) {
        self.cancel_all();
        self.out.error(StreamError::Protocol(ProtocolError::ZeroRequest));
    }
}

/// One inner edge of a flat-map.
struct FlatMapInner<O> {
    parent: Weak<dyn InnerParent<O>>,
    upstream: UpstreamCell,
}

impl<O: Send + 'static> Subscriber<O> for FlatMapInner<O> {
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: O) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_next(value);
        }
    }

    fn on_error(&self, error: StreamError) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_error(self, error);
        }
    }

    fn on_complete(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.inner_complete(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{just, range};
    use rill_test_utils::CollectingSubscriber;

    #[test]
    fn maps_each_value_to_a_stream_and_merges() {
        let sink = CollectingSubscriber::unbounded();
        flat_map(range(0, 3), |v| {
            just(vec![v * 10, v * 10 + 1]) as Arc<dyn Publisher<i64>>
        })
        .subscribe(sink.clone_as_subscriber());

        let mut values = sink.values();
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 10, 11, 20, 21]);
        assert_eq!(sink.completions(), 1);
    }

    #[test]
    fn completes_only_after_outer_and_inners() {
        use crate::broadcast::broadcast;
        let (inner_publisher, inner_stream) = broadcast::<i64>();
        let sink = CollectingSubscriber::unbounded();
        flat_map(range(0, 1), move |_| Arc::clone(&inner_stream))
            .subscribe(sink.clone_as_subscriber());

        // Outer completed, inner still open.
        assert_eq!(sink.completions(), 0);
        inner_publisher.broadcast_next(5);
        inner_publisher.broadcast_complete();
        assert_eq!(sink.values(), vec![5]);
        assert_eq!(sink.completions(), 1);
    }

    #[test]
    fn inner_error_cancels_everything() {
        let sink = CollectingSubscriber::unbounded();
        flat_map(range(0, 5), |v| {
            if v == 1 {
                crate::map::map(just(vec![0i64]), |_| -> i64 { panic!("inner failure") })
                    as Arc<dyn Publisher<i64>>
            } else {
                just(vec![v]) as Arc<dyn Publisher<i64>>
            }
        })
        .subscribe(sink.clone_as_subscriber());

        assert_eq!(sink.errors().len(), 1);
        assert_eq!(sink.completions(), 0);
    }

    #[test]
    fn empty_outer_completes() {
        let sink = CollectingSubscriber::unbounded();
        flat_map(range(0, 0), |v| just(vec![v]) as Arc<dyn Publisher<i64>>)
            .subscribe(sink.clone_as_subscriber());
        assert_eq!(sink.completions(), 1);
        assert!(sink.values().is_empty());
    }
}
