//! Fan-in: interleave several publishers into one stream.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rill_core::{
    Demand, Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber,
    Subscription, UpstreamCell,
};

/// Subscribe to all `sources` and interleave their values in arrival
/// order. Completes after every input completed; the first error
/// cancels the remaining inputs and propagates. Zero sources complete
/// immediately.
pub fn merge<T>(sources: Vec<Arc<dyn Publisher<T>>>) -> Arc<MergeOp<T>>
where
    T: Send + 'static,
{
    Arc::new_cyclic(|me| MergeOp {
        sources: Mutex::new(Some(sources)),
        inners: Mutex::new(Vec::new()),
        active: AtomicUsize::new(0),
        failed: AtomicBool::new(false),
        requested: Demand::new(),
        out: Downstream::new(),
        me: me.clone(),
    })
}

/// Operator node for [`merge`].
///
/// Concurrent emitters are serialized by the downstream edge's
/// trampoline; values keep their arrival order.
pub struct MergeOp<T> {
    sources: Mutex<Option<Vec<Arc<dyn Publisher<T>>>>>,
    inners: Mutex<Vec<Arc<MergeInner<T>>>>,
    active: AtomicUsize,
    failed: AtomicBool,
    /// Cumulative downstream demand; inputs that join after demand was
    /// issued are credited retroactively.
    requested: Demand,
    out: Downstream<T>,
    me: Weak<Self>,
}

impl<T: Send + 'static> MergeOp<T> {
    fn inner_complete(&self, inner: &MergeInner<T>) {
        inner.upstream.clear();
        self.inners
            .lock()
            .unwrap()
            .retain(|candidate| !std::ptr::eq(candidate.as_ref(), inner));
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.out.complete();
        }
    }

    fn inner_error(&self, inner: &MergeInner<T>, error: StreamError) {
        inner.upstream.clear();
        if !self.failed.swap(true, Ordering::AcqRel) {
            self.cancel_inners();
            self.out.error(error);
        }
    }

    fn cancel_inners(&self) {
        let inners = std::mem::take(&mut *self.inners.lock().unwrap());
        for inner in inners {
            inner.upstream.cancel();
        }
    }
}

impl<T: Send + 'static> Publisher<T> for MergeOp<T> {
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Subscription::new(Arc::downgrade(&self) as Weak<dyn Producer>);
        if !self.out.wire(subscriber, subscription) {
            return;
        }
        let sources = self.sources.lock().unwrap().take();
        let Some(sources) = sources else {
            return;
        };
        if sources.is_empty() {
            self.out.complete();
            return;
        }
        self.active.store(sources.len(), Ordering::Release);
        for source in sources {
            let inner = Arc::new(MergeInner {
                parent: self.me.clone(),
                upstream: UpstreamCell::new(),
            });
            self.inners.lock().unwrap().push(Arc::clone(&inner));
            // Demand issued before this input joined is parked in the
            // cell and flushed once the input's subscription arrives.
            let credit = self.requested.current();
            if credit > 0 {
                inner.upstream.request(credit);
            }
            source.subscribe(inner as Arc<dyn Subscriber<T>>);
        }
    }
}

impl<T: Send + 'static> Producer for MergeOp<T> {
    fn on_request(&self, n: u64) {
        self.requested.add(n);
        let inners = self.inners.lock().unwrap().clone();
        for inner in inners {
            inner.upstream.request(n);
        }
        self.out.drain();
    }

    fn on_cancel(&self) {
        self.cancel_inners();
        self.out.cancelled();
    }

    fn on_invalid_request(&self) {
        self.cancel_inners();
        self.out.error(StreamError::Protocol(ProtocolError::ZeroRequest));
    }
}

/// One input edge of a merge.
struct MergeInner<T> {
    parent: Weak<MergeOp<T>>,
    upstream: UpstreamCell,
}

impl<T: Send + 'static> Subscriber<T> for MergeInner<T> {
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: T) {
        if let Some(parent) = self.parent.upgrade() {
            parent.out.next(value);
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
    use crate::reduce::reduce;
    use crate::source::{just, range};
    use rill_test_utils::CollectingSubscriber;

    #[test]
    fn interleaves_and_completes_after_all_inputs() {
        let sink = CollectingSubscriber::unbounded();
        merge(vec![
            just(vec![1, 2]) as Arc<dyn Publisher<i32>>,
            just(vec![3, 4, 5]) as Arc<dyn Publisher<i32>>,
        ])
        .subscribe(sink.clone_as_subscriber());

        let mut values = sink.values();
        values.sort_unstable();
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert_eq!(sink.completions(), 1);
    }

    #[test]
    fn merged_product_reduces_to_120() {
        let sink = CollectingSubscriber::unbounded();
        let merged = merge(vec![
            just(vec![1i64, 2]) as Arc<dyn Publisher<i64>>,
            just(vec![3i64, 4, 5]) as Arc<dyn Publisher<i64>>,
        ]);
        reduce(merged, 1i64, |acc, v| acc * v).subscribe(sink.clone_as_subscriber());
        assert_eq!(sink.values(), vec![120]);
        assert_eq!(sink.completions(), 1);
    }

    #[test]
    fn zero_sources_complete_immediately() {
        let sink = CollectingSubscriber::unbounded();
        merge(Vec::<Arc<dyn Publisher<i32>>>::new()).subscribe(sink.clone_as_subscriber());
        assert_eq!(sink.completions(), 1);
    }

    #[test]
    fn first_error_cancels_the_rest() {
        use crate::broadcast::broadcast;
        let (failing, failing_stream) = broadcast::<i32>();
        let (healthy, healthy_stream) = broadcast::<i32>();

        let sink = CollectingSubscriber::unbounded();
        merge(vec![failing_stream, healthy_stream]).subscribe(sink.clone_as_subscriber());

        healthy.broadcast_next(1);
        failing.broadcast_error(StreamError::IllegalArgument("input failed".into()));
        healthy.broadcast_next(2);

        assert_eq!(sink.values(), vec![1]);
        assert_eq!(sink.errors().len(), 1);
        assert_eq!(sink.completions(), 0);
        // The healthy input lost its subscriber when the merge failed.
        assert_eq!(healthy.subscriber_count(), 0);
    }

    #[test]
    fn demand_reaches_every_input() {
        let sink = CollectingSubscriber::with_demand(4);
        merge(vec![
            range(0, 2) as Arc<dyn Publisher<i64>>,
            range(10, 2) as Arc<dyn Publisher<i64>>,
        ])
        .subscribe(sink.clone_as_subscriber());
        let mut values = sink.values();
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 10, 11]);
    }
}
