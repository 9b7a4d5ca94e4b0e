//! Pure per-value transform.

use std::sync::{Arc, Mutex, Weak};

use rill_core::{
    Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber, Subscription,
};

use crate::support::guard;

/// Apply `f` to each `Next`. A panicking `f` is caught at the operator
/// barrier, surfaced downstream as `Error(User)`, and cancels the
/// upstream.
pub fn map<I, O, F>(source: Arc<dyn Publisher<I>>, f: F) -> Arc<MapOp<I, O, F>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
{
    Arc::new(MapOp {
        f,
        out: Downstream::new(),
        upstream: rill_core::UpstreamCell::new(),
        source: Mutex::new(Some(source)),
    })
}

/// Operator node for [`map`].
pub struct MapOp<I, O, F> {
    f: F,
    out: Downstream<O>,
    upstream: rill_core::UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<I>>>>,
}

impl<I, O, F> Publisher<O> for MapOp<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
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

impl<I, O, F> Subscriber<I> for MapOp<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: I) {
        match guard(|| (self.f)(value)) {
            Ok(mapped) => self.out.next(mapped),
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

impl<I, O, F> Producer for MapOp<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
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

/// Apply a fallible function to each `Next`. An `Err` is wrapped as
/// `Error(User)` downstream and cancels the upstream, preserving the
/// error's concrete type for [`when`](crate::when()) handlers.
pub fn try_map<I, O, E, F>(source: Arc<dyn Publisher<I>>, f: F) -> Arc<TryMapOp<I, O, E, F>>
where
    I: Send + 'static,
    O: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
{
    Arc::new(TryMapOp {
        f,
        out: Downstream::new(),
        upstream: rill_core::UpstreamCell::new(),
        source: Mutex::new(Some(source)),
        _marker: std::marker::PhantomData,
    })
}

/// Operator node for [`try_map`].
pub struct TryMapOp<I, O, E, F> {
    f: F,
    out: Downstream<O>,
    upstream: rill_core::UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<I>>>>,
    _marker: std::marker::PhantomData<fn() -> E>,
}

impl<I, O, E, F> Publisher<O> for TryMapOp<I, O, E, F>
where
    I: Send + 'static,
    O: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
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

impl<I, O, E, F> Subscriber<I> for TryMapOp<I, O, E, F>
where
    I: Send + 'static,
    O: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: I) {
        match guard(|| (self.f)(value)) {
            Ok(Ok(mapped)) => self.out.next(mapped),
            Ok(Err(error)) => {
                self.upstream.cancel();
                self.out.error(StreamError::user(error));
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

impl<I, O, E, F> Producer for TryMapOp<I, O, E, F>
where
    I: Send + 'static,
    O: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::just;
    use rill_test_utils::CollectingSubscriber;

    #[test]
    fn maps_each_value() {
        let sink = CollectingSubscriber::unbounded();
        map(just(vec!["1", "2", "3"]), |s: &str| s.parse::<i32>().unwrap())
            .subscribe(sink.clone_as_subscriber());
        assert_eq!(sink.values(), vec![1, 2, 3]);
        assert_eq!(sink.completions(), 1);
    }

    #[test]
    fn panicking_function_becomes_user_error() {
        let sink = CollectingSubscriber::unbounded();
        map(just(vec!["1", "x", "3"]), |s: &str| s.parse::<i32>().unwrap())
            .subscribe(sink.clone_as_subscriber());
        assert_eq!(sink.values(), vec![1]);
        let errors = sink.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], StreamError::User(_)));
        assert_eq!(sink.completions(), 0);
    }

    #[test]
    fn demand_flows_through_unchanged() {
        let sink = CollectingSubscriber::with_demand(2);
        map(crate::source::range(0, 100), |v| v * 10).subscribe(sink.clone_as_subscriber());
        assert_eq!(sink.values(), vec![0, 10]);
        sink.request(1);
        assert_eq!(sink.values(), vec![0, 10, 20]);
    }

    #[test]
    fn try_map_preserves_the_error_type() {
        let sink = CollectingSubscriber::unbounded();
        try_map(just(vec!["1", "x"]), |s: &str| s.parse::<i32>())
            .subscribe(sink.clone_as_subscriber());
        assert_eq!(sink.values(), vec![1]);
        let errors = sink.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0]
            .user_error::<std::num::ParseIntError>()
            .is_some());
    }

    #[test]
    fn composed_maps_fuse() {
        // map(g) . map(f) must equal map(g . f) on the emitted sequence.
        let fused = CollectingSubscriber::unbounded();
        map(crate::source::range(1, 5), |v| (v * 2) + 1).subscribe(fused.clone_as_subscriber());

        let composed = CollectingSubscriber::unbounded();
        map(map(crate::source::range(1, 5), |v| v * 2), |v| v + 1)
            .subscribe(composed.clone_as_subscriber());

        assert_eq!(fused.values(), composed.values());
    }
}
