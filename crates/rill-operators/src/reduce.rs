//! Terminal and batch-boundary folds.

use std::sync::{Arc, Mutex, Weak};

use rill_core::{
    Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber, Subscription,
    UpstreamCell, UNBOUNDED,
};

use crate::support::guard;

/// Fold the whole stream and emit the result on `Complete`. Empty
/// input emits nothing: the accumulator is only materialized when the
/// first value arrives.
pub fn reduce<I, A, F>(source: Arc<dyn Publisher<I>>, seed: A, f: F) -> Arc<ReduceOp<I, A, F>>
where
    I: Send + 'static,
    A: Clone + Send + 'static,
    F: Fn(A, I) -> A + Send + Sync + 'static,
{
    new_reduce(source, seed, f, None)
}

/// Fold in batches: emit and reset the accumulator every `batch_size`
/// inputs and once more at `Complete` for a partial tail.
///
/// # Panics
///
/// Panics if `batch_size` is zero.
pub fn reduce_every<I, A, F>(
    source: Arc<dyn Publisher<I>>,
    batch_size: usize,
    seed: A,
    f: F,
) -> Arc<ReduceOp<I, A, F>>
where
    I: Send + 'static,
    A: Clone + Send + 'static,
    F: Fn(A, I) -> A + Send + Sync + 'static,
{
    assert!(batch_size > 0, "reduce batch size must be at least 1");
    new_reduce(source, seed, f, Some(batch_size))
}

fn new_reduce<I, A, F>(
    source: Arc<dyn Publisher<I>>,
    seed: A,
    f: F,
    batch_size: Option<usize>,
) -> Arc<ReduceOp<I, A, F>>
where
    I: Send + 'static,
    A: Clone + Send + 'static,
    F: Fn(A, I) -> A + Send + Sync + 'static,
{
    Arc::new(ReduceOp {
        f,
        seed,
        batch_size,
        state: Mutex::new(FoldState {
            acc: None,
            count: 0,
        }),
        out: Downstream::new(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
    })
}

struct FoldState<A> {
    acc: Option<A>,
    count: usize,
}

/// Operator node for [`reduce`] and [`reduce_every`].
pub struct ReduceOp<I, A, F> {
    f: F,
    seed: A,
    batch_size: Option<usize>,
    state: Mutex<FoldState<A>>,
    out: Downstream<A>,
    upstream: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<I>>>>,
}

impl<I, A, F> ReduceOp<I, A, F>
where
    I: Send + 'static,
    A: Clone + Send + 'static,
    F: Fn(A, I) -> A + Send + Sync + 'static,
{
    fn flush(&self) {
        let flushed = {
            let mut state = self.state.lock().unwrap();
            state.count = 0;
            state.acc.take()
        };
        if let Some(acc) = flushed {
            self.out.next(acc);
        }
    }
}

impl<I, A, F> Publisher<A> for ReduceOp<I, A, F>
where
    I: Send + 'static,
    A: Clone + Send + Sync + 'static,
    F: Fn(A, I) -> A + Send + Sync + 'static,
{
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<A>>) {
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

impl<I, A, F> Subscriber<I> for ReduceOp<I, A, F>
where
    I: Send + 'static,
    A: Clone + Send + Sync + 'static,
    F: Fn(A, I) -> A + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: I) {
        let boundary = {
            let mut state = self.state.lock().unwrap();
            let acc = state.acc.take().unwrap_or_else(|| self.seed.clone());
            match guard(|| (self.f)(acc, value)) {
                Ok(next) => {
                    state.acc = Some(next);
                    state.count += 1;
                    self.batch_size.is_some_and(|size| state.count >= size)
                }
                Err(error) => {
                    drop(state);
                    self.upstream.cancel();
                    self.out.error(error);
                    return;
                }
            }
        };
        if boundary {
            self.flush();
        }
    }

    fn on_error(&self, error: StreamError) {
        self.upstream.clear();
        self.out.error(error);
    }

    fn on_complete(&self) {
        self.upstream.clear();
        self.flush();
        self.out.complete();
    }
}

impl<I, A, F> Producer for ReduceOp<I, A, F>
where
    I: Send + 'static,
    A: Clone + Send + Sync + 'static,
    F: Fn(A, I) -> A + Send + Sync + 'static,
{
    fn on_request(&self, n: u64) {
        match self.batch_size {
            // Terminal fold: the whole input produces one value, so
            // the upstream can flow freely once anything is requested.
            None => self.upstream.request(UNBOUNDED),
            Some(size) => self.upstream.request(n.saturating_mul(size as u64)),
        }
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
