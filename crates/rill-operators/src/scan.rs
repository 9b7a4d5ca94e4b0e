//! Running fold.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rill_core::{
    Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber, Subscription,
    UpstreamCell,
};

use crate::support::guard;

/// For each input `v`, emit `acc = f(acc, v)`. The seed itself is not
/// emitted; see [`scan_with_seed`] for the variant that leads with it.
pub fn scan<I, A, F>(source: Arc<dyn Publisher<I>>, seed: A, f: F) -> Arc<ScanOp<I, A, F>>
where
    I: Send + 'static,
    A: Clone + Send + 'static,
    F: Fn(A, I) -> A + Send + Sync + 'static,
{
    new_scan(source, seed, f, false)
}

/// Like [`scan`], but the seed is emitted as the first value.
pub fn scan_with_seed<I, A, F>(source: Arc<dyn Publisher<I>>, seed: A, f: F) -> Arc<ScanOp<I, A, F>>
where
    I: Send + 'static,
    A: Clone + Send + 'static,
    F: Fn(A, I) -> A + Send + Sync + 'static,
{
    new_scan(source, seed, f, true)
}

fn new_scan<I, A, F>(
    source: Arc<dyn Publisher<I>>,
    seed: A,
    f: F,
    emit_seed: bool,
) -> Arc<ScanOp<I, A, F>>
where
    I: Send + 'static,
    A: Clone + Send + 'static,
    F: Fn(A, I) -> A + Send + Sync + 'static,
{
    Arc::new(ScanOp {
        f,
        acc: Mutex::new(seed),
        emit_seed,
        seed_emitted: AtomicBool::new(false),
        out: Downstream::new(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
    })
}

/// Operator node for [`scan`].
///
/// The accumulator is guarded by a per-operator mutex; behind an
/// ordered dispatcher the lock is uncontended.
pub struct ScanOp<I, A, F> {
    f: F,
    acc: Mutex<A>,
    emit_seed: bool,
    seed_emitted: AtomicBool,
    out: Downstream<A>,
    upstream: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<I>>>>,
}

impl<I, A, F> Publisher<A> for ScanOp<I, A, F>
where
    I: Send + 'static,
    A: Clone + Send + 'static,
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

impl<I, A, F> Subscriber<I> for ScanOp<I, A, F>
where
    I: Send + 'static,
    A: Clone + Send + 'static,
    F: Fn(A, I) -> A + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: I) {
        let emitted = {
            let mut acc = self.acc.lock().unwrap();
            match guard(|| (self.f)(acc.clone(), value)) {
                Ok(next) => {
                    *acc = next.clone();
                    Ok(next)
                }
                Err(error) => Err(error),
            }
        };
        match emitted {
            Ok(next) => self.out.next(next),
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

impl<I, A, F> Producer for ScanOp<I, A, F>
where
    I: Send + 'static,
    A: Clone + Send + 'static,
    F: Fn(A, I) -> A + Send + Sync + 'static,
{
    fn on_request(&self, n: u64) {
        let mut forward = n;
        if self.emit_seed && !self.seed_emitted.swap(true, Ordering::AcqRel) {
            // The seed consumes the first credit of the first request.
            let seed = self.acc.lock().unwrap().clone();
            self.out.next(seed);
            forward = n.saturating_sub(1);
        }
        if forward > 0 {
            self.upstream.request(forward);
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
