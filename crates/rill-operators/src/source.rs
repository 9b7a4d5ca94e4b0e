//! Cold, demand-driven sources.
//!
//! A cold source starts a fresh emission chain per subscribe: the
//! backing collection is cloned into an iterator owned by a dedicated
//! emitter node. The emitter only pulls from the iterator while the
//! downstream has credit, so an arbitrarily large source never buffers
//! more than the subscriber asked for.

use std::iter::Peekable;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rill_core::{
    Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber, Subscription,
};

/// Cold source over a cloneable collection.
pub struct IterSource<C> {
    collection: C,
}

/// A finite cold source of the given values followed by `Complete`.
pub fn just<T>(values: Vec<T>) -> Arc<IterSource<Vec<T>>>
where
    T: Clone + Send + Sync + 'static,
{
    from_iter(values)
}

/// Cold source over any cloneable iterable.
pub fn from_iter<C>(collection: C) -> Arc<IterSource<C>>
where
    C: IntoIterator + Clone + Send + Sync + 'static,
    C::Item: Send + 'static,
    C::IntoIter: Send + 'static,
{
    Arc::new(IterSource { collection })
}

/// Integer source: `start, start + 1, ..., start + count - 1`.
pub fn range(start: i64, count: u64) -> Arc<IterSource<std::ops::Range<i64>>> {
    from_iter(start..start + count as i64)
}

impl<C> Publisher<C::Item> for IterSource<C>
where
    C: IntoIterator + Clone + Send + Sync + 'static,
    C::Item: Send + 'static,
    C::IntoIter: Send + 'static,
{
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<C::Item>>) {
        let emitter = Arc::new(IterEmitter {
            iter: Mutex::new(self.collection.clone().into_iter().peekable()),
            out: Downstream::new(),
            wip: AtomicU64::new(0),
        });
        let subscription =
            Subscription::new(Arc::downgrade(&emitter) as Weak<dyn Producer>);
        if emitter.out.wire(subscriber, subscription) {
            // An already-empty source completes without waiting for
            // demand; otherwise the initial pump is a no-op until the
            // first request arrives.
            emitter.pump();
        }
    }
}

/// Per-subscriber emission state for an [`IterSource`].
struct IterEmitter<I: Iterator> {
    iter: Mutex<Peekable<I>>,
    out: Downstream<I::Item>,
    wip: AtomicU64,
}

impl<I> IterEmitter<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    /// Pull-and-emit loop. The wip counter makes reentrant `request`
    /// calls (issued from inside `on_next`) iterative instead of
    /// recursive.
    fn pump(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed: u64 = 1;
        loop {
            loop {
                if !self.out.active() {
                    break;
                }
                let mut iter = self.iter.lock().unwrap();
                if iter.peek().is_none() {
                    drop(iter);
                    self.out.complete();
                    break;
                }
                if self.out.credit() == 0 {
                    break;
                }
                let value = iter.next().expect("peeked element present");
                drop(iter);
                self.out.next(value);
            }
            let previous = self.wip.fetch_sub(missed, Ordering::AcqRel);
            if previous == missed {
                break;
            }
            missed = previous - missed;
        }
    }
}

impl<I> Producer for IterEmitter<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    fn on_request(&self, _n: u64) {
        self.pump();
    }

    fn on_cancel(&self) {
        self.out.cancelled();
    }

    fn on_invalid_request(&self) {
        self.out.error(StreamError::Protocol(ProtocolError::ZeroRequest));
    }
}
