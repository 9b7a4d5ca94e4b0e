//! Fan-out: route each input to one of `n` sub-streams.
//!
//! Routing is by key hash modulo `n` when a key function is
//! configured, round-robin otherwise. Each sub-stream paces itself;
//! the operator forwards the *minimum* of the sub-streams' cumulative
//! demands to its upstream, so no sub-stream can be overrun by a
//! faster sibling.
//!
//! A terminal that arrives before a sub-stream has a subscriber parks
//! on that sub-stream's edge and is delivered as soon as the
//! subscriber joins — terminals are not demand-gated.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use smallvec::SmallVec;

use rill_core::{
    Demand, Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber,
    Subscription, UpstreamCell, UNBOUNDED,
};

/// Open `n` round-robin sub-streams over `source`.
///
/// # Panics
///
/// Panics if `n` is zero.
pub fn partition<T>(source: Arc<dyn Publisher<T>>, n: usize) -> Vec<Arc<dyn Publisher<T>>>
where
    T: Send + 'static,
{
    create(source, n, None)
}

/// Open `n` sub-streams over `source`, routing by `key(v) % n`.
///
/// # Panics
///
/// Panics if `n` is zero.
pub fn partition_by<T, K>(
    source: Arc<dyn Publisher<T>>,
    n: usize,
    key: K,
) -> Vec<Arc<dyn Publisher<T>>>
where
    T: Send + 'static,
    K: Fn(&T) -> u64 + Send + Sync + 'static,
{
    create(source, n, Some(Box::new(key)))
}

type KeyFn<T> = Box<dyn Fn(&T) -> u64 + Send + Sync>;

fn create<T>(
    source: Arc<dyn Publisher<T>>,
    n: usize,
    key: Option<KeyFn<T>>,
) -> Vec<Arc<dyn Publisher<T>>>
where
    T: Send + 'static,
{
    assert!(n > 0, "partition needs at least one sub-stream");
    let op = Arc::new_cyclic(|me: &Weak<PartitionOp<T>>| PartitionOp {
        inners: (0..n)
            .map(|_| {
                Arc::new(PartitionEdge {
                    out: Downstream::new(),
                    issued: Demand::new(),
                    parent: me.clone(),
                })
            })
            .collect(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
        key,
        round_robin: AtomicU64::new(0),
        granted: Mutex::new(0),
        started: AtomicBool::new(false),
    });
    op.inners
        .iter()
        .map(|edge| Arc::clone(edge) as Arc<dyn Publisher<T>>)
        .collect()
}

/// Shared fan-out node behind the sub-stream publishers.
struct PartitionOp<T> {
    inners: SmallVec<[Arc<PartitionEdge<T>>; 4]>,
    upstream: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<T>>>>,
    key: Option<KeyFn<T>>,
    round_robin: AtomicU64,
    /// Demand already forwarded upstream; guarded so the min
    /// computation and the forward are one step.
    granted: Mutex<u64>,
    started: AtomicBool,
}

impl<T: Send + 'static> PartitionOp<T> {
    fn ensure_started(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let source = self.source.lock().unwrap().take();
        if let Some(source) = source {
            source.subscribe(Arc::clone(self) as Arc<dyn Subscriber<T>>);
        }
    }

    /// Forward `min(per-sub-stream cumulative demand) - granted` to
    /// the upstream. Cancelled sub-streams no longer bound the min; if
    /// none are left the upstream is cancelled too.
    fn recompute_demand(&self) {
        let mut granted = self.granted.lock().unwrap();
        let live: SmallVec<[u64; 4]> = self
            .inners
            .iter()
            .filter(|edge| edge.out.active())
            .map(|edge| edge.issued.current())
            .collect();
        if live.is_empty() {
            drop(granted);
            self.upstream.cancel();
            return;
        }
        let floor = live.iter().copied().min().expect("non-empty");
        if floor > *granted {
            let delta = if floor == UNBOUNDED {
                UNBOUNDED
            } else {
                floor - *granted
            };
            *granted = floor;
            drop(granted);
            self.upstream.request(delta);
        }
    }

    fn route(&self, value: &T) -> usize {
        let n = self.inners.len() as u64;
        let slot = match &self.key {
            Some(key) => key(value) % n,
            None => self.round_robin.fetch_add(1, Ordering::Relaxed) % n,
        };
        slot as usize
    }
}

impl<T: Send + 'static> Subscriber<T> for PartitionOp<T> {
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: T) {
        let index = self.route(&value);
        self.inners[index].out.next(value);
    }

    fn on_error(&self, error: StreamError) {
        self.upstream.clear();
        for edge in &self.inners {
            edge.out.error(error.clone());
        }
    }

    fn on_complete(&self) {
        self.upstream.clear();
        for edge in &self.inners {
            edge.out.complete();
        }
    }
}

/// One sub-stream of a partition.
struct PartitionEdge<T> {
    out: Downstream<T>,
    /// Cumulative demand requested by this sub-stream's subscriber.
    issued: Demand,
    parent: Weak<PartitionOp<T>>,
}

impl<T: Send + 'static> Publisher<T> for PartitionEdge<T> {
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Subscription::new(Arc::downgrade(&self) as Weak<dyn Producer>);
        if !self.out.wire(subscriber, subscription) {
            return;
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.ensure_started();
        }
    }
}

impl<T: Send + 'static> Producer for PartitionEdge<T> {
    fn on_request(&self, n: u64) {
        self.issued.add(n);
        if let Some(parent) = self.parent.upgrade() {
            parent.recompute_demand();
        }
        self.out.drain();
    }

    fn on_cancel(&self) {
        self.out.cancelled();
        if let Some(parent) = self.parent.upgrade() {
            parent.recompute_demand();
        }
    }

    fn on_invalid_request(&self) {
        self.out.error(StreamError::Protocol(ProtocolError::ZeroRequest));
    }
}
