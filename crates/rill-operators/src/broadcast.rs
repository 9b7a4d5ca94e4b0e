//! Hot source/sink: push signals into all current subscribers.
//!
//! A [`Broadcaster`] emits regardless of subscribers; new subscribers
//! see only signals pushed after they joined (no replay), except that
//! a broadcaster which already terminated delivers its terminal to
//! late joiners so every edge still ends exactly once.
//!
//! The subscriber list is copy-on-write: subscribe and cancel replace
//! an `Arc` snapshot under a short lock, and emission iterates a
//! snapshot with no lock held.

use std::sync::{Arc, Mutex, Weak};

use smallvec::SmallVec;

use rill_core::{
    Downstream, OverflowAction, Producer, ProtocolError, Publisher, StreamError, Subscriber,
    Subscription,
};

/// Default pending-queue bound for one subscriber edge. A hot producer
/// does not honor demand, so a slow consumer's edge buffers up to this
/// many values before the overflow action applies.
pub const DEFAULT_EDGE_CAPACITY: usize = 1024;

type EdgeList<T> = SmallVec<[Arc<BroadcastEdge<T>>; 4]>;

#[derive(Clone)]
enum Terminal {
    Error(StreamError),
    Complete,
}

struct BroadcastInner<T> {
    edges: Arc<EdgeList<T>>,
    terminal: Option<Terminal>,
}

/// Create a hot broadcaster and its publisher face.
pub fn broadcast<T>() -> (Arc<Broadcaster<T>>, Arc<dyn Publisher<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    let broadcaster = Broadcaster::new();
    let publisher = Arc::clone(&broadcaster) as Arc<dyn Publisher<T>>;
    (broadcaster, publisher)
}

/// Hot stream head. Also usable as a sink from any thread.
pub struct Broadcaster<T> {
    inner: Mutex<BroadcastInner<T>>,
    edge_capacity: usize,
    on_full: OverflowAction,
}

impl<T> Broadcaster<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A broadcaster with the default per-edge bound and `Overflow`
    /// surfacing.
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_EDGE_CAPACITY, OverflowAction::Error)
    }

    /// A broadcaster with a custom per-edge bound and overflow action.
    pub fn with_capacity(edge_capacity: usize, on_full: OverflowAction) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BroadcastInner {
                edges: Arc::new(EdgeList::new()),
                terminal: None,
            }),
            edge_capacity,
            on_full,
        })
    }

    /// Push a value into every current subscriber.
    pub fn broadcast_next(&self, value: T) {
        let snapshot = {
            let inner = self.inner.lock().unwrap();
            if inner.terminal.is_some() {
                return;
            }
            Arc::clone(&inner.edges)
        };
        let mut remaining = snapshot.len();
        for edge in snapshot.iter() {
            remaining -= 1;
            if remaining == 0 {
                // Last edge takes the original value.
                edge.out.next(value);
                return;
            }
            edge.out.next(value.clone());
        }
    }

    /// Terminate every edge with `error`.
    pub fn broadcast_error(&self, error: StreamError) {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminal.is_some() {
                if error.is_fatal() {
                    log::error!("broadcaster dropped fatal error after terminal: {error}");
                }
                return;
            }
            inner.terminal = Some(Terminal::Error(error.clone()));
            std::mem::replace(&mut inner.edges, Arc::new(EdgeList::new()))
        };
        for edge in snapshot.iter() {
            edge.out.error(error.clone());
        }
    }

    /// Terminate every edge with completion.
    pub fn broadcast_complete(&self) {
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            if inner.terminal.is_some() {
                return;
            }
            inner.terminal = Some(Terminal::Complete);
            std::mem::replace(&mut inner.edges, Arc::new(EdgeList::new()))
        };
        for edge in snapshot.iter() {
            edge.out.complete();
        }
    }

    /// Number of live subscriber edges.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().edges.len()
    }

    fn remove(&self, edge: &BroadcastEdge<T>) {
        let mut inner = self.inner.lock().unwrap();
        let mut edges: EdgeList<T> = inner.edges.iter().cloned().collect();
        edges.retain(|candidate| !std::ptr::eq(candidate.as_ref(), edge));
        inner.edges = Arc::new(edges);
    }
}

impl<T> Publisher<T> for Broadcaster<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        let edge = Arc::new(BroadcastEdge {
            out: Downstream::bounded("broadcast", self.edge_capacity, self.on_full),
            owner: Arc::downgrade(&self),
        });
        let subscription = Subscription::new(Arc::downgrade(&edge) as Weak<dyn Producer>);
        if !edge.out.wire(subscriber, subscription) {
            return;
        }
        let terminal = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.terminal {
                Some(terminal) => Some(terminal.clone()),
                None => {
                    let mut edges: EdgeList<T> = inner.edges.iter().cloned().collect();
                    edges.push(Arc::clone(&edge));
                    inner.edges = Arc::new(edges);
                    None
                }
            }
        };
        match terminal {
            Some(Terminal::Error(error)) => edge.out.error(error),
            Some(Terminal::Complete) => edge.out.complete(),
            None => {}
        }
    }
}

/// One subscriber edge of a broadcaster.
struct BroadcastEdge<T> {
    out: Downstream<T>,
    owner: Weak<Broadcaster<T>>,
}

impl<T> Producer for BroadcastEdge<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn on_request(&self, _n: u64) {
        self.out.drain();
    }

    fn on_cancel(&self) {
        self.out.cancelled();
        if let Some(owner) = self.owner.upgrade() {
            // The snapshot the emitters iterate is immutable; removal
            // swaps in a fresh list.
            owner.remove(self);
        }
    }

    fn on_invalid_request(&self) {
        self.out.error(StreamError::Protocol(ProtocolError::ZeroRequest));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_test_utils::CollectingSubscriber;

    #[test]
    fn pushes_reach_all_subscribers() {
        let (broadcaster, _publisher) = broadcast::<i32>();
        let first = CollectingSubscriber::unbounded();
        let second = CollectingSubscriber::unbounded();
        Arc::clone(&broadcaster).subscribe(first.clone_as_subscriber());
        Arc::clone(&broadcaster).subscribe(second.clone_as_subscriber());

        broadcaster.broadcast_next(1);
        broadcaster.broadcast_next(2);
        assert_eq!(first.values(), vec![1, 2]);
        assert_eq!(second.values(), vec![1, 2]);
    }

    #[test]
    fn late_subscribers_do_not_replay() {
        let (broadcaster, _publisher) = broadcast::<i32>();
        let early = CollectingSubscriber::unbounded();
        Arc::clone(&broadcaster).subscribe(early.clone_as_subscriber());
        broadcaster.broadcast_next(1);

        let late = CollectingSubscriber::unbounded();
        Arc::clone(&broadcaster).subscribe(late.clone_as_subscriber());
        broadcaster.broadcast_next(2);

        assert_eq!(early.values(), vec![1, 2]);
        assert_eq!(late.values(), vec![2]);
    }

    #[test]
    fn terminal_fans_out_exactly_once_per_edge() {
        let (broadcaster, _publisher) = broadcast::<i32>();
        let sink = CollectingSubscriber::unbounded();
        Arc::clone(&broadcaster).subscribe(sink.clone_as_subscriber());

        broadcaster.broadcast_complete();
        broadcaster.broadcast_complete();
        broadcaster.broadcast_error(StreamError::Fatal("late".into()));
        assert_eq!(sink.completions(), 1);
        assert!(sink.errors().is_empty());
    }

    #[test]
    fn late_subscriber_after_terminal_sees_it() {
        let (broadcaster, _publisher) = broadcast::<i32>();
        broadcaster.broadcast_complete();
        let sink = CollectingSubscriber::unbounded();
        Arc::clone(&broadcaster).subscribe(sink.clone_as_subscriber());
        assert_eq!(sink.completions(), 1);
    }

    #[test]
    fn cancel_detaches_the_edge() {
        let (broadcaster, _publisher) = broadcast::<i32>();
        let sink = CollectingSubscriber::unbounded();
        Arc::clone(&broadcaster).subscribe(sink.clone_as_subscriber());
        assert_eq!(broadcaster.subscriber_count(), 1);

        sink.cancel();
        assert_eq!(broadcaster.subscriber_count(), 0);
        broadcaster.broadcast_next(9);
        assert!(sink.values().is_empty());
    }

    #[test]
    fn slow_consumer_overflows_with_error() {
        let broadcaster = Broadcaster::<i32>::with_capacity(4, OverflowAction::Error);
        let sink = CollectingSubscriber::manual();
        Arc::clone(&broadcaster).subscribe(sink.clone_as_subscriber());
        for i in 0..10 {
            broadcaster.broadcast_next(i);
        }
        let errors = sink.errors();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], StreamError::Overflow { .. }));
    }
}
