//! Fixed-size windows as sub-streams.
//!
//! Like [`buffer`](crate::buffer()), but each window is emitted as a
//! publisher of its own instead of a list. Inner subscribers observe
//! `Next* Complete`; the outer stream emits one [`SubStream`] per
//! window.

use std::sync::{Arc, Mutex, Weak};

use rill_core::{
    Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber, Subscription,
    UpstreamCell,
};

/// Split the stream into consecutive windows of `size` values.
///
/// # Panics
///
/// Panics if `size` is zero.
pub fn window<T>(source: Arc<dyn Publisher<T>>, size: usize) -> Arc<WindowOp<T>>
where
    T: Send + 'static,
{
    assert!(size > 0, "window size must be at least 1");
    Arc::new(WindowOp {
        size,
        state: Mutex::new(WindowState {
            current: None,
            count: 0,
        }),
        out: Downstream::new(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
    })
}

/// Handle to one window's signal stream.
pub struct SubStream<T> {
    inner: Arc<InnerWindow<T>>,
}

impl<T> Clone for SubStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> SubStream<T> {
    /// The window as a composable publisher.
    pub fn publisher(&self) -> Arc<dyn Publisher<T>> {
        Arc::clone(&self.inner) as Arc<dyn Publisher<T>>
    }

    /// Subscribe directly to the window.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.publisher().subscribe(subscriber);
    }
}

struct InnerWindow<T> {
    out: Downstream<T>,
}

impl<T: Send + 'static> Publisher<T> for InnerWindow<T> {
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) {
        let subscription = Subscription::new(Arc::downgrade(&self) as Weak<dyn Producer>);
        self.out.wire(subscriber, subscription);
    }
}

impl<T: Send + 'static> Producer for InnerWindow<T> {
    fn on_request(&self, _n: u64) {
        self.out.drain();
    }

    fn on_cancel(&self) {
        self.out.cancelled();
    }

    fn on_invalid_request(&self) {
        self.out.error(StreamError::Protocol(ProtocolError::ZeroRequest));
    }
}

struct WindowState<T> {
    current: Option<Arc<InnerWindow<T>>>,
    count: usize,
}

/// Operator node for [`window`].
pub struct WindowOp<T> {
    size: usize,
    state: Mutex<WindowState<T>>,
    out: Downstream<SubStream<T>>,
    upstream: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<T>>>>,
}

impl<T: Send + 'static> WindowOp<T> {
    fn close_current(&self) -> Option<Arc<InnerWindow<T>>> {
        let mut state = self.state.lock().unwrap();
        state.count = 0;
        state.current.take()
    }
}

impl<T: Send + 'static> Publisher<SubStream<T>> for WindowOp<T> {
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<SubStream<T>>>) {
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

impl<T: Send + 'static> Subscriber<T> for WindowOp<T> {
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: T) {
        let (inner, opened, closing) = {
            let mut state = self.state.lock().unwrap();
            let opened = state.current.is_none();
            if opened {
                state.current = Some(Arc::new(InnerWindow {
                    out: Downstream::new(),
                }));
                state.count = 0;
            }
            let inner = Arc::clone(state.current.as_ref().expect("window just ensured"));
            state.count += 1;
            let closing = state.count >= self.size;
            if closing {
                state.current = None;
                state.count = 0;
            }
            (inner, opened, closing)
        };
        if opened {
            // The window handle goes downstream before its first value
            // so a synchronous inner subscriber misses nothing.
            self.out.next(SubStream {
                inner: Arc::clone(&inner),
            });
        }
        inner.out.next(value);
        if closing {
            inner.out.complete();
        }
    }

    fn on_error(&self, error: StreamError) {
        self.upstream.clear();
        if let Some(inner) = self.close_current() {
            inner.out.error(error.clone());
        }
        self.out.error(error);
    }

    fn on_complete(&self) {
        self.upstream.clear();
        if let Some(inner) = self.close_current() {
            inner.out.complete();
        }
        self.out.complete();
    }
}

impl<T: Send + 'static> Producer for WindowOp<T> {
    fn on_request(&self, n: u64) {
        self.upstream.request(n.saturating_mul(self.size as u64));
        self.out.drain();
    }

    fn on_cancel(&self) {
        self.upstream.cancel();
        if let Some(inner) = self.close_current() {
            inner.out.cancelled();
        }
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
    use crate::reduce::reduce;
    use crate::source::range;
    use rill_test_utils::CollectingSubscriber;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn windows_partition_the_input() {
        let outer = CollectingSubscriber::unbounded();
        window(range(0, 10), 4).subscribe(outer.clone_as_subscriber());

        let windows = outer.values();
        assert_eq!(windows.len(), 3);

        let mut collected = Vec::new();
        for sub_stream in &windows {
            let inner = CollectingSubscriber::unbounded();
            sub_stream.subscribe(inner.clone_as_subscriber());
            assert_eq!(inner.completions(), 1);
            collected.extend(inner.values());
        }
        assert_eq!(collected, (0..10).collect::<Vec<_>>());
        assert_eq!(outer.completions(), 1);
    }

    #[test]
    fn inner_reduce_per_window() {
        // Mirror of the windowed-minimum pipeline: ten windows of 100
        // values each reduce to their smallest element.
        let minima = Arc::new(Mutex::new(Vec::new()));
        let completions = Arc::new(AtomicUsize::new(0));

        let outer = CollectingSubscriber::unbounded();
        window(range(0, 1000), 100).subscribe(outer.clone_as_subscriber());

        for sub_stream in outer.values() {
            let sink = CollectingSubscriber::unbounded();
            reduce(sub_stream.publisher(), i64::MAX, |acc, v| acc.min(v))
                .subscribe(sink.clone_as_subscriber());
            completions.fetch_add(sink.completions(), Ordering::Relaxed);
            minima.lock().unwrap().extend(sink.values());
        }

        assert_eq!(
            *minima.lock().unwrap(),
            vec![0, 100, 200, 300, 400, 500, 600, 700, 800, 900]
        );
        assert_eq!(completions.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn windows_subscribed_late_still_see_their_values() {
        // Values queue on the inner edge until its subscriber joins
        // (terminals are delivered on join even without demand).
        let outer = CollectingSubscriber::unbounded();
        window(range(0, 4), 2).subscribe(outer.clone_as_subscriber());

        let windows = outer.values();
        let late = CollectingSubscriber::unbounded();
        windows[0].subscribe(late.clone_as_subscriber());
        assert_eq!(late.values(), vec![0, 1]);
        assert_eq!(late.completions(), 1);
    }
}
