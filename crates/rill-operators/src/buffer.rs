//! Size- and time-triggered batching.
//!
//! Values accumulate into a batch that is emitted when it reaches
//! `size`, when the flush timeout elapses (measured from the first
//! element of the current batch), or — partially — at `Complete`.
//! Timeouts never flush an empty batch. The size trigger and the timer
//! trigger can race at a batch boundary; the batch generation counter
//! makes exactly one of them win.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rill_core::{
    Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber, Subscription,
    UpstreamCell,
};
use rill_dispatch::{TimerRegistration, TimerService};

/// Accumulate up to `size` values and emit them as one list.
///
/// # Panics
///
/// Panics if `size` is zero.
pub fn buffer<T>(source: Arc<dyn Publisher<T>>, size: usize) -> Arc<BufferOp<T>>
where
    T: Send + 'static,
{
    assert!(size > 0, "buffer size must be at least 1");
    new_buffer(source, size, None)
}

/// Like [`buffer`], plus a timer-driven flush `timeout` after the
/// first element of each batch.
///
/// # Panics
///
/// Panics if `size` is zero.
pub fn buffer_with_timeout<T>(
    source: Arc<dyn Publisher<T>>,
    size: usize,
    timeout: Duration,
    timer: Arc<TimerService>,
) -> Arc<BufferOp<T>>
where
    T: Send + 'static,
{
    assert!(size > 0, "buffer size must be at least 1");
    new_buffer(source, size, Some((timeout, timer)))
}

fn new_buffer<T>(
    source: Arc<dyn Publisher<T>>,
    size: usize,
    flush_after: Option<(Duration, Arc<TimerService>)>,
) -> Arc<BufferOp<T>>
where
    T: Send + 'static,
{
    Arc::new_cyclic(|me| BufferOp {
        size,
        flush_after,
        state: Mutex::new(BatchState {
            items: Vec::new(),
            generation: 0,
            registration: None,
        }),
        out: Downstream::new(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
        me: me.clone(),
    })
}

struct BatchState<T> {
    items: Vec<T>,
    /// Bumped on every flush; a timer fire that captured an older
    /// generation is a no-op.
    generation: u64,
    registration: Option<TimerRegistration>,
}

impl<T> BatchState<T> {
    fn take_batch(&mut self) -> Option<Vec<T>> {
        if self.items.is_empty() {
            return None;
        }
        self.generation += 1;
        if let Some(registration) = self.registration.take() {
            registration.cancel();
        }
        Some(std::mem::take(&mut self.items))
    }
}

/// Operator node for [`buffer`] and [`buffer_with_timeout`].
pub struct BufferOp<T> {
    size: usize,
    flush_after: Option<(Duration, Arc<TimerService>)>,
    state: Mutex<BatchState<T>>,
    out: Downstream<Vec<T>>,
    upstream: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<T>>>>,
    me: Weak<Self>,
}

impl<T: Send + 'static> BufferOp<T> {
    fn flush(&self) {
        let batch = self.state.lock().unwrap().take_batch();
        if let Some(batch) = batch {
            self.out.next(batch);
        }
    }

    fn flush_generation(&self, generation: u64) {
        let batch = {
            let mut state = self.state.lock().unwrap();
            if state.generation != generation {
                // The size trigger won the race; this fire is stale.
                None
            } else {
                state.take_batch()
            }
        };
        if let Some(batch) = batch {
            self.out.next(batch);
        }
    }
}

impl<T: Send + 'static> Publisher<Vec<T>> for BufferOp<T> {
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<Vec<T>>>) {
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

impl<T: Send + 'static> Subscriber<T> for BufferOp<T> {
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: T) {
        let full = {
            let mut state = self.state.lock().unwrap();
            if state.items.is_empty() {
                if let Some((timeout, timer)) = &self.flush_after {
                    let generation = state.generation;
                    let me = self.me.clone();
                    state.registration = Some(timer.schedule(*timeout, move || {
                        if let Some(op) = me.upgrade() {
                            op.flush_generation(generation);
                        }
                    }));
                }
            }
            state.items.push(value);
            state.items.len() >= self.size
        };
        if full {
            self.flush();
        }
    }

    fn on_error(&self, error: StreamError) {
        self.upstream.clear();
        self.state.lock().unwrap().take_batch();
        self.out.error(error);
    }

    fn on_complete(&self) {
        self.upstream.clear();
        self.flush();
        self.out.complete();
    }
}

impl<T: Send + 'static> Producer for BufferOp<T> {
    fn on_request(&self, n: u64) {
        self.upstream.request(n.saturating_mul(self.size as u64));
        self.out.drain();
    }

    fn on_cancel(&self) {
        self.upstream.cancel();
        self.state.lock().unwrap().take_batch();
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
    use crate::broadcast::broadcast;
    use crate::source::range;
    use rill_test_utils::CollectingSubscriber;

    #[test]
    fn emits_full_batches_and_partial_tail() {
        let sink = CollectingSubscriber::unbounded();
        buffer(range(1, 7), 3).subscribe(sink.clone_as_subscriber());
        assert_eq!(sink.values(), vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]);
        assert_eq!(sink.completions(), 1);
    }

    #[test]
    fn batch_concatenation_preserves_the_input() {
        let sink = CollectingSubscriber::unbounded();
        buffer(range(0, 100), 7).subscribe(sink.clone_as_subscriber());
        let batches = sink.values();
        // Every non-final batch has exactly the configured size.
        for batch in &batches[..batches.len() - 1] {
            assert_eq!(batch.len(), 7);
        }
        let flattened: Vec<i64> = batches.into_iter().flatten().collect();
        assert_eq!(flattened, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn empty_input_emits_no_batch() {
        let sink = CollectingSubscriber::unbounded();
        buffer(range(0, 0), 4).subscribe(sink.clone_as_subscriber());
        assert!(sink.values().is_empty());
        assert_eq!(sink.completions(), 1);
    }

    #[test]
    fn timeout_flushes_a_partial_batch() {
        let timer = Arc::new(TimerService::with_resolution(Duration::from_millis(5)));
        let (broadcaster, stream) = broadcast::<i32>();
        let sink = CollectingSubscriber::unbounded();
        buffer_with_timeout(stream, 100, Duration::from_millis(40), Arc::clone(&timer))
            .subscribe(sink.clone_as_subscriber());

        broadcaster.broadcast_next(1);
        broadcaster.broadcast_next(2);
        assert!(sink.await_count(1, Duration::from_secs(2)));
        assert_eq!(sink.values(), vec![vec![1, 2]]);
        timer.shutdown();
    }

    #[test]
    fn timeout_never_flushes_an_empty_batch() {
        let timer = Arc::new(TimerService::with_resolution(Duration::from_millis(5)));
        let (_broadcaster, stream) = broadcast::<i32>();
        let sink = CollectingSubscriber::unbounded();
        buffer_with_timeout(stream, 4, Duration::from_millis(20), Arc::clone(&timer))
            .subscribe(sink.clone_as_subscriber());
        std::thread::sleep(Duration::from_millis(120));
        assert!(sink.values().is_empty());
        timer.shutdown();
    }

    #[test]
    fn size_and_timer_triggers_flush_exactly_once() {
        let timer = Arc::new(TimerService::with_resolution(Duration::from_millis(5)));
        let (broadcaster, stream) = broadcast::<i32>();
        let sink = CollectingSubscriber::unbounded();
        buffer_with_timeout(stream, 2, Duration::from_millis(30), Arc::clone(&timer))
            .subscribe(sink.clone_as_subscriber());

        // Fill the batch so the size trigger fires, then outwait the
        // timer: the stale fire must not produce a second flush.
        broadcaster.broadcast_next(1);
        broadcaster.broadcast_next(2);
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(sink.values(), vec![vec![1, 2]]);
        timer.shutdown();
    }
}
