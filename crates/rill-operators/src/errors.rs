//! Error-handling operators: swallow or handle, then complete.
//!
//! Both operators convert an upstream `Error` terminal into a
//! `Complete`, terminating the edge either way — error recovery never
//! resumes the stream. Fatal errors are never swallowed.

use std::error::Error;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};

use rill_core::{
    Downstream, Producer, ProtocolError, Publisher, StreamError, Subscriber, Subscription,
    UpstreamCell,
};

use crate::support::guard;

/// Error type that never occurs; the `E` parameter of
/// [`ignore_errors`], which matches nothing and swallows everything.
#[derive(Debug)]
pub enum NoError {}

impl fmt::Display for NoError {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {}
    }
}

impl Error for NoError {}

/// Swallow any non-fatal upstream `Error` and substitute `Complete`.
/// The upstream is cancelled upon the swallowed error.
pub fn ignore_errors<T>(source: Arc<dyn Publisher<T>>) -> Arc<WhenOp<T, NoError, fn(&NoError)>>
where
    T: Send + 'static,
{
    Arc::new(WhenOp {
        handler: None,
        out: Downstream::new(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
        _marker: PhantomData,
    })
}

/// Catch upstream errors whose wrapped user error is of type `E`,
/// invoke `handler`, and propagate `Complete` instead. Errors of other
/// types (and all fatal errors) pass through unchanged.
pub fn when<T, E, H>(source: Arc<dyn Publisher<T>>, handler: H) -> Arc<WhenOp<T, E, H>>
where
    T: Send + 'static,
    E: Error + 'static,
    H: Fn(&E) + Send + Sync + 'static,
{
    Arc::new(WhenOp {
        handler: Some(handler),
        out: Downstream::new(),
        upstream: UpstreamCell::new(),
        source: Mutex::new(Some(source)),
        _marker: PhantomData,
    })
}

/// Operator node for [`when`] and [`ignore_errors`]. With no handler
/// every non-fatal error is swallowed; with a handler only matching
/// errors are.
pub struct WhenOp<T, E, H> {
    handler: Option<H>,
    out: Downstream<T>,
    upstream: UpstreamCell,
    source: Mutex<Option<Arc<dyn Publisher<T>>>>,
    _marker: PhantomData<fn(&E)>,
}

impl<T, E, H> WhenOp<T, E, H>
where
    T: Send + 'static,
    E: Error + 'static,
    H: Fn(&E) + Send + Sync + 'static,
{
    /// Whether `error` is absorbed by this operator.
    fn handle(&self, error: &StreamError) -> bool {
        if error.is_fatal() {
            return false;
        }
        match &self.handler {
            // ignore_errors: swallow silently.
            None => true,
            Some(handler) => match error.user_error::<E>() {
                Some(user_error) => guard(|| handler(user_error)).is_ok(),
                None => false,
            },
        }
    }
}

impl<T, E, H> Publisher<T> for WhenOp<T, E, H>
where
    T: Send + 'static,
    E: Error + 'static,
    H: Fn(&E) + Send + Sync + 'static,
{
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<T>>) {
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

impl<T, E, H> Subscriber<T> for WhenOp<T, E, H>
where
    T: Send + 'static,
    E: Error + 'static,
    H: Fn(&E) + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        self.upstream.set(subscription);
    }

    fn on_next(&self, value: T) {
        self.out.next(value);
    }

    fn on_error(&self, error: StreamError) {
        if self.handle(&error) {
            self.upstream.cancel();
            self.out.complete();
        } else {
            self.upstream.clear();
            self.out.error(error);
        }
    }

    fn on_complete(&self) {
        self.upstream.clear();
        self.out.complete();
    }
}

impl<T, E, H> Producer for WhenOp<T, E, H>
where
    T: Send + 'static,
    E: Error + 'static,
    H: Fn(&E) + Send + Sync + 'static,
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
    use crate::broadcast::broadcast;
    use crate::map::map;
    use crate::source::just;
    use rill_test_utils::CollectingSubscriber;
    use std::num::ParseIntError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failing_parse() -> Arc<dyn Publisher<i32>> {
        map(just(vec!["1", "2", "x", "4"]), |s: &str| {
            s.parse::<i32>().unwrap()
        })
    }

    #[test]
    fn ignore_errors_substitutes_complete() {
        let sink = CollectingSubscriber::unbounded();
        ignore_errors(failing_parse()).subscribe(sink.clone_as_subscriber());
        assert_eq!(sink.values(), vec![1, 2]);
        assert!(sink.errors().is_empty());
        assert_eq!(sink.completions(), 1);
    }

    #[test]
    fn fatal_errors_are_never_swallowed() {
        let (publisher, stream) = broadcast::<i32>();
        let sink = CollectingSubscriber::unbounded();
        ignore_errors(stream).subscribe(sink.clone_as_subscriber());
        publisher.broadcast_error(StreamError::Fatal("corrupt demand counter".into()));
        assert_eq!(sink.errors().len(), 1);
        assert_eq!(sink.completions(), 0);
    }

    #[test]
    fn when_handles_typed_user_errors() {
        let (publisher, stream) = broadcast::<i32>();
        let handled = Arc::new(AtomicUsize::new(0));
        let handled_in = Arc::clone(&handled);
        let sink = CollectingSubscriber::unbounded();
        when(stream, move |_e: &ParseIntError| {
            handled_in.fetch_add(1, Ordering::Relaxed);
        })
        .subscribe(sink.clone_as_subscriber());

        publisher.broadcast_next(7);
        let parse_error = "x".parse::<i32>().unwrap_err();
        publisher.broadcast_error(StreamError::user(parse_error));

        assert_eq!(sink.values(), vec![7]);
        assert_eq!(handled.load(Ordering::Relaxed), 1);
        assert!(sink.errors().is_empty());
        assert_eq!(sink.completions(), 1);
    }

    #[test]
    fn when_passes_non_matching_errors_through() {
        let (publisher, stream) = broadcast::<i32>();
        let handled = Arc::new(AtomicUsize::new(0));
        let handled_in = Arc::clone(&handled);
        let sink = CollectingSubscriber::unbounded();
        when(stream, move |_e: &ParseIntError| {
            handled_in.fetch_add(1, Ordering::Relaxed);
        })
        .subscribe(sink.clone_as_subscriber());

        publisher.broadcast_error(StreamError::IllegalArgument("not a user error".into()));
        assert_eq!(handled.load(Ordering::Relaxed), 0);
        assert_eq!(sink.errors().len(), 1);
    }
}
