//! The fluent stream builder.
//!
//! [`Stream`] is a thin handle: a composed publisher plus the
//! [`Environment`] threaded through construction so timer-driven and
//! dispatcher-bound operators can find their execution contexts. Each
//! combinator wraps the publisher in one more operator node; nothing
//! runs until a terminal subscriber ([`consume`](Stream::consume) or
//! [`subscribe`](Stream::subscribe)) joins and demand starts flowing.
//!
//! Streams are single-subscription: the operator chain belongs to the
//! first subscriber. Use a [`Broadcaster`](rill_operators::Broadcaster)
//! or [`partition`](Stream::partition) to fan out.

use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rill_core::{Publisher, StreamError, Subscriber, Subscription, UNBOUNDED};
use rill_dispatch::{Dispatcher, Environment};

/// A composable view over a publisher.
pub struct Stream<T> {
    source: Arc<dyn Publisher<T>>,
    env: Arc<Environment>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            env: Arc::clone(&self.env),
        }
    }
}

impl<T: Send + 'static> Stream<T> {
    /// Wrap an existing publisher.
    pub fn from_publisher(env: &Arc<Environment>, source: Arc<dyn Publisher<T>>) -> Self {
        Self {
            source,
            env: Arc::clone(env),
        }
    }

    /// The underlying publisher.
    pub fn publisher(&self) -> Arc<dyn Publisher<T>> {
        Arc::clone(&self.source)
    }

    /// The environment this stream was built against.
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    fn wrap<O: Send + 'static>(&self, source: Arc<dyn Publisher<O>>) -> Stream<O> {
        Stream {
            source,
            env: Arc::clone(&self.env),
        }
    }

    // ── Stateless transforms ─────────────────────────────────────

    /// Apply a pure function to each value.
    pub fn map<O, F>(&self, f: F) -> Stream<O>
    where
        O: Send + 'static,
        F: Fn(T) -> O + Send + Sync + 'static,
    {
        self.wrap(rill_operators::map(self.publisher(), f))
    }

    /// Apply a fallible function; an `Err` becomes a typed
    /// `Error(User)` terminal that [`when`](Stream::when) can match.
    pub fn try_map<O, E, F>(&self, f: F) -> Stream<O>
    where
        O: Send + 'static,
        E: Error + Send + Sync + 'static,
        F: Fn(T) -> Result<O, E> + Send + Sync + 'static,
    {
        self.wrap(rill_operators::try_map(self.publisher(), f))
    }

    /// Keep only the values matching `predicate`.
    pub fn filter<P>(&self, predicate: P) -> Stream<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.wrap(rill_operators::filter(self.publisher(), predicate))
    }

    /// Side-effect callback; values pass through unchanged.
    pub fn observe<C>(&self, callback: C) -> Stream<T>
    where
        C: Fn(&T) + Send + Sync + 'static,
    {
        self.wrap(rill_operators::observe(self.publisher(), callback))
    }

    /// Swallow any non-fatal error and complete instead.
    pub fn ignore_errors(&self) -> Stream<T> {
        self.wrap(rill_operators::ignore_errors(self.publisher()))
    }

    /// Handle user errors of type `E`, then complete.
    pub fn when<E, H>(&self, handler: H) -> Stream<T>
    where
        E: Error + 'static,
        H: Fn(&E) + Send + Sync + 'static,
    {
        self.wrap(rill_operators::when(self.publisher(), handler))
    }

    // ── Stateful transforms ──────────────────────────────────────

    /// Emit the running fold `acc = f(acc, v)` for each value.
    pub fn scan<A, F>(&self, seed: A, f: F) -> Stream<A>
    where
        A: Clone + Send + 'static,
        F: Fn(A, T) -> A + Send + Sync + 'static,
    {
        self.wrap(rill_operators::scan(self.publisher(), seed, f))
    }

    /// Like [`scan`](Stream::scan), emitting the seed first.
    pub fn scan_with_seed<A, F>(&self, seed: A, f: F) -> Stream<A>
    where
        A: Clone + Send + 'static,
        F: Fn(A, T) -> A + Send + Sync + 'static,
    {
        self.wrap(rill_operators::scan_with_seed(self.publisher(), seed, f))
    }

    /// Fold the whole stream; emit once at completion.
    pub fn reduce<A, F>(&self, seed: A, f: F) -> Stream<A>
    where
        A: Clone + Send + Sync + 'static,
        F: Fn(A, T) -> A + Send + Sync + 'static,
    {
        self.wrap(rill_operators::reduce(self.publisher(), seed, f))
    }

    /// Fold in batches of `batch_size`, emitting at each boundary and
    /// at completion.
    pub fn reduce_every<A, F>(&self, batch_size: usize, seed: A, f: F) -> Stream<A>
    where
        A: Clone + Send + Sync + 'static,
        F: Fn(A, T) -> A + Send + Sync + 'static,
    {
        self.wrap(rill_operators::reduce_every(
            self.publisher(),
            batch_size,
            seed,
            f,
        ))
    }

    // ── Aggregators ──────────────────────────────────────────────

    /// Collect values into lists of `size`.
    pub fn buffer(&self, size: usize) -> Stream<Vec<T>> {
        self.wrap(rill_operators::buffer(self.publisher(), size))
    }

    /// Collect values into lists of `size`, flushing a partial batch
    /// `timeout` after its first element.
    pub fn buffer_with_timeout(&self, size: usize, timeout: Duration) -> Stream<Vec<T>> {
        self.wrap(rill_operators::buffer_with_timeout(
            self.publisher(),
            size,
            timeout,
            Arc::clone(self.env.timer()),
        ))
    }

    /// Split into consecutive sub-streams of `size` values.
    pub fn window(&self, size: usize) -> Stream<Stream<T>> {
        let env = Arc::clone(&self.env);
        self.wrap(rill_operators::map(
            rill_operators::window(self.publisher(), size) as Arc<dyn Publisher<_>>,
            move |sub: rill_operators::SubStream<T>| Stream::from_publisher(&env, sub.publisher()),
        ))
    }

    /// Emit, every `period`, the latest `backlog` values in arrival
    /// order (the ring is not cleared between snapshots).
    pub fn moving_window(&self, period: Duration, delay: Duration, backlog: usize) -> Stream<Vec<T>>
    where
        T: Clone,
    {
        self.wrap(rill_operators::moving_window(
            self.publisher(),
            Arc::clone(self.env.timer()),
            period,
            delay,
            backlog,
        ))
    }

    // ── Fan-in / fan-out ─────────────────────────────────────────

    /// Interleave this stream with `other`.
    pub fn merge_with(&self, other: &Stream<T>) -> Stream<T> {
        self.wrap(rill_operators::merge(vec![
            self.publisher(),
            other.publisher(),
        ]))
    }

    /// Subscribe to `f(v)` for each value and merge the inner streams.
    pub fn flat_map<O, F>(&self, f: F) -> Stream<O>
    where
        O: Send + 'static,
        F: Fn(T) -> Stream<O> + Send + Sync + 'static,
    {
        self.wrap(rill_operators::flat_map(self.publisher(), move |v| {
            f(v).publisher()
        }))
    }

    /// Open `n` round-robin sub-streams.
    pub fn partition(&self, n: usize) -> Vec<Stream<T>> {
        rill_operators::partition(self.publisher(), n)
            .into_iter()
            .map(|publisher| Stream {
                source: publisher,
                env: Arc::clone(&self.env),
            })
            .collect()
    }

    /// Open `n` sub-streams routed by `key(v) % n`.
    pub fn partition_by<K>(&self, n: usize, key: K) -> Vec<Stream<T>>
    where
        K: Fn(&T) -> u64 + Send + Sync + 'static,
    {
        rill_operators::partition_by(self.publisher(), n, key)
            .into_iter()
            .map(|publisher| Stream {
                source: publisher,
                env: Arc::clone(&self.env),
            })
            .collect()
    }

    // ── Timing ───────────────────────────────────────────────────

    /// Emit the first value of each period window.
    pub fn sample_first(&self, period: Duration) -> Stream<T> {
        self.wrap(rill_operators::sample_first(
            self.publisher(),
            Arc::clone(self.env.timer()),
            period,
        ))
    }

    /// Emit the last value of each period window.
    pub fn sample(&self, period: Duration) -> Stream<T> {
        self.wrap(rill_operators::sample(
            self.publisher(),
            Arc::clone(self.env.timer()),
            period,
        ))
    }

    /// Surface `Error(Timeout)` when no value arrives within
    /// `duration` of the previous one.
    pub fn timeout_after(&self, duration: Duration) -> Stream<T> {
        self.wrap(rill_operators::timeout(
            self.publisher(),
            Arc::clone(self.env.timer()),
            duration,
        ))
    }

    // ── Boundaries ───────────────────────────────────────────────

    /// Deliver downstream signals as tasks on `dispatcher`.
    pub fn dispatch_on(&self, dispatcher: Arc<dyn Dispatcher>) -> Stream<T> {
        self.wrap(rill_operators::dispatch_on(self.publisher(), dispatcher))
    }

    /// Deliver downstream signals on the named dispatcher from this
    /// stream's environment. `None` if the name is not registered.
    pub fn dispatch_on_named(&self, name: &str) -> Option<Stream<T>> {
        self.env
            .dispatcher(name)
            .map(|dispatcher| self.dispatch_on(dispatcher))
    }

    // ── Terminals ────────────────────────────────────────────────

    /// Bind a subscriber to the head of the chain.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.publisher().subscribe(subscriber);
    }

    /// Consume every value with `f` under unbounded demand.
    pub fn consume<F>(&self, f: F) -> Control
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.consume_with(UNBOUNDED, f)
    }

    /// Consume with an initial demand of `demand`; pace further
    /// delivery through the returned [`Control`].
    pub fn consume_with<F>(&self, demand: u64, f: F) -> Control
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let subscriber = Arc::new(ConsumerSubscriber {
            f,
            initial_demand: demand,
            subscription: Arc::clone(&slot),
            _marker: std::marker::PhantomData,
        });
        self.subscribe(subscriber);
        Control { subscription: slot }
    }
}

/// Handle over a consuming subscription: cancel it or request more.
pub struct Control {
    subscription: Arc<Mutex<Option<Arc<Subscription>>>>,
}

impl Control {
    /// Cancel the consumption. Idempotent.
    pub fn cancel(&self) {
        let subscription = self.subscription.lock().unwrap().clone();
        if let Some(subscription) = subscription {
            subscription.cancel();
        }
    }

    /// Authorize `n` more values.
    pub fn request(&self, n: u64) {
        let subscription = self.subscription.lock().unwrap().clone();
        if let Some(subscription) = subscription {
            subscription.request(n);
        }
    }
}

struct ConsumerSubscriber<T, F> {
    f: F,
    initial_demand: u64,
    subscription: Arc<Mutex<Option<Arc<Subscription>>>>,
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T, F> Subscriber<T> for ConsumerSubscriber<T, F>
where
    T: Send + 'static,
    F: Fn(T) + Send + Sync + 'static,
{
    fn on_subscribe(&self, subscription: Arc<Subscription>) {
        *self.subscription.lock().unwrap() = Some(Arc::clone(&subscription));
        if self.initial_demand > 0 {
            subscription.request(self.initial_demand);
        }
    }

    fn on_next(&self, value: T) {
        (self.f)(value);
    }

    fn on_error(&self, error: StreamError) {
        log::warn!("stream terminated with error: {error}");
    }

    fn on_complete(&self) {}
}
