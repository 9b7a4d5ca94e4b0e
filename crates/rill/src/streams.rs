//! Stream constructors.
//!
//! Every constructor takes the [`Environment`] explicitly — dispatcher
//! and timer lookup is threaded through construction, never read from
//! a process-global registry.

use std::sync::Arc;

use rill_core::Publisher;
use rill_dispatch::Environment;
use rill_operators::Broadcaster;

use crate::stream::Stream;

/// A finite cold stream of the given values followed by `Complete`.
pub fn just<T>(env: &Arc<Environment>, values: Vec<T>) -> Stream<T>
where
    T: Clone + Send + Sync + 'static,
{
    Stream::from_publisher(env, rill_operators::just(values))
}

/// A cold stream over any cloneable iterable.
pub fn from_iter<C>(env: &Arc<Environment>, collection: C) -> Stream<C::Item>
where
    C: IntoIterator + Clone + Send + Sync + 'static,
    C::Item: Send + 'static,
    C::IntoIter: Send + 'static,
{
    Stream::from_publisher(env, rill_operators::from_iter(collection))
}

/// An integer stream: `start, start + 1, ..., start + count - 1`.
pub fn range(env: &Arc<Environment>, start: i64, count: u64) -> Stream<i64> {
    Stream::from_publisher(env, rill_operators::range(start, count))
}

/// A hot stream with its push-side handle.
pub fn broadcast<T>(env: &Arc<Environment>) -> (Arc<Broadcaster<T>>, Stream<T>)
where
    T: Clone + Send + Sync + 'static,
{
    let (broadcaster, publisher) = rill_operators::broadcast();
    (broadcaster, Stream::from_publisher(env, publisher))
}

/// Interleave several streams into one.
pub fn merge<T>(env: &Arc<Environment>, inputs: Vec<Stream<T>>) -> Stream<T>
where
    T: Send + 'static,
{
    let publishers: Vec<Arc<dyn Publisher<T>>> =
        inputs.iter().map(|stream| stream.publisher()).collect();
    Stream::from_publisher(env, rill_operators::merge(publishers))
}
