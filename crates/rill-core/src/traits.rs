//! The four-signal capability traits.
//!
//! Operator nodes are both a [`Subscriber`] (to their upstream) and a
//! [`Publisher`] (to their downstream), plus a [`Producer`] that reacts
//! to the demand side of their own downstream edge. All three traits
//! are narrow and object-safe; nodes are shared as `Arc<dyn ...>`.

use std::sync::Arc;

use crate::error::StreamError;
use crate::subscription::Subscription;

/// Consumer side of an edge.
///
/// # Contract
///
/// - `on_subscribe` is invoked synchronously from within
///   [`Publisher::subscribe`], before any other signal.
/// - After a terminal (`on_error` / `on_complete`), no further signal
///   is delivered by a conformant publisher.
/// - `on_next` calls are serialized per edge; implementations do not
///   need internal locking against concurrent `on_next`.
pub trait Subscriber<T>: Send + Sync {
    /// The upstream edge handle. Demand must be requested through it
    /// before any `Next` arrives.
    fn on_subscribe(&self, subscription: Arc<Subscription>);

    /// A value signal.
    fn on_next(&self, value: T);

    /// Terminal failure signal.
    fn on_error(&self, error: StreamError);

    /// Terminal completion signal.
    fn on_complete(&self);
}

/// Producer side of an edge.
pub trait Publisher<T>: Send + Sync {
    /// Bind `subscriber` as the downstream of this node, synchronously
    /// invoking `subscriber.on_subscribe(..)`. Cold publishers start a
    /// fresh signal chain per call; operator nodes accept exactly one
    /// subscriber and reject the rest with `IllegalArgument`.
    fn subscribe(self: Arc<Self>, subscriber: Arc<dyn Subscriber<T>>);
}

/// Demand-side callbacks a [`Subscription`] routes back to the node
/// that created it.
///
/// Credit bookkeeping happens in the subscription itself before these
/// fire; `on_request` only has to move data (drain a source, forward
/// demand upstream, flush deferred signals).
pub trait Producer: Send + Sync {
    /// `n` credits (`n > 0`) were added downstream.
    fn on_request(&self, n: u64);

    /// The downstream cancelled its subscription.
    fn on_cancel(&self);

    /// The downstream issued `request(0)`, a protocol violation fatal
    /// to this edge.
    fn on_invalid_request(&self);
}
