//! Signal protocol core for the rill dataflow engine.
//!
//! Everything in rill moves through a four-signal contract between a
//! publisher and a subscriber: zero or more `Next` values, terminated by
//! at most one `Error` or `Complete`, paced by `request(n)` demand and
//! cut short by `cancel`. This crate defines that contract and the
//! accounting machinery every operator node shares:
//!
//! - [`Signal`] — the tagged event on a publisher→subscriber edge.
//! - [`Demand`] — saturating atomic demand counter with an unbounded
//!   sentinel.
//! - [`Subscription`] — the bidirectional per-edge handle (demand,
//!   cancellation, producer callback).
//! - [`Subscriber`] / [`Publisher`] / [`Producer`] — the object-safe
//!   capability traits operator nodes implement.
//! - [`Downstream`] — the per-edge emission gate: exactly-once terminal
//!   delivery, demand-claimed `Next`, and a trampoline that serializes
//!   concurrent or reentrant emitters.
//! - [`Envelope`] — payload + headers wrapper used at routing boundaries.
//!
//! Execution contexts (dispatchers, timers) live in `rill-dispatch`; the
//! operator family lives in `rill-operators`. This crate has no threads
//! of its own — it is pure protocol.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod demand;
pub mod edge;
pub mod envelope;
pub mod error;
pub mod signal;
pub mod subscription;
pub mod traits;

pub use demand::{Demand, UNBOUNDED};
pub use edge::{Downstream, OverflowAction};
pub use envelope::{Envelope, Headers, ORIGIN_HEADER};
pub use error::{ProtocolError, StreamError};
pub use signal::{Lifecycle, Signal, StateCell};
pub use subscription::{Subscription, UpstreamCell};
pub use traits::{Producer, Publisher, Subscriber};
