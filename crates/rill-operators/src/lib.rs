//! Operator nodes for the rill dataflow engine.
//!
//! Every operator is both a subscriber (to its upstream) and a
//! publisher (to its downstream), built from the same parts: a
//! [`Downstream`](rill_core::Downstream) edge toward the consumer, an
//! [`UpstreamCell`](rill_core::UpstreamCell) toward the producer, and
//! the node's own state guarded by its concurrency discipline.
//!
//! Families:
//!
//! - stateless transforms: [`map()`], [`filter()`], [`observe()`],
//!   [`ignore_errors()`], [`when()`]
//! - stateful transforms: [`scan()`], [`reduce()`]
//! - aggregators: [`buffer()`], [`window()`], [`moving_window()`]
//! - fan-in: [`merge()`], [`flat_map()`]
//! - fan-out: [`partition()`], [`broadcast()`]
//! - timing: [`sample()`], [`sample_first()`], [`timeout()`]
//! - boundary: [`dispatch_on()`]
//! - sources: [`just()`], [`from_iter()`], [`range()`]
//!
//! Operator nodes accept exactly one downstream subscriber; fan-out
//! (many consumers of one producer) goes through [`broadcast()`] or
//! [`partition()`]. Sources are cold: each subscribe starts a fresh
//! emission chain.

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

mod boundary;
mod broadcast;
mod buffer;
mod errors;
mod filter;
mod flat_map;
mod map;
mod merge;
mod moving_window;
mod observe;
mod partition;
mod reduce;
mod sample;
mod scan;
mod source;
mod support;
mod timeout;
mod window;

pub use boundary::{dispatch_on, BoundaryOp};
pub use broadcast::{broadcast, Broadcaster, DEFAULT_EDGE_CAPACITY};
pub use buffer::{buffer, buffer_with_timeout, BufferOp};
pub use errors::{ignore_errors, when, NoError, WhenOp};
pub use filter::{filter, FilterOp};
pub use flat_map::{flat_map, FlatMapOp};
pub use map::{map, try_map, MapOp, TryMapOp};
pub use merge::{merge, MergeOp};
pub use moving_window::{moving_window, MovingWindowOp};
pub use observe::{observe, ObserveOp};
pub use partition::{partition, partition_by};
pub use reduce::{reduce, reduce_every, ReduceOp};
pub use sample::{sample, sample_first, SampleFirstOp, SampleOp};
pub use scan::{scan, scan_with_seed, ScanOp};
pub use source::{from_iter, just, range, IterSource};
pub use timeout::{timeout, TimeoutOp};
pub use window::{window, SubStream, WindowOp};
