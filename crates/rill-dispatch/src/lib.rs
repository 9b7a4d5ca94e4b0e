//! Execution contexts for the rill dataflow engine.
//!
//! Operators in `rill-operators` are passive; all concurrency comes
//! from the dispatchers they bind to. Every dispatcher accepts the
//! same unit-of-work submission contract and differs only in ordering
//! and parallelism:
//!
//! | Variant | Concurrency | Order across submissions |
//! |---------|-------------|--------------------------|
//! | [`SyncDispatcher`] | caller thread | caller order |
//! | [`ThreadDispatcher`] | 1 worker | FIFO global |
//! | [`PoolDispatcher`] | N workers | none |
//! | [`RingDispatcher`] | 1 consumer | FIFO (per producer) |
//!
//! The crate also provides the [`TimerService`] (a dedicated-thread
//! monotonic scheduler) and the [`Environment`] — the explicit registry
//! of named dispatchers that graph construction threads through instead
//! of a process-global lookup.

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod env;
pub mod metrics;
pub mod pool;
pub mod ring;
pub mod sync;
pub mod task;
pub mod thread;
pub mod timer;

pub use config::{ConfigError, DispatcherConfig, DispatcherKind, OverflowPolicy, ProducerType, WaitStrategy};
pub use env::{Environment, EnvironmentConfig};
pub use metrics::{DispatchMetrics, MetricsSnapshot};
pub use pool::PoolDispatcher;
pub use ring::RingDispatcher;
pub use sync::SyncDispatcher;
pub use task::{DispatchError, Dispatcher, DispatcherExt, Task};
pub use thread::ThreadDispatcher;
pub use timer::{TimerRegistration, TimerService};
