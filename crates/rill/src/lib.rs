//! Rill: a reactive dataflow engine.
//!
//! Rill moves discrete signals (values, errors, completion) through
//! directed graphs of stream operators under a demand-driven
//! backpressure protocol. This is the top-level facade crate: it
//! re-exports the public API from the rill sub-crates and adds the
//! fluent [`Stream`] builder.
//!
//! # Quick start
//!
//! ```rust
//! use rill::prelude::*;
//!
//! let env = Environment::with_defaults();
//! let collected = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
//! let sink = std::sync::Arc::clone(&collected);
//!
//! streams::just(&env, vec!["1", "2", "3", "4", "5"])
//!     .map(|s| s.parse::<i64>().unwrap())
//!     .scan(0, |acc, v| acc + v)
//!     .consume(move |v| sink.lock().unwrap().push(v));
//!
//! assert_eq!(*collected.lock().unwrap(), vec![1, 3, 6, 10, 15]);
//! env.shutdown(std::time::Duration::from_secs(2));
//! ```
//!
//! # Modules
//!
//! Each module corresponds to a sub-crate. Use them for types not in
//! the prelude:
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`core`] | `rill-core` | Signals, demand, subscriptions, envelopes |
//! | [`dispatch`] | `rill-dispatch` | Dispatchers, timer service, environment |
//! | [`operators`] | `rill-operators` | Operator nodes and sources |

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

mod stream;
pub mod streams;

pub use stream::{Control, Stream};

/// Signal protocol core (`rill-core`).
pub mod core {
    pub use rill_core::*;
}

/// Execution contexts (`rill-dispatch`).
pub mod dispatch {
    pub use rill_dispatch::*;
}

/// Operator nodes (`rill-operators`).
pub mod operators {
    pub use rill_operators::*;
}

/// The types most programs need.
pub mod prelude {
    pub use crate::stream::{Control, Stream};
    pub use crate::streams;
    pub use rill_core::{
        Demand, Envelope, Headers, ProtocolError, Publisher, StreamError, Subscriber,
        Subscription, UNBOUNDED,
    };
    pub use rill_dispatch::{
        Dispatcher, DispatcherConfig, DispatcherKind, Environment, EnvironmentConfig,
        OverflowPolicy, ProducerType, TimerService, WaitStrategy,
    };
    pub use rill_operators::Broadcaster;
}
