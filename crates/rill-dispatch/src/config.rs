//! Dispatcher configuration, validation, and construction.
//!
//! [`DispatcherConfig`] is the builder-input for one named dispatcher.
//! [`validate()`](DispatcherConfig::validate) checks structural
//! invariants before any thread is spawned; [`build()`](DispatcherConfig::build)
//! constructs the configured variant.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::pool::PoolDispatcher;
use crate::ring::RingDispatcher;
use crate::sync::SyncDispatcher;
use crate::task::Dispatcher;
use crate::thread::ThreadDispatcher;

/// Which dispatcher variant a config describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherKind {
    /// Inline on the caller thread.
    Synchronous,
    /// One worker draining a FIFO queue.
    SingleThread,
    /// A pool of workers sharing one queue; no cross-submission order.
    WorkPool,
    /// Bounded slot ring with one consumer thread.
    RingBuffer,
}

/// How many distinct threads submit to a ring buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerType {
    /// Exactly one submitting thread; cheapest claim path.
    Single,
    /// Any number of submitting threads.
    Multi,
}

/// How a ring-buffer participant burns time while it waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Park on a condvar; lowest CPU, highest wake latency.
    Blocking,
    /// Spin-loop hint; lowest latency, one core pegged.
    BusySpin,
    /// `yield_now` between polls.
    Yielding,
    /// Short sleeps between polls.
    Sleeping,
}

/// What a bounded dispatcher queue does when it is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Block the submitter until space frees up.
    Block,
    /// Refuse the submission; the operator layer surfaces `Overflow`.
    Error,
    /// Discard the oldest queued task to make room.
    DropOldest,
    /// Discard the incoming task.
    DropNewest,
}

/// Configuration for one named dispatcher.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Registry name; must be unique within an environment.
    pub name: String,
    /// Variant to construct.
    pub kind: DispatcherKind,
    /// Worker threads. Only meaningful for [`DispatcherKind::WorkPool`];
    /// `None` = auto-detect (`available_parallelism`, clamped to `[2, 16]`).
    pub worker_count: Option<usize>,
    /// Queue capacity. `None` = unbounded (required `Some` for ring
    /// buffers, which have no unbounded form).
    pub queue_size: Option<usize>,
    /// Ring-buffer producer discipline.
    pub producer_type: ProducerType,
    /// Ring-buffer wait strategy.
    pub wait_strategy: WaitStrategy,
    /// Bounded-queue overflow policy.
    pub overflow: OverflowPolicy,
}

impl DispatcherConfig {
    /// A config with the given name and kind and default tuning.
    pub fn new(name: impl Into<String>, kind: DispatcherKind) -> Self {
        Self {
            name: name.into(),
            kind,
            worker_count: None,
            queue_size: None,
            producer_type: ProducerType::Multi,
            wait_strategy: WaitStrategy::Blocking,
            overflow: OverflowPolicy::Block,
        }
    }

    /// Resolve the worker count for a pool, applying auto-detection.
    pub fn resolved_worker_count(&self) -> usize {
        match self.worker_count {
            Some(n) => n.clamp(1, 64),
            None => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4);
                cpus.clamp(2, 16)
            }
        }
    }

    /// Check structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if let Some(0) = self.worker_count {
            return Err(ConfigError::ZeroWorkers {
                name: self.name.clone(),
            });
        }
        if let Some(0) = self.queue_size {
            return Err(ConfigError::ZeroQueue {
                name: self.name.clone(),
            });
        }
        if self.kind == DispatcherKind::RingBuffer {
            if self.queue_size.is_none() {
                return Err(ConfigError::MissingQueueSize {
                    name: self.name.clone(),
                });
            }
            if matches!(
                self.overflow,
                OverflowPolicy::DropOldest | OverflowPolicy::DropNewest
            ) {
                return Err(ConfigError::UnsupportedOverflow {
                    name: self.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Validate and construct the configured dispatcher.
    pub fn build(&self) -> Result<Arc<dyn Dispatcher>, ConfigError> {
        self.validate()?;
        let dispatcher: Arc<dyn Dispatcher> = match self.kind {
            DispatcherKind::Synchronous => Arc::new(SyncDispatcher::new(&self.name)),
            DispatcherKind::SingleThread => Arc::new(ThreadDispatcher::new(
                &self.name,
                self.queue_size,
                self.overflow,
            )),
            DispatcherKind::WorkPool => Arc::new(PoolDispatcher::new(
                &self.name,
                self.resolved_worker_count(),
                self.queue_size,
                self.overflow,
            )),
            DispatcherKind::RingBuffer => Arc::new(RingDispatcher::new(
                &self.name,
                self.queue_size.expect("validated above"),
                self.producer_type,
                self.wait_strategy,
                self.overflow,
            )),
        };
        Ok(dispatcher)
    }
}

/// Errors detected during [`DispatcherConfig::validate()`] or
/// environment assembly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The dispatcher name is empty.
    EmptyName,
    /// Two dispatchers share a name.
    DuplicateName {
        /// The colliding name.
        name: String,
    },
    /// `worker_count` was explicitly zero.
    ZeroWorkers {
        /// Dispatcher name.
        name: String,
    },
    /// `queue_size` was explicitly zero.
    ZeroQueue {
        /// Dispatcher name.
        name: String,
    },
    /// Ring buffers require a capacity.
    MissingQueueSize {
        /// Dispatcher name.
        name: String,
    },
    /// Ring buffers cannot drop entries; only `Block` and `Error`.
    UnsupportedOverflow {
        /// Dispatcher name.
        name: String,
    },
    /// The environment's default dispatcher name is not registered.
    UnknownDefault {
        /// The missing name.
        name: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyName => write!(f, "dispatcher name must not be empty"),
            Self::DuplicateName { name } => write!(f, "duplicate dispatcher name '{name}'"),
            Self::ZeroWorkers { name } => {
                write!(f, "dispatcher '{name}': worker_count must be at least 1")
            }
            Self::ZeroQueue { name } => {
                write!(f, "dispatcher '{name}': queue_size must be at least 1")
            }
            Self::MissingQueueSize { name } => {
                write!(f, "dispatcher '{name}': ring buffers require a queue_size")
            }
            Self::UnsupportedOverflow { name } => write!(
                f,
                "dispatcher '{name}': ring buffers support only Block or Error overflow"
            ),
            Self::UnknownDefault { name } => {
                write!(f, "default dispatcher '{name}' is not registered")
            }
        }
    }
}

impl Error for ConfigError {}
