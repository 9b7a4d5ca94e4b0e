//! Error types for the signal protocol.
//!
//! Errors travel downstream as a single `Error` terminal signal, so the
//! type must be cheap to clone (fan-out nodes deliver the same terminal
//! to every subscriber). User failures are wrapped in an `Arc` for that
//! reason. Kinds are organized by origin: protocol violations, argument
//! errors caught at construction, user-code failures, timeouts, queue
//! overflow, and internal invariant breakage.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A violation of the signal protocol on one edge.
///
/// Fatal to the offending edge: the operator that detects one emits it
/// downstream as an `Error` terminal and cancels its upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// `request(0)` — demand increments must be positive.
    ZeroRequest,
    /// A second terminal signal arrived on an edge that already saw one.
    DoubleTerminal,
    /// A `Next` arrived after a terminal signal on the same edge.
    NextAfterTerminal,
    /// A `Next` arrived with no demand credit to account for it.
    UnrequestedNext,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroRequest => write!(f, "request(0) is not a valid demand increment"),
            Self::DoubleTerminal => write!(f, "second terminal signal on the same edge"),
            Self::NextAfterTerminal => write!(f, "Next signal after a terminal"),
            Self::UnrequestedNext => write!(f, "Next signal exceeds issued demand"),
        }
    }
}

impl Error for ProtocolError {}

/// The error payload of an `Error` terminal signal.
#[derive(Clone, Debug)]
pub enum StreamError {
    /// The signal protocol was violated on this edge.
    Protocol(ProtocolError),
    /// An argument was invalid and the failure could not be surfaced at
    /// construction time (zero-sized buffer, empty source set, ...).
    IllegalArgument(String),
    /// A user-supplied function failed inside an operator. The upstream
    /// edge is cancelled when this is emitted.
    User(Arc<dyn Error + Send + Sync>),
    /// No activity within the configured bound.
    Timeout {
        /// The inactivity bound that was exceeded.
        idle: Duration,
    },
    /// A bounded queue (dispatcher or hot edge) rejected a signal.
    Overflow {
        /// Name of the saturated queue, for diagnostics.
        queue: String,
    },
    /// Internal invariant violation. Never swallowed by error-handling
    /// operators; also reported to the error sink.
    Fatal(String),
}

impl StreamError {
    /// Wrap a user-code failure.
    pub fn user<E>(err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::User(Arc::new(err))
    }

    /// Wrap a caught panic payload from a user-supplied function.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "user function panicked".to_string());
        Self::User(Arc::new(PanicError { message }))
    }

    /// Whether this error must never be swallowed by `ignore_errors` or
    /// `when` handlers.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Downcast the wrapped user error, if this is a `User` error of
    /// concrete type `E`.
    pub fn user_error<E: Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::User(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(p) => write!(f, "protocol violation: {p}"),
            Self::IllegalArgument(msg) => write!(f, "illegal argument: {msg}"),
            Self::User(e) => write!(f, "user function failed: {e}"),
            Self::Timeout { idle } => write!(f, "no activity within {idle:?}"),
            Self::Overflow { queue } => write!(f, "queue '{queue}' overflowed"),
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl Error for StreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Protocol(p) => Some(p),
            Self::User(e) => Some(e.as_ref() as &(dyn Error + 'static)),
            _ => None,
        }
    }
}

/// Carrier for a panic caught at the user-function barrier.
#[derive(Debug)]
struct PanicError {
    message: String,
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

impl Error for PanicError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct ParseFailure;

    impl fmt::Display for ParseFailure {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "not a number")
        }
    }

    impl Error for ParseFailure {}

    #[test]
    fn user_error_downcasts_to_concrete_type() {
        let err = StreamError::user(ParseFailure);
        assert!(err.user_error::<ParseFailure>().is_some());
        assert!(err.user_error::<std::io::Error>().is_none());
    }

    #[test]
    fn panic_payload_message_is_preserved() {
        let err = StreamError::from_panic(Box::new("boom".to_string()));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn only_fatal_is_fatal() {
        assert!(StreamError::Fatal("corrupt counter".into()).is_fatal());
        assert!(!StreamError::Protocol(ProtocolError::ZeroRequest).is_fatal());
        assert!(!StreamError::Timeout {
            idle: Duration::from_millis(50)
        }
        .is_fatal());
    }

    #[test]
    fn source_chains_through_user_errors() {
        let err = StreamError::user(ParseFailure);
        let source = err.source().expect("user error has a source");
        assert_eq!(source.to_string(), "not a number");
    }
}
