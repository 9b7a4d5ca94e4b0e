//! Signal and lifecycle primitives.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::StreamError;

/// A discrete event on a publisher→subscriber edge.
///
/// Only one terminal (`Error` or `Complete`) may ever be delivered per
/// edge; [`Downstream`](crate::edge::Downstream) enforces that.
#[derive(Clone, Debug)]
pub enum Signal<T> {
    /// A value.
    Next(T),
    /// Terminal failure.
    Error(StreamError),
    /// Terminal completion.
    Complete,
}

impl<T> Signal<T> {
    /// Whether this signal terminates its edge.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Next(_))
    }
}

/// Lifecycle of an operator node or edge.
///
/// Transitions are monotonic: `Ready → Subscribed → Running` and from
/// any of those into exactly one of the three terminal states. A node
/// never leaves a terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Lifecycle {
    /// Created, no downstream subscriber yet.
    Ready = 0,
    /// Downstream subscriber bound.
    Subscribed = 1,
    /// First signal observed.
    Running = 2,
    /// Terminal: upstream completed.
    Completed = 3,
    /// Terminal: upstream errored.
    Errored = 4,
    /// Terminal: downstream cancelled.
    Cancelled = 5,
}

impl Lifecycle {
    /// Whether this state is one of the three terminals.
    pub fn is_terminal(self) -> bool {
        self >= Self::Completed
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Ready,
            1 => Self::Subscribed,
            2 => Self::Running,
            3 => Self::Completed,
            4 => Self::Errored,
            _ => Self::Cancelled,
        }
    }
}

/// Atomic holder for a [`Lifecycle`] with monotonic transitions.
///
/// The first terminal transition wins; later attempts fail and report
/// the state that got there first.
pub struct StateCell {
    state: AtomicU8,
}

// Compile-time assertion: StateCell must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<StateCell>();
};

impl StateCell {
    /// A cell starting at [`Lifecycle::Ready`].
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(Lifecycle::Ready as u8),
        }
    }

    /// Current state.
    pub fn get(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the cell has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.get().is_terminal()
    }

    /// Advance to a non-terminal `target` if the current state is
    /// earlier. Returns `true` when the cell moved (or already was at
    /// `target`).
    pub fn advance(&self, target: Lifecycle) -> bool {
        debug_assert!(!target.is_terminal());
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            if current >= target as u8 {
                return current == target as u8;
            }
            match self.state.compare_exchange_weak(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Move into terminal state `target`. Returns `true` exactly once
    /// per cell: the caller that wins the race owns terminal delivery.
    pub fn terminate(&self, target: Lifecycle) -> bool {
        debug_assert!(target.is_terminal());
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            if Lifecycle::from_u8(current).is_terminal() {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StateCell({:?})", self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic() {
        let cell = StateCell::new();
        assert!(cell.advance(Lifecycle::Subscribed));
        assert!(cell.advance(Lifecycle::Running));
        // Going backwards is refused.
        assert!(!cell.advance(Lifecycle::Subscribed));
        assert_eq!(cell.get(), Lifecycle::Running);
    }

    #[test]
    fn first_terminal_wins() {
        let cell = StateCell::new();
        assert!(cell.terminate(Lifecycle::Completed));
        assert!(!cell.terminate(Lifecycle::Errored));
        assert!(!cell.terminate(Lifecycle::Cancelled));
        assert_eq!(cell.get(), Lifecycle::Completed);
    }

    #[test]
    fn advance_after_terminal_is_refused() {
        let cell = StateCell::new();
        cell.terminate(Lifecycle::Cancelled);
        assert!(!cell.advance(Lifecycle::Running));
        assert_eq!(cell.get(), Lifecycle::Cancelled);
    }

    #[test]
    fn signal_terminal_classification() {
        assert!(!Signal::Next(1).is_terminal());
        assert!(Signal::<i32>::Complete.is_terminal());
        assert!(Signal::<i32>::Error(StreamError::Fatal("x".into())).is_terminal());
    }
}
