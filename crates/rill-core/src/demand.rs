//! Saturating atomic demand accounting.
//!
//! Demand is the number of `Next` signals a subscriber has authorized.
//! It is represented as an unsigned counter with a reserved sentinel for
//! unbounded demand — never as a signed value that could underflow. All
//! updates are compare-and-swap loops; reads are acquire so an emitter
//! that observes credit also observes the request that granted it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel meaning "unbounded demand". Once a counter reaches this
/// value it stays there; claims no longer decrement.
pub const UNBOUNDED: u64 = u64::MAX;

/// A saturating demand counter for one subscription.
///
/// Invariants:
/// - The counter never wraps: additions saturate at [`UNBOUNDED`].
/// - A successful [`try_claim`](Demand::try_claim) of `n` means `n`
///   credits were present; the claim and the emission it authorizes are
///   accounted on the same edge.
pub struct Demand {
    pending: AtomicU64,
}

// Compile-time assertion: Demand must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Demand>();
};

impl Demand {
    /// A counter starting at zero credits.
    pub fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
        }
    }

    /// A counter that starts (and stays) unbounded.
    pub fn unbounded() -> Self {
        Self {
            pending: AtomicU64::new(UNBOUNDED),
        }
    }

    /// Current pending credit.
    pub fn current(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the counter has saturated to unbounded.
    pub fn is_unbounded(&self) -> bool {
        self.current() == UNBOUNDED
    }

    /// Add `n` credits, saturating at [`UNBOUNDED`]. Returns the credit
    /// that was pending before the addition.
    pub fn add(&self, n: u64) -> u64 {
        let mut current = self.pending.load(Ordering::Relaxed);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = current.saturating_add(n);
            match self.pending.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(previous) => return previous,
                Err(observed) => current = observed,
            }
        }
    }

    /// Claim `n` credits for emission. Returns `false` (and leaves the
    /// counter untouched) when fewer than `n` credits are pending. An
    /// unbounded counter always grants the claim without decrementing.
    pub fn try_claim(&self, n: u64) -> bool {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return true;
            }
            if current < n {
                return false;
            }
            match self.pending.compare_exchange_weak(
                current,
                current - n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}

impl Default for Demand {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Demand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = self.current();
        if current == UNBOUNDED {
            write!(f, "Demand(unbounded)")
        } else {
            write!(f, "Demand({current})")
        }
    }
}
