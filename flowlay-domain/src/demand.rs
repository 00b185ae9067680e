//! Saturating demand counter.
//!
//! Tracks how many items a consumer has authorized but not yet received.
//! Adding saturates at [`UNBOUNDED`]; producing saturates at zero. Once the
//! counter reaches [`UNBOUNDED`] it stays there; that value is the
//! sentinel for the unbounded fast path and production no longer decrements.

use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Sentinel for "consumer requested everything"; demand accounting is
/// bypassed once this is reached.
pub const UNBOUNDED: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// DemandCounter
// ---------------------------------------------------------------------------

/// Lock-free counter of outstanding consumer demand.
///
/// Two writers touch it from different threads: the consumer adds via
/// `request(n)`, the poll agent subtracts what it delivered. Both sides use
/// compare-and-swap loops with saturating arithmetic, so the counter can
/// never underflow below zero or silently wrap.
#[derive(Debug, Default)]
pub struct DemandCounter {
    // ---
    requested: AtomicU64,
}

// ---

impl DemandCounter {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    // ---

    /// Add `n` to outstanding demand, clamping at [`UNBOUNDED`].
    ///
    /// Returns the new value.
    pub fn add(&self, n: u64) -> u64 {
        // ---
        let mut current = self.requested.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = current.saturating_add(n);
            match self.requested.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    // ---

    /// Subtract `n` delivered items, clamping at zero.
    ///
    /// A counter pinned at [`UNBOUNDED`] is left untouched. Returns the new
    /// value.
    pub fn produced(&self, n: u64) -> u64 {
        // ---
        let mut current = self.requested.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = current.saturating_sub(n);
            match self.requested.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    // ---

    /// Pin the counter at [`UNBOUNDED`].
    pub fn set_unbounded(&self) {
        self.requested.store(UNBOUNDED, Ordering::Release);
    }

    // ---

    pub fn get(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    // ---

    pub fn is_unbounded(&self) -> bool {
        self.get() == UNBOUNDED
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
