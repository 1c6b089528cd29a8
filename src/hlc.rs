//! Hybrid logical clock backing CAS generation.
//!
//! Every mutation accepted by a partition receives a CAS value drawn from a
//! [`HybridClock`]. The clock packs a millisecond wall-clock reading into
//! the upper 48 bits and a logical counter into the lower 16, and advances
//! with `max(physical, last + 1)` so values are strictly monotone even when
//! the wall clock stalls or steps backwards.
//!
//! CAS ordering must agree with bySeqno ordering within a partition; the
//! checkpoint manager guarantees this by drawing from the clock while
//! holding the partition write lock.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

const LOGICAL_BITS: u32 = 16;

/// Strictly monotone hybrid logical clock.
///
/// Cheap to share: a single atomic word. One instance serves every
/// partition of a bucket.
#[derive(Debug, Default)]
pub struct HybridClock {
    state: AtomicU64,
}

impl HybridClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(physical_now()),
        }
    }

    /// Draw the next CAS value. Strictly greater than every value handed
    /// out before, across all callers.
    pub fn next(&self) -> u64 {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let candidate = physical_now().max(current + 1);
            match self.state.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(observed) => current = observed,
            }
        }
    }

    /// Fold a CAS value observed from a peer into the clock so future
    /// values sort after it.
    pub fn observe(&self, cas: u64) {
        self.state.fetch_max(cas, Ordering::AcqRel);
    }

    /// The most recently issued (or observed) value.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.state.load(Ordering::Acquire)
    }
}

fn physical_now() -> u64 {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    millis << LOGICAL_BITS
}
