//! Permit limiter: bounded concurrency with a lock-free counter
//!
//! The limiter holds `capacity` permits. Acquiring `n` succeeds only when at
//! least `n` are available; a failed acquire changes nothing. Releases return
//! permits and never raise the count above capacity.

use crate::backpressure::BackPressure;
use crate::outcome::{Outcome, Rejected};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counting semaphore that never blocks
#[derive(Debug)]
pub struct PermitLimiter {
    /// Total permits
    capacity: u64,

    /// Permits not currently held
    available: AtomicU64,
}

impl PermitLimiter {
    /// Create a limiter with `capacity` permits. Zero capacity rejects every acquire.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            available: AtomicU64::new(capacity),
        }
    }

    /// Try to take `permits` without blocking.
    ///
    /// A zero-capacity limiter refuses every request, including one for zero permits.
    pub fn acquire(&self, permits: u64) -> bool {
        if self.capacity == 0 {
            tracing::trace!(requested = permits, "permit limiter has no capacity");
            return false;
        }
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            if current < permits {
                tracing::trace!(
                    requested = permits,
                    available = current,
                    "permit limiter exhausted"
                );
                return false;
            }
            match self.available.compare_exchange_weak(
                current,
                current - permits,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `permits` to the pool
    pub fn release(&self, permits: u64) {
        let capacity = self.capacity;
        let previous = self
            .available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_add(permits).min(capacity))
            })
            .unwrap_or(capacity);

        if previous.saturating_add(permits) > capacity {
            tracing::warn!(
                released = permits,
                available = previous,
                capacity,
                "released more permits than were held"
            );
        }
    }

    /// Permits currently free
    pub fn available(&self) -> u64 {
        self.available.load(Ordering::Acquire)
    }

    /// Permits currently held
    pub fn in_flight(&self) -> u64 {
        self.capacity - self.available().min(self.capacity)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

impl<R: Outcome> BackPressure<R> for PermitLimiter {
    fn acquire_permit(&self, permits: u64, _now_nanos: u64) -> Option<Rejected> {
        if self.acquire(permits) {
            None
        } else {
            Some(Rejected::MaxConcurrencyLevelExceeded)
        }
    }

    fn release_permit(&self, permits: u64, _now_nanos: u64) {
        self.release(permits);
    }

    fn release_permit_with_result(&self, permits: u64, _outcome: R, _now_nanos: u64) {
        self.release(permits);
    }
}
