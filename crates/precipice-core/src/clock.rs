//! Time sources
//!
//! Every time-dependent operation in the crate takes an explicit `now_nanos`
//! so that callers (and tests) control time. A [`Clock`] supplies those values
//! for the convenience entry points.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Supplies monotonic and wall-clock time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic nanoseconds since an arbitrary, fixed origin
    fn nano_time(&self) -> u64;

    /// Wall-clock milliseconds since the Unix epoch, for reporting only
    fn current_time_millis(&self) -> u64;
}

/// Clock backed by [`Instant`] and [`SystemTime`]
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn nano_time(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn current_time_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for deterministic tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
    epoch_millis: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at the given monotonic time
    pub fn new(start_nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(start_nanos),
            epoch_millis: AtomicU64::new(0),
        }
    }

    /// Set the monotonic time
    pub fn set_nanos(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }

    /// Advance monotonic and wall time by the given number of milliseconds
    pub fn advance_millis(&self, millis: u64) {
        self.nanos.fetch_add(millis * 1_000_000, Ordering::SeqCst);
        self.epoch_millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn nano_time(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }

    fn current_time_millis(&self) -> u64 {
        self.epoch_millis.load(Ordering::SeqCst)
    }
}

/// Convert monotonic nanoseconds to whole milliseconds
pub(crate) fn nanos_to_millis(nanos: u64) -> u64 {
    nanos / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.nano_time();
        let b = clock.nano_time();
        assert!(b >= a);
        assert!(clock.current_time_millis() > 0);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(5);
        clock.advance_millis(2);
        assert_eq!(clock.nano_time(), 2_000_005);
        assert_eq!(clock.current_time_millis(), 2);

        clock.set_nanos(42);
        assert_eq!(clock.nano_time(), 42);
    }
}
