//! Back-pressure mechanisms
//!
//! A guard rail consults an ordered list of mechanisms before admitting a
//! call. Each one may refuse with a [`Rejected`] reason; on refusal the rail
//! rolls back the mechanisms that already granted permits, in reverse order.
//! When the call finishes every mechanism is told the outcome.
//!
//! # Example
//!
//! ```
//! use precipice_core::backpressure::BackPressure;
//! use precipice_core::limiter::PermitLimiter;
//! use precipice_core::outcome::{Rejected, Status};
//!
//! let limiter = PermitLimiter::new(1);
//!
//! assert_eq!(BackPressure::<Status>::acquire_permit(&limiter, 1, 0), None);
//! assert_eq!(
//!     BackPressure::<Status>::acquire_permit(&limiter, 1, 0),
//!     Some(Rejected::MaxConcurrencyLevelExceeded)
//! );
//!
//! limiter.release_permit_with_result(1, Status::Success, 0);
//! assert_eq!(limiter.available(), 1);
//! ```

use crate::outcome::{Outcome, Rejected};

/// A mechanism that can refuse admission and learns the result of each call
pub trait BackPressure<R: Outcome>: Send + Sync {
    /// Try to take `permits`; `None` means admitted
    fn acquire_permit(&self, permits: u64, now_nanos: u64) -> Option<Rejected>;

    /// Give back permits taken for a call that never ran
    fn release_permit(&self, permits: u64, now_nanos: u64);

    /// Give back permits for a call that completed with `outcome`
    fn release_permit_with_result(&self, permits: u64, outcome: R, now_nanos: u64);
}
