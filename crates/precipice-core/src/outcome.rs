//! Result classifications
//!
//! Metrics and breakers are generic over the caller's [`Outcome`] type. The
//! set of variants must be closed and densely numbered: `ordinal()` returns a
//! value in `0..VARIANTS.len()` and is used to index counter arrays.
//! Admission refusals use the fixed [`Rejected`] set.

use std::fmt;

/// Classification of a completed guarded call
pub trait Outcome: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Every variant, ordered by ordinal
    const VARIANTS: &'static [Self];

    /// Dense index of this variant, `< VARIANTS.len()`
    fn ordinal(self) -> usize;

    /// Whether this outcome counts as a failure in health accounting
    fn is_failure(self) -> bool;

    /// Whether this outcome proves the downstream is responsive again
    fn is_success(self) -> bool {
        !self.is_failure()
    }

    /// Whether this outcome marks a deadline having elapsed
    fn is_timeout(self) -> bool {
        false
    }
}

/// Default outcome set for guarded calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    Error,
    Timeout,
}

impl Outcome for Status {
    const VARIANTS: &'static [Status] = &[Status::Success, Status::Error, Status::Timeout];

    fn ordinal(self) -> usize {
        match self {
            Status::Success => 0,
            Status::Error => 1,
            Status::Timeout => 2,
        }
    }

    fn is_failure(self) -> bool {
        !matches!(self, Status::Success)
    }

    fn is_timeout(self) -> bool {
        matches!(self, Status::Timeout)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => write!(f, "success"),
            Status::Error => write!(f, "error"),
            Status::Timeout => write!(f, "timeout"),
        }
    }
}

/// Reason admission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejected {
    /// No concurrency permits were available
    MaxConcurrencyLevelExceeded,
    /// The breaker is open and the back-off window has not elapsed
    CircuitOpen,
    /// The breaker was forced open by an operator
    ForcedOpen,
    /// Every target of a multi-target pattern refused the call
    AllServicesRejected,
}

impl Rejected {
    pub const VARIANT_COUNT: usize = 4;

    pub const ALL: [Rejected; 4] = [
        Rejected::MaxConcurrencyLevelExceeded,
        Rejected::CircuitOpen,
        Rejected::ForcedOpen,
        Rejected::AllServicesRejected,
    ];

    pub fn ordinal(self) -> usize {
        match self {
            Rejected::MaxConcurrencyLevelExceeded => 0,
            Rejected::CircuitOpen => 1,
            Rejected::ForcedOpen => 2,
            Rejected::AllServicesRejected => 3,
        }
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejected::MaxConcurrencyLevelExceeded => write!(f, "max concurrency level exceeded"),
            Rejected::CircuitOpen => write!(f, "circuit open"),
            Rejected::ForcedOpen => write!(f, "circuit forced open"),
            Rejected::AllServicesRejected => write!(f, "all services rejected"),
        }
    }
}
