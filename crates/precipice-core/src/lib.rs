//! Precipice Core: admission control and completion primitives
//!
//! # Overview
//!
//! This crate protects callers from overloaded or failing downstream
//! operations. It includes:
//!
//! - **Permit Limiter**: Bounds concurrent in-flight work with a lock-free counter
//! - **Circuit Breaker**: Stops traffic when trailing health crosses a threshold
//! - **Rolling Metrics**: Lock-free circular buffer of per-slot outcome and rejection counts
//! - **Guard Rail**: Gates every call through the mechanisms and routes outcomes back
//! - **Promise / Eventual**: Single-assignment result with exactly-once completion
//! - **Timeout Service**: Background deadline scheduler racing normal completion
//!
//! # Key Principles
//!
//! Admission never blocks: a refused call gets a [`Rejected`] value back and
//! never runs. Every time-dependent operation takes an explicit `now_nanos`,
//! so tests drive time with a [`ManualClock`]. Executors stay outside the
//! crate; background work runs only after an explicit start.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │ acquire_permits(n, now)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Guard Rail                        │
//! │  ┌──────────────┐   ┌────────────────┐  │
//! │  │ PermitLimiter│ → │ CircuitBreaker │  │  ← refused? roll back, count
//! │  └──────────────┘   └───────┬────────┘  │
//! │                             │ health    │
//! │                     ┌───────▼────────┐  │
//! │                     │  CountMetrics  │  │  ← rolling slots + totals
//! │                     └────────────────┘  │
//! └─────────────┬───────────────────────────┘
//!               │ Promise
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │   Work (your executor)  ⟷  Timeout      │  ← first completion wins
//! │                              Service    │
//! └─────────────┬───────────────────────────┘
//!               │ complete / timeout
//!               ▼
//!   release permits, record outcome, inform breaker
//! ```
//!
//! # Usage Example
//!
//! ```
//! use precipice_core::prelude::*;
//! use std::sync::Arc;
//!
//! let clock = Arc::new(ManualClock::new(0));
//! let config = GuardRailConfig {
//!     max_concurrency: 2,
//!     ..Default::default()
//! };
//! let rail = Arc::new(GuardRail::<Status>::from_config("inventory", &config, clock).unwrap());
//!
//! let promise = rail.acquire_promise::<u32, ResilienceError>(1, 0).unwrap();
//! let future = promise.future();
//!
//! promise.complete(Status::Success, 17);
//! assert_eq!(future.get().value(), Some(&17));
//! assert_eq!(rail.limiter().unwrap().available(), 2);
//! ```

pub mod backpressure;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard_rail;
pub mod limiter;
pub mod metrics;
pub mod outcome;
pub mod promise;
pub mod service;
pub mod task;
pub mod timeout;

// Re-export main types for convenience
pub use backpressure::BackPressure;
pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BreakerConfig, BreakerConfigBuilder, GuardRailConfig, MetricsConfig};
pub use error::ResilienceError;
pub use guard_rail::{GuardRail, GuardRailBuilder};
pub use limiter::PermitLimiter;
pub use metrics::{CountMetrics, HealthGauge, HealthSnapshot, IntervalCounts};
pub use outcome::{Outcome, Rejected, Status};
pub use promise::{
    reset_fallback_handler, set_fallback_handler, CallbackPanic, CompletionKind, Eventual, Promise,
    Settled,
};
pub use service::{CallService, Job, RunService};
pub use task::ResilientTask;
pub use timeout::{TimeoutService, TimeoutTask, NO_TIMEOUT};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use precipice_core::prelude::*;
/// ```
pub mod prelude {
    pub use super::backpressure::BackPressure;
    pub use super::circuit_breaker::{BreakerState, CircuitBreaker};
    pub use super::clock::{Clock, ManualClock, SystemClock};
    pub use super::config::{BreakerConfig, GuardRailConfig, MetricsConfig};
    pub use super::error::ResilienceError;
    pub use super::guard_rail::GuardRail;
    pub use super::limiter::PermitLimiter;
    pub use super::metrics::{CountMetrics, HealthSnapshot};
    pub use super::outcome::{Outcome, Rejected, Status};
    pub use super::promise::{CompletionKind, Eventual, Promise};
    pub use super::service::{CallService, RunService};
    pub use super::timeout::{TimeoutService, NO_TIMEOUT};
}
