//! Rolling count metrics
//!
//! Time is cut into fixed-width slots held in a circular buffer. Every slot
//! has one counter per [`Outcome`] variant and one per [`Rejected`] reason.
//! Writes touch only the slot for their timestamp; reads for a trailing
//! window sum the slots inside it. Unbounded totals are kept alongside and
//! never rotate.
//!
//! # Example
//!
//! ```
//! use precipice_core::metrics::CountMetrics;
//! use precipice_core::config::MetricsConfig;
//! use precipice_core::outcome::Status;
//! use std::time::Duration;
//!
//! let config = MetricsConfig::new(20, Duration::from_millis(100));
//! let metrics = CountMetrics::<Status>::with_start(&config, 0).unwrap();
//!
//! metrics.record(Status::Success, 1_000_000);
//! metrics.record(Status::Error, 2_000_000);
//!
//! let health = metrics.snapshot(Duration::from_secs(1), 2_000_000);
//! assert_eq!(health.total, 2);
//! assert_eq!(health.failure_percentage(), 50);
//! ```

mod buffer;
mod interval;

pub use interval::{IntervalCounts, Intervals};

use crate::clock::{Clock, SystemClock};
use crate::config::MetricsConfig;
use crate::error::ResilienceError;
use crate::outcome::{Outcome, Rejected};
use buffer::SlotBuffer;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Aggregate of outcomes and rejections over a trailing window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Outcomes plus rejections
    pub total: u64,
    /// Outcomes only
    pub non_rejected_total: u64,
    pub failures: u64,
    pub rejections: u64,
}

impl HealthSnapshot {
    pub const EMPTY: HealthSnapshot = HealthSnapshot {
        total: 0,
        non_rejected_total: 0,
        failures: 0,
        rejections: 0,
    };

    pub fn new(total: u64, non_rejected_total: u64, failures: u64, rejections: u64) -> Self {
        Self {
            total,
            non_rejected_total,
            failures,
            rejections,
        }
    }

    /// `floor(100 * failures / total)`, or 0 with no samples
    pub fn failure_percentage(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            ((self.failures as u128 * 100) / self.total as u128) as u64
        }
    }
}

/// Source of health snapshots for a circuit breaker
pub trait HealthGauge: Send + Sync {
    fn health(&self, trailing: Duration, now_nanos: u64) -> HealthSnapshot;
}

/// Rolling outcome and rejection counters for one guarded target
pub struct CountMetrics<R: Outcome> {
    buffer: SlotBuffer,
    totals: Box<[AtomicU64]>,
    failure_mask: Box<[bool]>,
    clock: Arc<dyn Clock>,
    _outcome: PhantomData<R>,
}

impl<R: Outcome> CountMetrics<R> {
    /// Create metrics whose slots start at the clock's current time
    pub fn new(config: &MetricsConfig, clock: Arc<dyn Clock>) -> Result<Self, ResilienceError> {
        let start = clock.nano_time();
        Self::build(config, clock, start)
    }

    /// Create metrics on a system clock with slots starting at `start_nanos`
    pub fn with_start(config: &MetricsConfig, start_nanos: u64) -> Result<Self, ResilienceError> {
        Self::build(config, Arc::new(SystemClock::new()), start_nanos)
    }

    fn build(
        config: &MetricsConfig,
        clock: Arc<dyn Clock>,
        start_nanos: u64,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        let width = R::VARIANTS.len() + Rejected::VARIANT_COUNT;
        let resolution_nanos = config.resolution_millis * 1_000_000;

        let mut failure_mask = vec![false; R::VARIANTS.len()];
        for outcome in R::VARIANTS {
            failure_mask[outcome.ordinal()] = outcome.is_failure();
        }

        Ok(Self {
            buffer: SlotBuffer::new(config.slots_to_track, width, resolution_nanos, start_nanos),
            totals: (0..width).map(|_| AtomicU64::new(0)).collect(),
            failure_mask: failure_mask.into_boxed_slice(),
            clock,
            _outcome: PhantomData,
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn resolution(&self) -> Duration {
        Duration::from_nanos(self.buffer.resolution_nanos())
    }

    /// Time covered by the whole buffer
    pub fn span(&self) -> Duration {
        Duration::from_nanos(self.buffer.resolution_nanos() * self.buffer.len() as u64)
    }

    /// Record a completed call
    pub fn record(&self, outcome: R, now_nanos: u64) {
        self.add(outcome, 1, now_nanos);
    }

    /// Record `count` calls completing with `outcome`
    pub fn add(&self, outcome: R, count: u64, now_nanos: u64) {
        self.add_counter(outcome.ordinal(), count, now_nanos);
    }

    /// Record a refused admission
    pub fn record_rejection(&self, reason: Rejected, now_nanos: u64) {
        self.add_rejections(reason, 1, now_nanos);
    }

    /// Record `count` refused permits
    pub fn add_rejections(&self, reason: Rejected, count: u64, now_nanos: u64) {
        self.add_counter(R::VARIANTS.len() + reason.ordinal(), count, now_nanos);
    }

    fn add_counter(&self, counter: usize, count: u64, now_nanos: u64) {
        self.totals[counter].fetch_add(count, Ordering::Relaxed);
        if !self.buffer.add(counter, count, now_nanos) {
            tracing::trace!(counter, now_nanos, "event older than its slot, kept in totals only");
        }
    }

    /// Health over the trailing window ending at `now_nanos`
    pub fn snapshot(&self, trailing: Duration, now_nanos: u64) -> HealthSnapshot {
        let sums = self.buffer.sum_window(trailing.as_nanos() as u64, now_nanos);
        let (outcomes, rejected) = sums.split_at(R::VARIANTS.len());

        let mut snapshot = HealthSnapshot::EMPTY;
        for (ordinal, count) in outcomes.iter().enumerate() {
            snapshot.non_rejected_total += count;
            if self.failure_mask[ordinal] {
                snapshot.failures += count;
            }
        }
        snapshot.rejections = rejected.iter().sum();
        snapshot.total = snapshot.non_rejected_total + snapshot.rejections;
        snapshot
    }

    /// Health over the trailing window ending at the clock's current time
    pub fn current_snapshot(&self, trailing: Duration) -> HealthSnapshot {
        self.snapshot(trailing, self.clock.nano_time())
    }

    /// Count of `outcome` in the trailing window
    pub fn count_for(&self, outcome: R, trailing: Duration, now_nanos: u64) -> u64 {
        self.buffer.sum_window(trailing.as_nanos() as u64, now_nanos)[outcome.ordinal()]
    }

    /// Count of `reason` rejections in the trailing window
    pub fn rejections_for(&self, reason: Rejected, trailing: Duration, now_nanos: u64) -> u64 {
        self.buffer.sum_window(trailing.as_nanos() as u64, now_nanos)
            [R::VARIANTS.len() + reason.ordinal()]
    }

    /// Count of `outcome` since creation
    pub fn total_count(&self, outcome: R) -> u64 {
        self.totals[outcome.ordinal()].load(Ordering::Relaxed)
    }

    /// Count of `reason` rejections since creation
    pub fn total_rejections(&self, reason: Rejected) -> u64 {
        self.totals[R::VARIANTS.len() + reason.ordinal()].load(Ordering::Relaxed)
    }

    /// Iterate the slot periods of the trailing window, oldest first
    pub fn intervals(&self, trailing: Duration, now_nanos: u64) -> Intervals<'_, R> {
        Intervals::new(&self.buffer, trailing.as_nanos() as u64, now_nanos)
    }
}

impl<R: Outcome> HealthGauge for CountMetrics<R> {
    fn health(&self, trailing: Duration, now_nanos: u64) -> HealthSnapshot {
        self.snapshot(trailing, now_nanos)
    }
}

impl<R: Outcome> std::fmt::Debug for CountMetrics<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountMetrics")
            .field("buffer", &self.buffer)
            .finish()
    }
}
