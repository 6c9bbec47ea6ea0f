//! Circuit breaker driven by rolling health
//!
//! The breaker has three states:
//! - Closed: calls are admitted; a failing result whose trailing health
//!   crosses a threshold opens the circuit
//! - Open: calls are refused except one trial call per back-off window; the next
//!   successful result closes the circuit
//! - ForcedOpen: set by an operator, every call is refused and health is
//!   ignored until [`CircuitBreaker::force_closed`]
//!
//! Admission is decided by atomic loads and compare-and-swaps only. The
//! health snapshot is pulled from a [`HealthGauge`] at most once per
//! `health_refresh_millis` and reused in between; the cached copy is written
//! only by the caller that won the CAS on the refresh timestamp. Replacing
//! the config swaps one `Arc`.

use crate::backpressure::BackPressure;
use crate::clock::nanos_to_millis;
use crate::config::BreakerConfig;
use crate::error::ResilienceError;
use crate::metrics::{HealthGauge, HealthSnapshot};
use crate::outcome::{Outcome, Rejected};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const FORCED_OPEN: u8 = 2;

/// Health has not been read yet
const NEVER_REFRESHED: u64 = u64::MAX;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through
    Closed,
    /// Calls are refused apart from periodic trial calls
    Open,
    /// Calls are refused until an operator closes the circuit
    ForcedOpen,
}

/// Circuit breaker for one guarded target
///
/// # Example
/// ```
/// use precipice_core::circuit_breaker::CircuitBreaker;
/// use precipice_core::config::{BreakerConfig, MetricsConfig};
/// use precipice_core::metrics::CountMetrics;
/// use precipice_core::outcome::{Rejected, Status};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let metrics = Arc::new(
///     CountMetrics::<Status>::with_start(&MetricsConfig::new(60, Duration::from_secs(1)), 0).unwrap(),
/// );
/// let breaker = CircuitBreaker::new(BreakerConfig::default(), metrics).unwrap();
///
/// assert_eq!(breaker.allow_call(0), None);
///
/// breaker.force_open();
/// assert_eq!(breaker.allow_call(0), Some(Rejected::ForcedOpen));
/// ```
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    last_tested_ms: AtomicU64,
    last_health_ms: AtomicU64,
    /// Copy of `config.back_off_time_millis` read on the admission path
    back_off_ms: AtomicU64,
    config: RwLock<Arc<BreakerConfig>>,
    health: RwLock<HealthSnapshot>,
    gauge: Arc<dyn HealthGauge>,
}

impl CircuitBreaker {
    /// Create a closed breaker reading health from `gauge`
    pub fn new(config: BreakerConfig, gauge: Arc<dyn HealthGauge>) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            name: "default".to_string(),
            state: AtomicU8::new(CLOSED),
            last_tested_ms: AtomicU64::new(0),
            last_health_ms: AtomicU64::new(NEVER_REFRESHED),
            back_off_ms: AtomicU64::new(config.back_off_time_millis),
            config: RwLock::new(Arc::new(config)),
            health: RwLock::new(HealthSnapshot::EMPTY),
            gauge,
        })
    }

    /// Name used in log fields
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::Acquire) {
            CLOSED => BreakerState::Closed,
            OPEN => BreakerState::Open,
            _ => BreakerState::ForcedOpen,
        }
    }

    /// Whether the circuit is open or forced open
    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) != CLOSED
    }

    /// Refuse every call until [`force_closed`](Self::force_closed)
    pub fn force_open(&self) {
        self.state.store(FORCED_OPEN, Ordering::Release);
        tracing::info!(target_name = %self.name, "circuit forced open");
    }

    /// Close the circuit and resume health evaluation
    pub fn force_closed(&self) {
        self.state.store(CLOSED, Ordering::Release);
        tracing::info!(target_name = %self.name, "circuit forced closed");
    }

    /// Current thresholds
    pub fn config(&self) -> Arc<BreakerConfig> {
        Arc::clone(&self.config.read())
    }

    /// Swap the thresholds; later decisions see the new config immediately
    pub fn set_config(&self, config: BreakerConfig) -> Result<(), ResilienceError> {
        config.validate()?;
        let back_off = config.back_off_time_millis;
        *self.config.write() = Arc::new(config);
        self.back_off_ms.store(back_off, Ordering::Release);
        tracing::debug!(target_name = %self.name, "breaker config replaced");
        Ok(())
    }

    /// Most recently cached health snapshot
    pub fn cached_health(&self) -> HealthSnapshot {
        *self.health.read()
    }

    /// Decide whether a call may proceed at `now_nanos`
    pub fn allow_call(&self, now_nanos: u64) -> Option<Rejected> {
        match self.state.load(Ordering::Acquire) {
            CLOSED => None,
            FORCED_OPEN => Some(Rejected::ForcedOpen),
            _ => {
                let now_ms = nanos_to_millis(now_nanos);
                let back_off = self.back_off_ms.load(Ordering::Acquire);
                let last_tested = self.last_tested_ms.load(Ordering::Acquire);

                if now_ms < last_tested.saturating_add(back_off) {
                    return Some(Rejected::CircuitOpen);
                }
                // One trial call per elapsed back-off window
                if self
                    .last_tested_ms
                    .compare_exchange(last_tested, now_ms, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return Some(Rejected::CircuitOpen);
                }
                tracing::debug!(target_name = %self.name, now_ms, "admitting trial call through open circuit");
                None
            }
        }
    }

    /// Feed a completed call's outcome into the state machine
    pub fn inform_result<R: Outcome>(&self, outcome: R, now_nanos: u64) {
        let state = self.state.load(Ordering::Acquire);

        if outcome.is_success() {
            if state == OPEN
                && self
                    .state
                    .compare_exchange(OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                tracing::info!(target_name = %self.name, outcome = ?outcome, "circuit closed");
            }
            return;
        }

        if state != CLOSED {
            return;
        }

        let now_ms = nanos_to_millis(now_nanos);
        let config = self.config();
        let health = self.refresh_health(&config, now_ms, now_nanos);

        if Self::should_open(&config, &health) {
            self.last_tested_ms.store(now_ms, Ordering::Release);
            if self
                .state
                .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::info!(
                    target_name = %self.name,
                    failures = health.failures,
                    total = health.total,
                    failure_percentage = health.failure_percentage(),
                    "circuit opened"
                );
            }
        }
    }

    fn should_open(config: &BreakerConfig, health: &HealthSnapshot) -> bool {
        health.failures > config.failure_threshold
            || (health.failure_percentage() > u64::from(config.failure_percentage_threshold)
                && health.total > config.sample_size_threshold)
    }

    /// Return the cached snapshot, pulling a fresh one if the refresh interval has passed.
    ///
    /// Only the caller that wins the CAS on the refresh timestamp reads the gauge.
    fn refresh_health(&self, config: &BreakerConfig, now_ms: u64, now_nanos: u64) -> HealthSnapshot {
        let last = self.last_health_ms.load(Ordering::Acquire);
        let due = last == NEVER_REFRESHED || now_ms >= last.saturating_add(config.health_refresh_millis);

        if due
            && self
                .last_health_ms
                .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            let health = self.gauge.health(config.trailing_period(), now_nanos);
            *self.health.write() = health;
            return health;
        }
        *self.health.read()
    }
}

impl<R: Outcome> BackPressure<R> for CircuitBreaker {
    fn acquire_permit(&self, _permits: u64, now_nanos: u64) -> Option<Rejected> {
        self.allow_call(now_nanos)
    }

    fn release_permit(&self, _permits: u64, _now_nanos: u64) {}

    fn release_permit_with_result(&self, _permits: u64, outcome: R, now_nanos: u64) {
        self.inform_result(outcome, now_nanos);
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Status;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    const MS: u64 = 1_000_000;

    /// Gauge returning canned snapshots per timestamp
    #[derive(Default)]
    struct ScriptedGauge {
        snapshots: Mutex<HashMap<u64, HealthSnapshot>>,
        reads: Mutex<Vec<(Duration, u64)>>,
    }

    impl ScriptedGauge {
        fn at(&self, now_nanos: u64, snapshot: HealthSnapshot) {
            self.snapshots.lock().insert(now_nanos, snapshot);
        }
    }

    impl HealthGauge for ScriptedGauge {
        fn health(&self, trailing: Duration, now_nanos: u64) -> HealthSnapshot {
            self.reads.lock().push((trailing, now_nanos));
            self.snapshots
                .lock()
                .get(&now_nanos)
                .copied()
                .unwrap_or(HealthSnapshot::EMPTY)
        }
    }

    fn failing(total: u64, failures: u64) -> HealthSnapshot {
        HealthSnapshot::new(total, total, failures, 0)
    }

    fn new_breaker(config: BreakerConfig) -> (CircuitBreaker, Arc<ScriptedGauge>) {
        let gauge = Arc::new(ScriptedGauge::default());
        let breaker = CircuitBreaker::new(config, gauge.clone()).unwrap();
        (breaker, gauge)
    }

    #[test]
    fn test_closed_by_default() {
        let config = BreakerConfig::builder()
            .failure_threshold(20)
            .back_off_time_millis(5000)
            .build()
            .unwrap();
        let (breaker, _) = new_breaker(config);
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.allow_call(0), None);
    }

    #[test]
    fn test_opens_only_when_failures_exceed_threshold() {
        let config = BreakerConfig::builder()
            .failure_threshold(5)
            .back_off_time_millis(5000)
            .build()
            .unwrap();
        let (breaker, gauge) = new_breaker(config);

        gauge.at(501 * MS, failing(10_000, 5));
        breaker.inform_result(Status::Error, 501 * MS);
        assert!(!breaker.is_open());

        gauge.at(1002 * MS, failing(10_000, 6));
        breaker.inform_result(Status::Error, 1002 * MS);
        assert!(breaker.is_open());
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_open_circuit_closes_after_success() {
        let config = BreakerConfig::builder()
            .failure_threshold(5)
            .trailing_period_millis(1000)
            .build()
            .unwrap();
        let (breaker, gauge) = new_breaker(config);

        gauge.at(501 * MS, failing(1000, 6));
        breaker.inform_result(Status::Error, 501 * MS);
        assert!(breaker.is_open());

        breaker.inform_result(Status::Success, 501 * MS);
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_percentage_rule_needs_sample_size() {
        let config = BreakerConfig::builder()
            .failure_percentage_threshold(50)
            .sample_size_threshold(10)
            .build()
            .unwrap();

        // 100% failing, but only 10 samples
        let (breaker, gauge) = new_breaker(config.clone());
        gauge.at(0, failing(10, 10));
        breaker.inform_result(Status::Error, 0);
        assert!(!breaker.is_open());

        let (breaker, gauge) = new_breaker(config);
        gauge.at(0, failing(11, 6));
        breaker.inform_result(Status::Error, 0);
        assert!(breaker.is_open());
    }

    #[test]
    fn test_success_never_opens() {
        let config = BreakerConfig::builder().failure_threshold(0).build().unwrap();
        let (breaker, gauge) = new_breaker(config);
        gauge.at(0, failing(100, 100));

        breaker.inform_result(Status::Success, 0);
        assert!(!breaker.is_open());
        assert!(gauge.reads.lock().is_empty());
    }

    #[test]
    fn test_health_cached_between_refreshes() {
        let config = BreakerConfig::builder()
            .failure_threshold(10)
            .trailing_period_millis(1000)
            .build()
            .unwrap();
        let (breaker, gauge) = new_breaker(config);

        gauge.at(501 * MS, failing(1000, 6));
        breaker.inform_result(Status::Error, 501 * MS);
        assert!(!breaker.is_open());

        // Within the refresh interval the gauge is not consulted again
        breaker.inform_result(Status::Error, 800 * MS);
        assert_eq!(gauge.reads.lock().len(), 1);
        assert_eq!(breaker.cached_health(), failing(1000, 6));

        breaker.inform_result(Status::Error, 1001 * MS);
        assert_eq!(gauge.reads.lock().len(), 2);
        assert_eq!(
            gauge.reads.lock()[1],
            (Duration::from_millis(1000), 1001 * MS)
        );
    }

    #[test]
    fn test_setting_config_takes_effect() {
        let config = BreakerConfig::builder()
            .failure_threshold(10)
            .trailing_period_millis(1000)
            .build()
            .unwrap();
        let (breaker, gauge) = new_breaker(config);

        gauge.at(501 * MS, failing(1000, 6));
        breaker.inform_result(Status::Error, 501 * MS);
        assert!(!breaker.is_open());

        let stricter = BreakerConfig::builder()
            .failure_threshold(5)
            .trailing_period_millis(2000)
            .build()
            .unwrap();
        breaker.set_config(stricter.clone()).unwrap();
        assert_eq!(*breaker.config(), stricter);

        // Cached snapshot, new threshold
        breaker.inform_result(Status::Error, 501 * MS);
        assert!(breaker.is_open());
    }

    #[test]
    fn test_back_off_change_applies_to_next_admission() {
        let config = BreakerConfig::builder()
            .failure_threshold(0)
            .back_off_time_millis(5000)
            .build()
            .unwrap();
        let (breaker, gauge) = new_breaker(config);
        gauge.at(0, failing(1, 1));
        breaker.inform_result(Status::Error, 0);
        assert_eq!(breaker.allow_call(1000 * MS), Some(Rejected::CircuitOpen));

        let mut shorter = (*breaker.config()).clone();
        shorter.back_off_time_millis = 500;
        breaker.set_config(shorter).unwrap();
        assert_eq!(breaker.allow_call(1000 * MS), None);
    }

    #[test]
    fn test_set_config_validates() {
        let (breaker, _) = new_breaker(BreakerConfig::default());
        let bad = BreakerConfig {
            failure_percentage_threshold: 150,
            ..Default::default()
        };
        assert!(breaker.set_config(bad).is_err());
        assert_eq!(*breaker.config(), BreakerConfig::default());
    }

    #[test]
    fn test_trial_call_allowed_after_back_off() {
        let config = BreakerConfig::builder()
            .failure_threshold(10)
            .trailing_period_millis(5000)
            .build()
            .unwrap();
        let (breaker, gauge) = new_breaker(config);

        assert_eq!(breaker.allow_call(0), None);

        gauge.at(1000 * MS, failing(10_000, 11));
        breaker.inform_result(Status::Error, 1000 * MS);

        assert_eq!(breaker.allow_call(1999 * MS), Some(Rejected::CircuitOpen));
        assert!(breaker.is_open());

        assert_eq!(breaker.allow_call(2001 * MS), None);
        assert!(breaker.is_open());

        // Window restarts at the trial call
        assert_eq!(breaker.allow_call(2500 * MS), Some(Rejected::CircuitOpen));
        assert_eq!(breaker.allow_call(3001 * MS), None);
    }

    #[test]
    fn test_single_trial_call_under_contention() {
        let config = BreakerConfig::builder().failure_threshold(0).build().unwrap();
        let (breaker, gauge) = new_breaker(config);
        gauge.at(0, failing(1, 1));
        breaker.inform_result(Status::Error, 0);
        assert!(breaker.is_open());

        let breaker = Arc::new(breaker);
        let admitted = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&breaker);
                let a = Arc::clone(&admitted);
                std::thread::spawn(move || {
                    if b.allow_call(1500 * MS).is_none() {
                        a.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }
        assert_eq!(admitted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_forced_open_rejects_and_ignores_health() {
        let config = BreakerConfig::builder()
            .failure_threshold(10)
            .trailing_period_millis(5000)
            .back_off_time_millis(1000)
            .build()
            .unwrap();
        let (breaker, _) = new_breaker(config);

        assert_eq!(breaker.allow_call(0), None);

        breaker.force_open();
        assert_eq!(breaker.allow_call(2), Some(Rejected::ForcedOpen));
        assert!(breaker.is_open());

        // Success does not close a forced circuit
        breaker.inform_result(Status::Success, 10_000 * MS);
        assert_eq!(breaker.state(), BreakerState::ForcedOpen);
        assert_eq!(breaker.allow_call(10_000 * MS), Some(Rejected::ForcedOpen));

        breaker.force_closed();
        assert_eq!(breaker.allow_call(3), None);
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_back_pressure_impl_routes_results() {
        let config = BreakerConfig::builder().failure_threshold(1).build().unwrap();
        let (breaker, gauge) = new_breaker(config);
        gauge.at(0, failing(2, 2));

        assert_eq!(BackPressure::<Status>::acquire_permit(&breaker, 1, 0), None);
        breaker.release_permit_with_result(1, Status::Error, 0);
        assert_eq!(
            BackPressure::<Status>::acquire_permit(&breaker, 1, 0),
            Some(Rejected::CircuitOpen)
        );
    }
}
