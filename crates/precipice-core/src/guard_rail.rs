//! Guard rail: the admission point for one guarded target
//!
//! A guard rail composes an ordered list of [`BackPressure`] mechanisms with
//! the target's [`CountMetrics`] and a [`Clock`]:
//!
//! ```text
//!   acquire_permits(n)           release_permits(n, outcome)
//!         |                                |
//!         v                                v
//!   [limiter] -> [breaker] -> ...     metrics.add(outcome)
//!         |  refused?                      |
//!         v                                v
//!   roll back earlier mechanisms     every mechanism learns the outcome
//!   metrics.add_rejections(reason)
//! ```
//!
//! A rejection is returned as a value; nothing panics and the guarded
//! operation never runs.

use crate::backpressure::BackPressure;
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{Clock, SystemClock};
use crate::config::{GuardRailConfig, MetricsConfig};
use crate::error::ResilienceError;
use crate::limiter::PermitLimiter;
use crate::metrics::CountMetrics;
use crate::outcome::{Outcome, Rejected};
use crate::promise::Promise;
use std::sync::Arc;

/// Admission control for one guarded target
pub struct GuardRail<R: Outcome> {
    name: String,
    metrics: Arc<CountMetrics<R>>,
    mechanisms: Vec<Arc<dyn BackPressure<R>>>,
    limiter: Option<Arc<PermitLimiter>>,
    breaker: Option<Arc<CircuitBreaker>>,
    clock: Arc<dyn Clock>,
}

impl<R: Outcome> GuardRail<R> {
    pub fn builder(name: impl Into<String>) -> GuardRailBuilder<R> {
        GuardRailBuilder::new(name)
    }

    /// Build the standard rail from config: a limiter followed by a breaker
    /// that reads this rail's metrics
    pub fn from_config(
        name: impl Into<String>,
        config: &GuardRailConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        let name = name.into();

        let metrics = Arc::new(CountMetrics::new(&config.metrics, Arc::clone(&clock))?);
        let limiter = Arc::new(PermitLimiter::new(config.max_concurrency));
        let breaker = Arc::new(
            CircuitBreaker::new(config.breaker.clone(), metrics.clone())?.with_name(name.clone()),
        );

        GuardRailBuilder::new(name)
            .clock(clock)
            .metrics(metrics)
            .limiter(limiter)
            .breaker(breaker)
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &Arc<CountMetrics<R>> {
        &self.metrics
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The limiter, when the rail was built with one
    pub fn limiter(&self) -> Option<&Arc<PermitLimiter>> {
        self.limiter.as_ref()
    }

    /// The circuit breaker, when the rail was built with one
    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    /// Ask every mechanism, in order, for `permits`.
    ///
    /// On refusal the mechanisms that already granted are rolled back in
    /// reverse order and the rejection is counted.
    pub fn acquire_permits(&self, permits: u64, now_nanos: u64) -> Option<Rejected> {
        for (index, mechanism) in self.mechanisms.iter().enumerate() {
            if let Some(reason) = mechanism.acquire_permit(permits, now_nanos) {
                for granted in self.mechanisms[..index].iter().rev() {
                    granted.release_permit(permits, now_nanos);
                }
                self.metrics.add_rejections(reason, permits, now_nanos);
                tracing::debug!(rail = %self.name, permits, reason = %reason, "admission rejected");
                return Some(reason);
            }
        }
        None
    }

    /// Record the outcome and return permits to every mechanism
    pub fn release_permits(&self, permits: u64, outcome: R, now_nanos: u64) {
        self.metrics.add(outcome, permits, now_nanos);
        for mechanism in &self.mechanisms {
            mechanism.release_permit_with_result(permits, outcome, now_nanos);
        }
    }

    /// Return permits for work that was admitted but never ran
    pub fn release_permits_without_result(&self, permits: u64, now_nanos: u64) {
        for mechanism in self.mechanisms.iter().rev() {
            mechanism.release_permit(permits, now_nanos);
        }
    }

    /// Acquire permits and hand back a promise whose completion releases them.
    ///
    /// Whichever side wins the promise (normal completion or timeout)
    /// releases the permits exactly once, timestamped on this rail's clock.
    pub fn acquire_promise<T, E>(
        self: &Arc<Self>,
        permits: u64,
        now_nanos: u64,
    ) -> Result<Promise<R, T, E>, Rejected>
    where
        T: Send + Sync + 'static,
        E: Send + Sync + 'static,
    {
        if let Some(reason) = self.acquire_permits(permits, now_nanos) {
            return Err(reason);
        }
        let rail = Arc::clone(self);
        Ok(Promise::with_completion_hook(move |outcome| {
            let now = rail.clock.nano_time();
            rail.release_permits(permits, outcome, now);
        }))
    }
}

impl<R: Outcome> std::fmt::Debug for GuardRail<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardRail")
            .field("name", &self.name)
            .field("mechanisms", &self.mechanisms.len())
            .field("limiter", &self.limiter)
            .field("breaker", &self.breaker)
            .finish()
    }
}

/// Assembles a [`GuardRail`]; mechanisms are consulted in the order added
pub struct GuardRailBuilder<R: Outcome> {
    name: String,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<CountMetrics<R>>>,
    mechanisms: Vec<Arc<dyn BackPressure<R>>>,
    limiter: Option<Arc<PermitLimiter>>,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl<R: Outcome> GuardRailBuilder<R> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            clock: None,
            metrics: None,
            mechanisms: Vec::new(),
            limiter: None,
            breaker: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Metrics to record into. Defaults to [`MetricsConfig::default`] on the rail's clock.
    pub fn metrics(mut self, metrics: Arc<CountMetrics<R>>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn limiter(mut self, limiter: Arc<PermitLimiter>) -> Self {
        self.mechanisms.push(limiter.clone());
        self.limiter = Some(limiter);
        self
    }

    pub fn breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.mechanisms.push(breaker.clone());
        self.breaker = Some(breaker);
        self
    }

    /// Append a custom mechanism
    pub fn back_pressure(mut self, mechanism: Arc<dyn BackPressure<R>>) -> Self {
        self.mechanisms.push(mechanism);
        self
    }

    pub fn build(self) -> Result<GuardRail<R>, ResilienceError> {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()) as Arc<dyn Clock>);
        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(CountMetrics::new(&MetricsConfig::default(), Arc::clone(&clock))?),
        };

        tracing::debug!(rail = %self.name, mechanisms = self.mechanisms.len(), "guard rail built");
        Ok(GuardRail {
            name: self.name,
            metrics,
            mechanisms: self.mechanisms,
            limiter: self.limiter,
            breaker: self.breaker,
            clock,
        })
    }
}
