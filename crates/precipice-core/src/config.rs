//! Configuration for breakers, metrics and guard rails
//!
//! All structs deserialize from TOML with per-field defaults, so a file only
//! needs the values it overrides:
//!
//! ```
//! use precipice_core::config::GuardRailConfig;
//!
//! let config = GuardRailConfig::from_toml_str(r#"
//!     max_concurrency = 64
//!
//!     [breaker]
//!     failure_percentage_threshold = 25
//!     back_off_time_millis = 2000
//!
//!     [metrics]
//!     slots_to_track = 120
//!     resolution_millis = 500
//! "#).unwrap();
//!
//! assert_eq!(config.max_concurrency, 64);
//! assert_eq!(config.breaker.failure_percentage_threshold, 25);
//! assert_eq!(config.breaker.sample_size_threshold, 10);
//! ```

use crate::error::ResilienceError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest slot width the rolling metrics accept
pub const MIN_RESOLUTION_MILLIS: u64 = 100;

/// Default concurrency level when none is configured
pub const DEFAULT_MAX_CONCURRENCY: u64 = (i32::MAX / 2) as u64;

/// Failure count that never trips; TOML integers are signed 64-bit
pub const UNBOUNDED_FAILURES: u64 = i64::MAX as u64;

/// Thresholds that drive the circuit breaker
///
/// A breaker opens on a failing result when the trailing snapshot shows more
/// than `failure_threshold` failures, or a failure percentage above
/// `failure_percentage_threshold` over more than `sample_size_threshold` calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Absolute failure count that opens the circuit
    pub failure_threshold: u64,

    /// Failure percentage (0-100) that opens the circuit
    pub failure_percentage_threshold: u32,

    /// Minimum sample size before the percentage rule applies
    pub sample_size_threshold: u64,

    /// Window the health snapshot covers
    pub trailing_period_millis: u64,

    /// Minimum interval between health snapshot refreshes
    pub health_refresh_millis: u64,

    /// Time an open circuit waits between trial calls
    pub back_off_time_millis: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: UNBOUNDED_FAILURES,
            failure_percentage_threshold: 50,
            sample_size_threshold: 10,
            trailing_period_millis: 5000,
            health_refresh_millis: 500,
            back_off_time_millis: 1000,
        }
    }
}

impl BreakerConfig {
    pub fn builder() -> BreakerConfigBuilder {
        BreakerConfigBuilder::default()
    }

    pub fn trailing_period(&self) -> Duration {
        Duration::from_millis(self.trailing_period_millis)
    }

    /// Validate the thresholds
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_percentage_threshold > 100 {
            return Err(ResilienceError::InvalidConfig(format!(
                "failure_percentage_threshold must be <= 100, got {}",
                self.failure_percentage_threshold
            )));
        }
        if self.trailing_period_millis == 0 {
            return Err(ResilienceError::InvalidConfig(
                "trailing_period_millis must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fluent builder for [`BreakerConfig`]
#[derive(Debug, Clone, Default)]
pub struct BreakerConfigBuilder {
    config: BreakerConfig,
}

impl BreakerConfigBuilder {
    pub fn failure_threshold(mut self, failure_threshold: u64) -> Self {
        self.config.failure_threshold = failure_threshold;
        self
    }

    pub fn failure_percentage_threshold(mut self, failure_percentage_threshold: u32) -> Self {
        self.config.failure_percentage_threshold = failure_percentage_threshold;
        self
    }

    pub fn sample_size_threshold(mut self, sample_size_threshold: u64) -> Self {
        self.config.sample_size_threshold = sample_size_threshold;
        self
    }

    pub fn trailing_period_millis(mut self, trailing_period_millis: u64) -> Self {
        self.config.trailing_period_millis = trailing_period_millis;
        self
    }

    pub fn health_refresh_millis(mut self, health_refresh_millis: u64) -> Self {
        self.config.health_refresh_millis = health_refresh_millis;
        self
    }

    pub fn back_off_time_millis(mut self, back_off_time_millis: u64) -> Self {
        self.config.back_off_time_millis = back_off_time_millis;
        self
    }

    /// Build and validate the config
    pub fn build(self) -> Result<BreakerConfig, ResilienceError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Shape of the rolling metrics buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Number of slots in the circular buffer
    pub slots_to_track: usize,

    /// Width of one slot
    pub resolution_millis: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            slots_to_track: 3600,
            resolution_millis: 1000,
        }
    }
}

impl MetricsConfig {
    pub fn new(slots_to_track: usize, resolution: Duration) -> Self {
        Self {
            slots_to_track,
            resolution_millis: resolution.as_millis() as u64,
        }
    }

    /// Total time covered by the buffer
    pub fn span(&self) -> Duration {
        Duration::from_millis(self.resolution_millis.saturating_mul(self.slots_to_track as u64))
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.slots_to_track == 0 {
            return Err(ResilienceError::InvalidConfig(
                "slots_to_track must be at least 1".to_string(),
            ));
        }
        if self.resolution_millis < MIN_RESOLUTION_MILLIS {
            return Err(ResilienceError::InvalidConfig(format!(
                "Too low of resolution: [{} milliseconds]. {} milliseconds is the minimum resolution.",
                self.resolution_millis, MIN_RESOLUTION_MILLIS
            )));
        }
        Ok(())
    }
}

/// Everything needed to assemble a guard rail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardRailConfig {
    /// Maximum number of permits in flight
    pub max_concurrency: u64,

    pub breaker: BreakerConfig,

    pub metrics: MetricsConfig,
}

impl Default for GuardRailConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            breaker: BreakerConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl GuardRailConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(contents: &str) -> Result<Self, ResilienceError> {
        let config: GuardRailConfig =
            toml::from_str(contents).map_err(|e| ResilienceError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ResilienceError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ResilienceError::ConfigParse(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Serialize to pretty TOML
    pub fn to_toml_string(&self) -> Result<String, ResilienceError> {
        toml::to_string_pretty(self).map_err(|e| ResilienceError::ConfigParse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        self.breaker.validate()?;
        self.metrics.validate()?;

        let span = self.metrics.span();
        if self.breaker.trailing_period() > span {
            return Err(ResilienceError::InvalidConfig(format!(
                "breaker trailing period {:?} exceeds metrics span {:?}",
                self.breaker.trailing_period(),
                span
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_breaker_defaults() {
        let config = BreakerConfig::default();
        assert_eq!(config.failure_threshold, UNBOUNDED_FAILURES);
        assert_eq!(config.failure_percentage_threshold, 50);
        assert_eq!(config.sample_size_threshold, 10);
        assert_eq!(config.trailing_period_millis, 5000);
        assert_eq!(config.health_refresh_millis, 500);
        assert_eq!(config.back_off_time_millis, 1000);
    }

    #[test]
    fn test_builder_overrides() {
        let config = BreakerConfig::builder()
            .failure_threshold(5)
            .trailing_period_millis(1000)
            .back_off_time_millis(250)
            .build()
            .unwrap();

        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.trailing_period_millis, 1000);
        assert_eq!(config.back_off_time_millis, 250);
        assert_eq!(config.failure_percentage_threshold, 50);
    }

    #[test]
    fn test_builder_rejects_bad_percentage() {
        let result = BreakerConfig::builder()
            .failure_percentage_threshold(101)
            .build();
        assert!(matches!(result, Err(ResilienceError::InvalidConfig(_))));
    }

    #[test]
    fn test_metrics_minimum_resolution() {
        let config = MetricsConfig::new(10, Duration::from_millis(99));
        assert!(config.validate().is_err());

        let config = MetricsConfig::new(10, Duration::from_millis(100));
        assert!(config.validate().is_ok());
        assert_eq!(config.span(), Duration::from_secs(1));
    }

    #[test]
    fn test_metrics_zero_slots() {
        let config = MetricsConfig::new(0, Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trailing_period_must_fit_span() {
        let config = GuardRailConfig {
            metrics: MetricsConfig::new(2, Duration::from_secs(1)),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ResilienceError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_toml_round_trip_and_defaults() {
        let config = GuardRailConfig::from_toml_str("max_concurrency = 8").unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.breaker, BreakerConfig::default());
        assert_eq!(config.metrics, MetricsConfig::default());

        let rendered = config.to_toml_string().unwrap();
        let parsed = GuardRailConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_toml_invalid_values_fail_fast() {
        let result = GuardRailConfig::from_toml_str(
            r#"
            [metrics]
            resolution_millis = 10
            "#,
        );
        assert!(matches!(result, Err(ResilienceError::InvalidConfig(_))));

        let result = GuardRailConfig::from_toml_str("max_concurrency = \"lots\"");
        assert!(matches!(result, Err(ResilienceError::ConfigParse(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrency = 3\n[breaker]\nfailure_threshold = 7").unwrap();

        let config = GuardRailConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.breaker.failure_threshold, 7);

        let missing = GuardRailConfig::from_file("/definitely/not/here.toml");
        assert!(matches!(missing, Err(ResilienceError::ConfigParse(_))));
    }
}
