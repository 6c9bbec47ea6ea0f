//! Error types for admission control and completion

use crate::outcome::Rejected;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the precipice core
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResilienceError {
    /// Configuration was rejected at construction time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be read or parsed
    #[error("Failed to load configuration: {0}")]
    ConfigParse(String),

    /// Admission was refused before the operation started
    #[error("Rejected: {0}")]
    Rejected(Rejected),

    /// The guarded operation exceeded its deadline
    #[error("Operation timeout after {0:?}")]
    Timeout(Duration),

    /// A bounded wait on a future elapsed before it completed.
    ///
    /// The future itself is untouched and may still complete later.
    #[error("Wait on pending result timed out after {0:?}")]
    WaitTimedOut(Duration),

    /// The guarded operation failed
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The operation observed its cancellation signal and stopped
    #[error("Operation cancelled")]
    Cancelled,

    /// A timeout was scheduled on a service that is not running
    #[error("Timeout service '{0}' is not running")]
    SchedulerStopped(String),
}

impl ResilienceError {
    /// Check if this error is an admission rejection
    pub fn is_rejection(&self) -> bool {
        matches!(self, ResilienceError::Rejected(_))
    }

    /// Check if this error represents an operation deadline being exceeded
    pub fn is_timeout(&self) -> bool {
        matches!(self, ResilienceError::Timeout(_))
    }

    /// Check if this error should count against the circuit breaker
    pub fn should_trip_breaker(&self) -> bool {
        !matches!(
            self,
            ResilienceError::Rejected(_)
                | ResilienceError::InvalidConfig(_)
                | ResilienceError::ConfigParse(_)
                | ResilienceError::WaitTimedOut(_)
                | ResilienceError::SchedulerStopped(_)
        )
    }
}

impl From<Rejected> for ResilienceError {
    fn from(reason: Rejected) -> Self {
        ResilienceError::Rejected(reason)
    }
}
