//! Runnable unit binding an action to its promise and deadline

use crate::error::ResilienceError;
use crate::outcome::Status;
use crate::promise::{panic_message, Promise};
use crate::timeout::{TimeoutTask, NO_TIMEOUT};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Action<T> = Box<dyn FnOnce(&CancellationToken) -> Result<T, ResilienceError> + Send>;

/// An admitted call waiting to run.
///
/// Running the task executes the action once and completes the promise with
/// `Success`, `Error`, or `Timeout` (when the action itself reports
/// [`ResilienceError::Timeout`]). If the deadline fires first the promise
/// completes with `Timeout` and the action's [`CancellationToken`] is
/// cancelled; an action that ignores the token simply has its late result
/// discarded.
pub struct ResilientTask<T> {
    action: Mutex<Option<Action<T>>>,
    promise: Promise<Status, T, ResilienceError>,
    token: CancellationToken,
    relative_timeout_millis: u64,
    start_nanos: u64,
    deadline_nanos: u64,
}

impl<T: Send + Sync + 'static> ResilientTask<T> {
    pub fn new<F>(
        action: F,
        promise: Promise<Status, T, ResilienceError>,
        relative_timeout_millis: u64,
        start_nanos: u64,
    ) -> Self
    where
        F: FnOnce(&CancellationToken) -> Result<T, ResilienceError> + Send + 'static,
    {
        let deadline_nanos = if relative_timeout_millis == NO_TIMEOUT {
            0
        } else {
            start_nanos.saturating_add(relative_timeout_millis.saturating_mul(1_000_000))
        };

        Self {
            action: Mutex::new(Some(Box::new(action))),
            promise,
            token: CancellationToken::new(),
            relative_timeout_millis,
            start_nanos,
            deadline_nanos,
        }
    }

    pub fn start_nanos(&self) -> u64 {
        self.start_nanos
    }

    pub fn relative_timeout_millis(&self) -> u64 {
        self.relative_timeout_millis
    }

    /// Token cancelled when the deadline fires
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Execute the action unless the promise already completed
    pub fn run(&self) {
        if self.promise.is_done() {
            return;
        }
        let action = self.action.lock().take();
        let Some(action) = action else {
            return;
        };

        let token = self.token.clone();
        let result = catch_unwind(AssertUnwindSafe(move || action(&token)))
            .unwrap_or_else(|payload| {
                Err(ResilienceError::Execution(format!(
                    "action panicked: {}",
                    panic_message(payload.as_ref())
                )))
            });

        match result {
            Ok(value) => {
                self.promise.complete(Status::Success, value);
            }
            Err(err @ ResilienceError::Timeout(_)) => {
                self.promise.complete_exceptionally(Status::Timeout, err);
            }
            Err(ResilienceError::Cancelled) if self.token.is_cancelled() => {
                // Deadline already completed the promise
            }
            Err(err) => {
                self.promise.complete_exceptionally(Status::Error, err);
            }
        }
    }
}

impl<T: Send + Sync + 'static> TimeoutTask for ResilientTask<T> {
    fn deadline_nanos(&self) -> u64 {
        self.deadline_nanos
    }

    fn on_timeout(&self) {
        if self.promise.is_done() {
            return;
        }
        let timeout = Duration::from_millis(self.relative_timeout_millis);
        if self
            .promise
            .complete_exceptionally(Status::Timeout, ResilienceError::Timeout(timeout))
        {
            tracing::debug!(timeout_ms = self.relative_timeout_millis, "task timed out");
        }
        self.token.cancel();
    }
}

impl<T> std::fmt::Debug for ResilientTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientTask")
            .field("relative_timeout_millis", &self.relative_timeout_millis)
            .field("deadline_nanos", &self.deadline_nanos)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}
