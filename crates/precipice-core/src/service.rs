//! Call-site helpers over a guard rail
//!
//! [`RunService`] runs an action on the calling thread. [`CallService`]
//! admits the call, arms its deadline, and passes the task to a
//! caller-supplied spawner, so any executor (a thread pool, `std::thread`,
//! `tokio::task::spawn_blocking`) can run it.

use crate::error::ResilienceError;
use crate::guard_rail::GuardRail;
use crate::outcome::Status;
use crate::promise::Eventual;
use crate::task::ResilientTask;
use crate::timeout::TimeoutService;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Work handed to a [`CallService`] spawner
pub type Job = Box<dyn FnOnce() + Send + 'static>;

fn classify<T>(result: &Result<T, ResilienceError>) -> Status {
    match result {
        Ok(_) => Status::Success,
        Err(e) if e.is_timeout() => Status::Timeout,
        Err(_) => Status::Error,
    }
}

/// Runs guarded actions synchronously on the caller's thread
#[derive(Debug, Clone)]
pub struct RunService {
    guard_rail: Arc<GuardRail<Status>>,
}

impl RunService {
    pub fn new(guard_rail: Arc<GuardRail<Status>>) -> Self {
        Self { guard_rail }
    }

    pub fn guard_rail(&self) -> &Arc<GuardRail<Status>> {
        &self.guard_rail
    }

    /// Run `action` if admitted.
    ///
    /// A rejection comes back as [`ResilienceError::Rejected`] without running
    /// the action. If the action panics its permits are released with
    /// `Error` and the panic continues.
    pub fn run<T, F>(&self, action: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Result<T, ResilienceError>,
    {
        let clock = self.guard_rail.clock();
        if let Some(reason) = self.guard_rail.acquire_permits(1, clock.nano_time()) {
            return Err(reason.into());
        }

        match catch_unwind(AssertUnwindSafe(action)) {
            Ok(result) => {
                self.guard_rail
                    .release_permits(1, classify(&result), clock.nano_time());
                result
            }
            Err(payload) => {
                self.guard_rail
                    .release_permits(1, Status::Error, clock.nano_time());
                resume_unwind(payload)
            }
        }
    }
}

/// Submits guarded actions to an external executor with a deadline
pub struct CallService {
    guard_rail: Arc<GuardRail<Status>>,
    timeouts: Arc<TimeoutService>,
    spawner: Arc<dyn Fn(Job) + Send + Sync>,
}

impl CallService {
    pub fn new<S>(guard_rail: Arc<GuardRail<Status>>, timeouts: Arc<TimeoutService>, spawner: S) -> Self
    where
        S: Fn(Job) + Send + Sync + 'static,
    {
        Self {
            guard_rail,
            timeouts,
            spawner: Arc::new(spawner),
        }
    }

    pub fn guard_rail(&self) -> &Arc<GuardRail<Status>> {
        &self.guard_rail
    }

    /// Admit `action`, arm a `timeout_millis` deadline (or
    /// [`NO_TIMEOUT`](crate::timeout::NO_TIMEOUT)), and spawn it.
    ///
    /// The returned future completes exactly once with the action's result
    /// or with a timeout; either way the permits are released.
    pub fn call<T, F>(
        &self,
        action: F,
        timeout_millis: u64,
    ) -> Result<Eventual<Status, T, ResilienceError>, ResilienceError>
    where
        T: Send + Sync + 'static,
        F: FnOnce(&CancellationToken) -> Result<T, ResilienceError> + Send + 'static,
    {
        let now = self.guard_rail.clock().nano_time();
        let promise = self.guard_rail.acquire_promise(1, now)?;
        let future = promise.future();

        let task = Arc::new(ResilientTask::new(action, promise.clone(), timeout_millis, now));
        if let Err(err) = self.timeouts.schedule_timeout(task.clone(), timeout_millis, now) {
            // The action never ran: hand the permits back without an outcome
            if promise.disarm_completion_hook() {
                self.guard_rail
                    .release_permits_without_result(1, self.guard_rail.clock().nano_time());
            }
            tracing::warn!(rail = %self.guard_rail.name(), error = %err, "call not started");
            return Err(err);
        }

        (self.spawner)(Box::new(move || task.run()));
        Ok(future)
    }
}

impl std::fmt::Debug for CallService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallService")
            .field("guard_rail", &self.guard_rail.name())
            .field("timeouts", &self.timeouts)
            .finish()
    }
}
