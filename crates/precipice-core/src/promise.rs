//! Single-assignment completion
//!
//! A [`Promise`] is the write side of a guarded call's result and an
//! [`Eventual`] the read side. Exactly one of `complete` and
//! `complete_exceptionally` wins; every later attempt returns `false` and
//! changes nothing. The winner stores the result, runs the completion hook
//! (the guard rail uses it to release permits), wakes blocked and async
//! readers, then fires the callbacks registered for the terminal kind.
//!
//! Each registered callback sits in a slot that is either armed or fired.
//! Completion and a racing registration both try to claim the slot with a
//! CAS, so a callback runs exactly once. Callbacks registered after
//! completion run immediately on the registering thread. A panicking
//! callback is caught and handed to the process-wide fallback handler; the
//! promise itself is unaffected.
//!
//! # Example
//!
//! ```
//! use precipice_core::promise::{CompletionKind, Promise};
//! use precipice_core::outcome::Status;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//!
//! let promise = Promise::<Status, u64, String>::new();
//! let future = promise.future();
//!
//! let seen = Arc::new(AtomicU64::new(0));
//! let s = Arc::clone(&seen);
//! future.on_success(move |v| s.store(*v, Ordering::SeqCst));
//!
//! assert!(promise.complete(Status::Success, 42));
//! assert!(!promise.complete_exceptionally(Status::Error, "late".to_string()));
//!
//! assert_eq!(seen.load(Ordering::SeqCst), 42);
//! assert_eq!(future.get().kind(), CompletionKind::Success);
//! assert_eq!(future.get().value(), Some(&42));
//! ```

use crate::error::ResilienceError;
use crate::outcome::Outcome;
use parking_lot::{Condvar, Mutex, RwLock};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

const PENDING: u8 = 0;
const COMPLETING: u8 = 1;
const DONE: u8 = 2;

/// Which terminal state a promise reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionKind {
    Success,
    Error,
    Timeout,
}

impl std::fmt::Display for CompletionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompletionKind::Success => write!(f, "success"),
            CompletionKind::Error => write!(f, "error"),
            CompletionKind::Timeout => write!(f, "timeout"),
        }
    }
}

/// Terminal value of a promise
#[derive(Debug, Clone, PartialEq)]
pub struct Settled<R, T, E> {
    outcome: R,
    kind: CompletionKind,
    result: Result<T, E>,
}

impl<R: Outcome, T, E> Settled<R, T, E> {
    pub fn outcome(&self) -> R {
        self.outcome
    }

    pub fn kind(&self) -> CompletionKind {
        self.kind
    }

    pub fn result(&self) -> Result<&T, &E> {
        self.result.as_ref()
    }

    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&E> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// A callback that panicked while a promise was completing
#[derive(Debug, Clone)]
pub struct CallbackPanic {
    /// Terminal kind the callback was registered for
    pub kind: CompletionKind,
    /// Panic payload rendered as text
    pub message: String,
}

type FallbackHandler = Arc<dyn Fn(&CallbackPanic) + Send + Sync>;

static FALLBACK_HANDLER: RwLock<Option<FallbackHandler>> = parking_lot::const_rwlock(None);

/// Install the process-wide handler for panicking callbacks
pub fn set_fallback_handler<F>(handler: F)
where
    F: Fn(&CallbackPanic) + Send + Sync + 'static,
{
    *FALLBACK_HANDLER.write() = Some(Arc::new(handler));
}

/// Restore the default handler, which logs the panic
pub fn reset_fallback_handler() {
    *FALLBACK_HANDLER.write() = None;
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub(crate) fn report_panic(kind: CompletionKind, payload: Box<dyn Any + Send>) {
    let report = CallbackPanic {
        kind,
        message: panic_message(payload.as_ref()),
    };
    let handler = FALLBACK_HANDLER.read().clone();
    match handler {
        Some(handler) => handler(&report),
        None => tracing::error!(kind = %report.kind, message = %report.message, "callback panicked"),
    }
}

enum Callback<T, E> {
    Success(Box<dyn FnOnce(&T) + Send>),
    Error(Box<dyn FnOnce(&E) + Send>),
    Timeout(Box<dyn FnOnce(&E) + Send>),
}

impl<T, E> Callback<T, E> {
    fn kind(&self) -> CompletionKind {
        match self {
            Callback::Success(_) => CompletionKind::Success,
            Callback::Error(_) => CompletionKind::Error,
            Callback::Timeout(_) => CompletionKind::Timeout,
        }
    }

    /// Run if registered for the settled kind, otherwise drop
    fn fire<R: Outcome>(self, settled: &Settled<R, T, E>) {
        let kind = self.kind();
        if kind != settled.kind {
            return;
        }
        let result = catch_unwind(AssertUnwindSafe(|| match (self, &settled.result) {
            (Callback::Success(f), Ok(value)) => f(value),
            (Callback::Error(f), Err(error)) | (Callback::Timeout(f), Err(error)) => f(error),
            _ => {}
        }));
        if let Err(payload) = result {
            report_panic(kind, payload);
        }
    }
}

/// Callback slot has been registered and not yet claimed
const ARMED: u8 = 0;
/// Callback slot was claimed by registration or completion
const FIRED: u8 = 1;

/// One registered callback.
///
/// Registration and completion both try to move the slot from `ARMED` to
/// `FIRED`; only the side winning that CAS takes the callback and runs it.
struct CallbackSlot<T, E> {
    state: AtomicU8,
    callback: Mutex<Option<Callback<T, E>>>,
}

impl<T, E> CallbackSlot<T, E> {
    fn new(callback: Callback<T, E>) -> Self {
        Self {
            state: AtomicU8::new(ARMED),
            callback: Mutex::new(Some(callback)),
        }
    }

    fn claim(&self) -> Option<Callback<T, E>> {
        self.state
            .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.callback.lock().take()
    }
}

type CompletionHook<R> = Box<dyn FnOnce(R) + Send>;

struct Shared<R, T, E> {
    state: AtomicU8,
    settled: OnceLock<Settled<R, T, E>>,
    hook: Mutex<Option<CompletionHook<R>>>,
    /// Slots registered while pending; drained once on completion
    callbacks: Mutex<Vec<Arc<CallbackSlot<T, E>>>>,
    lock: Mutex<()>,
    done: Condvar,
    notify: Notify,
}

impl<R, T, E> Shared<R, T, E>
where
    R: Outcome,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn new(hook: Option<CompletionHook<R>>) -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            settled: OnceLock::new(),
            hook: Mutex::new(hook),
            callbacks: Mutex::new(Vec::new()),
            lock: Mutex::new(()),
            done: Condvar::new(),
            notify: Notify::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    fn settle(&self, settled: Settled<R, T, E>) -> bool {
        if self
            .state
            .compare_exchange(PENDING, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let outcome = settled.outcome;
        let kind = settled.kind;
        let stored = self.settled.set(settled);
        // Only the PENDING -> COMPLETING winner reaches this point
        debug_assert!(stored.is_ok(), "settled value stored twice");

        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(outcome))) {
                report_panic(kind, payload);
            }
        }

        self.state.store(DONE, Ordering::Release);
        {
            let _guard = self.lock.lock();
            self.done.notify_all();
        }
        self.notify.notify_waiters();

        let slots = std::mem::take(&mut *self.callbacks.lock());
        if let Some(settled) = self.settled.get() {
            for slot in slots {
                if let Some(callback) = slot.claim() {
                    callback.fire(settled);
                }
            }
        }
        true
    }

    fn register(&self, callback: Callback<T, E>) {
        let slot = Arc::new(CallbackSlot::new(callback));
        if !self.is_done() {
            self.callbacks.lock().push(Arc::clone(&slot));
        }

        // Completed before or while registering: race the completer for the slot
        if let Some(settled) = self.settled_if_done() {
            if let Some(callback) = slot.claim() {
                callback.fire(settled);
            }
        }
    }

    fn wait(&self) -> &Settled<R, T, E> {
        let mut guard = self.lock.lock();
        loop {
            if let Some(settled) = self.settled_if_done() {
                return settled;
            }
            self.done.wait(&mut guard);
        }
    }

    fn wait_for(&self, timeout: Duration) -> Option<&Settled<R, T, E>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        loop {
            if let Some(settled) = self.settled_if_done() {
                return Some(settled);
            }
            if self.done.wait_until(&mut guard, deadline).timed_out() {
                return self.settled_if_done();
            }
        }
    }

    fn settled_if_done(&self) -> Option<&Settled<R, T, E>> {
        if self.is_done() {
            self.settled.get()
        } else {
            None
        }
    }
}

/// Write side of a guarded call's result
pub struct Promise<R, T, E> {
    shared: Arc<Shared<R, T, E>>,
}

impl<R, T, E> Promise<R, T, E>
where
    R: Outcome,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new(None)),
        }
    }

    /// Create a promise whose winning completion first calls `hook` with its outcome
    pub fn with_completion_hook<F>(hook: F) -> Self
    where
        F: FnOnce(R) + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared::new(Some(Box::new(hook)))),
        }
    }

    /// Complete with a value. Returns `false` if already completed.
    pub fn complete(&self, outcome: R, value: T) -> bool {
        self.shared.settle(Settled {
            outcome,
            kind: CompletionKind::Success,
            result: Ok(value),
        })
    }

    /// Complete with an error; a timeout outcome settles as [`CompletionKind::Timeout`].
    /// Returns `false` if already completed.
    pub fn complete_exceptionally(&self, outcome: R, error: E) -> bool {
        let kind = if outcome.is_timeout() {
            CompletionKind::Timeout
        } else {
            CompletionKind::Error
        };
        self.shared.settle(Settled {
            outcome,
            kind,
            result: Err(error),
        })
    }

    /// Read side sharing this promise's state
    pub fn future(&self) -> Eventual<R, T, E> {
        Eventual {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    /// Remove the completion hook from a promise that has not completed.
    ///
    /// Returns `true` if a hook was removed; it will never run.
    pub(crate) fn disarm_completion_hook(&self) -> bool {
        if self.shared.state.load(Ordering::Acquire) != PENDING {
            return false;
        }
        self.shared.hook.lock().take().is_some()
    }
}

impl<R, T, E> Default for Promise<R, T, E>
where
    R: Outcome,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<R, T, E> Clone for Promise<R, T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R, T, E> std::fmt::Debug for Promise<R, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("done", &(self.shared.state.load(Ordering::Acquire) == DONE))
            .finish()
    }
}

/// Read side of a guarded call's result
pub struct Eventual<R, T, E> {
    shared: Arc<Shared<R, T, E>>,
}

impl<R, T, E> Eventual<R, T, E>
where
    R: Outcome,
    T: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    /// Terminal value if already completed
    pub fn peek(&self) -> Option<&Settled<R, T, E>> {
        self.shared.settled_if_done()
    }

    /// Block the current thread until completed
    pub fn get(&self) -> &Settled<R, T, E> {
        self.shared.wait()
    }

    /// Block up to `timeout`.
    ///
    /// An elapsed wait returns [`ResilienceError::WaitTimedOut`] and leaves the
    /// promise pending; it is not a timeout of the call itself.
    pub fn get_timeout(&self, timeout: Duration) -> Result<&Settled<R, T, E>, ResilienceError> {
        self.shared
            .wait_for(timeout)
            .ok_or(ResilienceError::WaitTimedOut(timeout))
    }

    /// Wait for completion without blocking a thread
    pub async fn settled(&self) -> &Settled<R, T, E> {
        loop {
            let notified = self.shared.notify.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();

            if let Some(settled) = self.shared.settled_if_done() {
                return settled;
            }
            notified.await;
        }
    }

    /// Run `callback` with the value on success
    pub fn on_success<F>(&self, callback: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.shared.register(Callback::Success(Box::new(callback)));
    }

    /// Run `callback` with the error on a non-timeout failure
    pub fn on_error<F>(&self, callback: F)
    where
        F: FnOnce(&E) + Send + 'static,
    {
        self.shared.register(Callback::Error(Box::new(callback)));
    }

    /// Run `callback` with the error on timeout
    pub fn on_timeout<F>(&self, callback: F)
    where
        F: FnOnce(&E) + Send + 'static,
    {
        self.shared.register(Callback::Timeout(Box::new(callback)));
    }
}

impl<R, T, E> Clone for Eventual<R, T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<R, T, E> std::fmt::Debug for Eventual<R, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eventual")
            .field("done", &(self.shared.state.load(Ordering::Acquire) == DONE))
            .finish()
    }
}
