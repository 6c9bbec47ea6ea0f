//! Deadline scheduling for admitted calls
//!
//! A [`TimeoutService`] owns one background thread holding a deadline-ordered
//! queue. The thread sleeps until the earliest deadline (or a new entry
//! arrives), then calls [`TimeoutTask::on_timeout`] on every expired task.
//! Ties fire in insertion order. Tasks race their own normal completion; the
//! promise decides which side wins.
//!
//! The service is owned by the caller: nothing runs until [`TimeoutService::start`]
//! and [`TimeoutService::shutdown`] (or drop) stops and joins the thread.

use crate::clock::{Clock, SystemClock};
use crate::error::ResilienceError;
use crate::promise::{report_panic, CompletionKind};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Relative timeout that disables scheduling
pub const NO_TIMEOUT: u64 = 0;

/// Work that can be expired by the scheduler
pub trait TimeoutTask: Send + Sync {
    /// Absolute deadline in clock nanoseconds
    fn deadline_nanos(&self) -> u64;

    /// Called once the deadline has passed
    fn on_timeout(&self);
}

struct Entry {
    deadline: u64,
    seq: u64,
    task: Arc<dyn TimeoutTask>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

enum Command {
    Schedule(Entry),
    Shutdown,
}

struct Worker {
    sender: Sender<Command>,
    handle: JoinHandle<()>,
}

/// Background deadline scheduler
pub struct TimeoutService {
    name: String,
    clock: Arc<dyn Clock>,
    seq: AtomicU64,
    worker: Mutex<Option<Worker>>,
}

impl TimeoutService {
    /// Create a stopped service on the given clock
    pub fn new(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            seq: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    /// Create a stopped service on a fresh [`SystemClock`]
    pub fn with_system_clock(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(SystemClock::new()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Spawn the scheduler thread. Starting a running service is a no-op.
    pub fn start(&self) -> Result<(), ResilienceError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let (sender, receiver) = unbounded();
        let clock = Arc::clone(&self.clock);
        let name = self.name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("precipice-timeout-{}", self.name))
            .spawn(move || run_scheduler(&name, clock.as_ref(), receiver))
            .map_err(|e| ResilienceError::Execution(format!("failed to spawn timeout thread: {}", e)))?;

        *worker = Some(Worker { sender, handle });
        tracing::info!(service = %self.name, "timeout service started");
        Ok(())
    }

    /// Stop the scheduler thread and wait for it. Pending timeouts are dropped.
    pub fn shutdown(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.sender.send(Command::Shutdown);
            if worker.handle.join().is_err() {
                tracing::error!(service = %self.name, "timeout thread panicked");
            }
            tracing::info!(service = %self.name, "timeout service stopped");
        }
    }

    /// Arm `task` to expire at its deadline.
    ///
    /// `relative_millis` of [`NO_TIMEOUT`] schedules nothing and returns
    /// `Ok(false)`. A deadline already at or before `now_nanos` fires on the
    /// calling thread.
    pub fn schedule_timeout(
        &self,
        task: Arc<dyn TimeoutTask>,
        relative_millis: u64,
        now_nanos: u64,
    ) -> Result<bool, ResilienceError> {
        if relative_millis == NO_TIMEOUT {
            return Ok(false);
        }

        let deadline = task.deadline_nanos();
        if deadline <= now_nanos {
            fire(&self.name, task.as_ref());
            return Ok(true);
        }

        let entry = Entry {
            deadline,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            task,
        };
        let worker = self.worker.lock();
        match worker.as_ref() {
            Some(w) if w.sender.send(Command::Schedule(entry)).is_ok() => Ok(true),
            _ => Err(ResilienceError::SchedulerStopped(self.name.clone())),
        }
    }
}

impl Drop for TimeoutService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TimeoutService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutService")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

fn fire(service: &str, task: &dyn TimeoutTask) {
    tracing::debug!(service, deadline = task.deadline_nanos(), "timeout fired");
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task.on_timeout())) {
        report_panic(CompletionKind::Timeout, payload);
    }
}

fn run_scheduler(name: &str, clock: &dyn Clock, receiver: Receiver<Command>) {
    let mut queue: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();

    loop {
        let now = clock.nano_time();
        while queue.peek().is_some_and(|Reverse(e)| e.deadline <= now) {
            if let Some(Reverse(entry)) = queue.pop() {
                fire(name, entry.task.as_ref());
            }
        }

        let command = match queue.peek() {
            None => match receiver.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
            Some(Reverse(next)) => {
                let wait = Duration::from_nanos(next.deadline.saturating_sub(now));
                match receiver.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        };

        match command {
            Command::Schedule(entry) => queue.push(Reverse(entry)),
            Command::Shutdown => break,
        }
    }

    tracing::debug!(service = name, dropped = queue.len(), "timeout scheduler exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    const MS: u64 = 1_000_000;

    struct Recorder {
        id: usize,
        deadline: u64,
        fired: Arc<Mutex<Vec<usize>>>,
    }

    impl TimeoutTask for Recorder {
        fn deadline_nanos(&self) -> u64 {
            self.deadline
        }

        fn on_timeout(&self) {
            self.fired.lock().push(self.id);
        }
    }

    fn wait_for(fired: &Mutex<Vec<usize>>, count: usize) {
        for _ in 0..200 {
            if fired.lock().len() >= count {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_entries_order_by_deadline_then_insertion() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut queue = BinaryHeap::new();
        for (seq, (id, deadline)) in [(0, 30), (1, 10), (2, 10), (3, 20)].into_iter().enumerate() {
            queue.push(Reverse(Entry {
                deadline,
                seq: seq as u64,
                task: Arc::new(Recorder {
                    id,
                    deadline,
                    fired: Arc::clone(&fired),
                }),
            }));
        }

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop().map(|Reverse(e)| e.seq)).collect();
        assert_eq!(order, vec![1, 2, 3, 0]);
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let clock = Arc::new(SystemClock::new());
        let service = TimeoutService::new("order", clock.clone());
        service.start().unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        let now = clock.nano_time();
        for (id, delay) in [(0usize, 40u64), (1, 10), (2, 25)] {
            let task = Arc::new(Recorder {
                id,
                deadline: now + delay * MS,
                fired: Arc::clone(&fired),
            });
            assert!(service.schedule_timeout(task, delay, now).unwrap());
        }

        wait_for(&fired, 3);
        assert_eq!(*fired.lock(), vec![1, 2, 0]);
        service.shutdown();
    }

    #[test]
    fn test_no_timeout_schedules_nothing() {
        let service = TimeoutService::with_system_clock("none");
        let fired = Arc::new(Mutex::new(Vec::new()));
        let task = Arc::new(Recorder {
            id: 0,
            deadline: 0,
            fired: Arc::clone(&fired),
        });

        // Not running, but NO_TIMEOUT never touches the thread
        assert!(!service.schedule_timeout(task, NO_TIMEOUT, 0).unwrap());
        assert!(fired.lock().is_empty());
    }

    #[test]
    fn test_expired_deadline_fires_inline() {
        let clock = Arc::new(ManualClock::new(100 * MS));
        let service = TimeoutService::new("inline", clock);
        let fired = Arc::new(Mutex::new(Vec::new()));
        let task = Arc::new(Recorder {
            id: 7,
            deadline: 50 * MS,
            fired: Arc::clone(&fired),
        });

        assert!(service.schedule_timeout(task, 1, 100 * MS).unwrap());
        assert_eq!(*fired.lock(), vec![7]);
    }

    #[test]
    fn test_schedule_on_stopped_service_fails() {
        let service = TimeoutService::with_system_clock("stopped");
        let fired = Arc::new(Mutex::new(Vec::new()));
        let task = Arc::new(Recorder {
            id: 0,
            deadline: u64::MAX,
            fired,
        });

        let result = service.schedule_timeout(task, 10, 0);
        assert!(matches!(result, Err(ResilienceError::SchedulerStopped(_))));
    }

    #[test]
    fn test_start_is_idempotent_and_shutdown_joins() {
        let service = TimeoutService::with_system_clock("lifecycle");
        assert!(!service.is_running());
        service.start().unwrap();
        service.start().unwrap();
        assert!(service.is_running());

        service.shutdown();
        assert!(!service.is_running());
        service.shutdown();

        // Restartable
        service.start().unwrap();
        assert!(service.is_running());
    }

    #[test]
    fn test_panicking_task_does_not_stop_scheduler() {
        struct Exploding;
        impl TimeoutTask for Exploding {
            fn deadline_nanos(&self) -> u64 {
                0
            }
            fn on_timeout(&self) {
                panic!("timeout handler exploded");
            }
        }

        let clock = Arc::new(SystemClock::new());
        let service = TimeoutService::new("panics", clock.clone());
        service.start().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        struct Counting(u64, Arc<AtomicUsize>);
        impl TimeoutTask for Counting {
            fn deadline_nanos(&self) -> u64 {
                self.0
            }
            fn on_timeout(&self) {
                self.1.fetch_add(1, Ordering::SeqCst);
            }
        }

        let now = clock.nano_time();
        let exploding: Arc<dyn TimeoutTask> = Arc::new(Exploding);
        // Deadline 0 is already past; fires inline and is caught
        service.schedule_timeout(exploding, 1, now.max(1)).unwrap();
        service
            .schedule_timeout(Arc::new(Counting(now + 5 * MS, Arc::clone(&calls))), 5, now)
            .unwrap();

        for _ in 0..200 {
            if calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
