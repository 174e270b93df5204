//! Background worker plumbing: cancellable sleeps, named worker threads
//! with bounded joins, and a counting slot pool for per-test tasks.
//!
//! Every long-lived loop in the orchestrator follows the same shape: do a
//! bounded amount of work, then wait on a `Shutdown` signal for the loop
//! interval. Triggering the signal wakes all waiters at once, so stopping a
//! component never waits out a full interval.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

/// A one-shot cancellation signal shared between a component and its workers.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    triggered: Mutex<bool>,
    cond: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Shutdown::default()
    }

    /// Signal shutdown and wake every waiter.
    pub fn trigger(&self) {
        let mut triggered = self.inner.triggered.lock();
        *triggered = true;
        self.inner.cond.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.triggered.lock()
    }

    /// Sleep for up to `timeout`, returning early if shutdown is triggered.
    ///
    /// Returns `true` if shutdown has been requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut triggered = self.inner.triggered.lock();
        while !*triggered {
            if self.inner.cond.wait_until(&mut triggered, deadline).timed_out() {
                break;
            }
        }
        *triggered
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// A named background thread that can be joined with a deadline.
#[derive(Debug)]
pub struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn a named thread running `body` once.
    pub fn spawn<F>(name: &str, body: F) -> std::io::Result<Worker>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.to_string()).spawn(body)?;
        Ok(Worker {
            name: name.to_string(),
            handle: Some(handle),
        })
    }

    /// Spawn a loop that runs `tick`, then waits `interval` on `shutdown`,
    /// until shutdown is triggered.
    pub fn spawn_periodic<F>(
        name: &str,
        shutdown: Shutdown,
        interval: Duration,
        mut tick: F,
    ) -> std::io::Result<Worker>
    where
        F: FnMut() + Send + 'static,
    {
        let worker_name = name.to_string();
        Worker::spawn(name, move || {
            debug!(worker = %worker_name, "worker started");
            while !shutdown.is_triggered() {
                tick();
                if shutdown.wait(interval) {
                    break;
                }
            }
            debug!(worker = %worker_name, "worker stopped");
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// Join the thread, giving up after `timeout`.
    ///
    /// Returns `false` (and detaches the thread) if it did not finish in time.
    pub fn join_timeout(mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    worker = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "worker did not stop in time; detaching"
                );
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if handle.join().is_err() {
            warn!(worker = %self.name, "worker thread panicked");
        }
        true
    }
}

/// Join every worker with a shared deadline. Returns how many stopped cleanly.
pub fn join_all(workers: Vec<Worker>, timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    workers
        .into_iter()
        .map(|w| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            w.join_timeout(remaining)
        })
        .filter(|stopped| *stopped)
        .count()
}

/// The shutdown signal and background workers of a started component.
///
/// Components keep this in a `Mutex<Option<WorkerSet>>`: `Some` while
/// running, taken on stop.
#[derive(Debug, Default)]
pub struct WorkerSet {
    shutdown: Shutdown,
    workers: Vec<Worker>,
}

impl WorkerSet {
    pub fn new() -> Self {
        WorkerSet::default()
    }

    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn push(&mut self, worker: Worker) {
        self.workers.push(worker);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Trigger shutdown and join every worker within `timeout`.
    pub fn stop(self, timeout: Duration) -> usize {
        self.shutdown.trigger();
        join_all(self.workers, timeout)
    }
}

// ---------------------------------------------------------------------------
// Slots
// ---------------------------------------------------------------------------

/// A counting limiter for short-lived tasks (e.g. concurrent test executions).
#[derive(Debug, Clone)]
pub struct Slots {
    inner: Arc<SlotsInner>,
}

#[derive(Debug)]
struct SlotsInner {
    capacity: usize,
    in_use: Mutex<usize>,
    cond: Condvar,
}

/// Returned by `Slots::acquire`; frees the slot on drop.
#[derive(Debug)]
pub struct SlotGuard {
    inner: Arc<SlotsInner>,
}

impl Slots {
    pub fn new(capacity: usize) -> Self {
        Slots {
            inner: Arc::new(SlotsInner {
                capacity: capacity.max(1),
                in_use: Mutex::new(0),
                cond: Condvar::new(),
            }),
        }
    }

    /// Block until a slot is free or shutdown is triggered.
    ///
    /// Returns `None` if shutdown was triggered before a slot became free.
    pub fn acquire(&self, shutdown: &Shutdown) -> Option<SlotGuard> {
        let mut in_use = self.inner.in_use.lock();
        loop {
            if shutdown.is_triggered() {
                return None;
            }
            if *in_use < self.inner.capacity {
                *in_use += 1;
                return Some(SlotGuard {
                    inner: self.inner.clone(),
                });
            }
            // Re-check shutdown periodically; the shutdown signal has its own condvar.
            self.inner
                .cond
                .wait_for(&mut in_use, Duration::from_millis(50));
        }
    }

    /// Block until every slot has been released, or the timeout elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut in_use = self.inner.in_use.lock();
        while *in_use > 0 {
            if self.inner.cond.wait_until(&mut in_use, deadline).timed_out() {
                return *in_use == 0;
            }
        }
        true
    }

    pub fn in_use(&self) -> usize {
        *self.inner.in_use.lock()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut in_use = self.inner.in_use.lock();
        *in_use = in_use.saturating_sub(1);
        self.inner.cond.notify_all();
    }
}
