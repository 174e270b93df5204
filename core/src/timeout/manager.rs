//! Per-test deadline monitoring.
//!
//! A background loop scans registered deadlines every tick. A deadline that
//! passes is removed from the table under the lock before its callback runs,
//! so each registration fires `timeout_exceeded` at most once. Callbacks in
//! flight are recorded; `remove_monitor` waits for them, so once it returns
//! no callback for that test is running or will run.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::now_ms;
use crate::types::config::TimeoutConfig;
use crate::types::{ComponentHealth, ServiceState};
use crate::worker::{Worker, WorkerSet};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TimeoutReason {
    /// The deadline is approaching.
    Warning { remaining_ms: u64 },
    /// The deadline has passed.
    TimeoutExceeded,
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutReason::Warning { .. } => write!(f, "warning"),
            TimeoutReason::TimeoutExceeded => write!(f, "timeout_exceeded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutEvent {
    pub test_id: String,
    pub reason: TimeoutReason,
    pub timeout_ms: u64,
    pub elapsed_ms: u64,
}

pub type TimeoutCallback = Arc<dyn Fn(&TimeoutEvent) + Send + Sync>;

struct Monitor {
    registered_ms: u64,
    deadline_ms: u64,
    warning_at_ms: Option<u64>,
    callback: TimeoutCallback,
}

#[derive(Default)]
struct TimeoutState {
    monitors: HashMap<String, Monitor>,
    /// Callbacks currently executing, with the thread running them.
    firing: Vec<(String, ThreadId)>,
    timeouts_fired: u64,
    warnings_fired: u64,
}

impl TimeoutState {
    fn is_firing_elsewhere(&self, test_id: &str, me: ThreadId) -> bool {
        self.firing.iter().any(|(id, t)| id == test_id && *t != me)
    }
}

pub struct TimeoutManager {
    config: TimeoutConfig,
    state: Mutex<TimeoutState>,
    callback_done: Condvar,
    workers: Mutex<Option<WorkerSet>>,
}

impl TimeoutManager {
    pub fn new(config: TimeoutConfig) -> Self {
        TimeoutManager {
            config,
            state: Mutex::new(TimeoutState::default()),
            callback_done: Condvar::new(),
            workers: Mutex::new(None),
        }
    }

    /// Register a deadline `timeout` from now. Re-registering a test replaces
    /// its previous deadline.
    pub fn add_monitor(&self, test_id: &str, timeout: Duration, callback: TimeoutCallback) {
        self.add_monitor_at(test_id, timeout, callback, now_ms());
    }

    pub fn add_monitor_at(
        &self,
        test_id: &str,
        timeout: Duration,
        callback: TimeoutCallback,
        now: u64,
    ) {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let warning_at_ms = if self.config.warning_ratio > 0.0 {
            Some(now.saturating_add((timeout_ms as f64 * self.config.warning_ratio) as u64))
        } else {
            None
        };
        let monitor = Monitor {
            registered_ms: now,
            deadline_ms: now.saturating_add(timeout_ms),
            warning_at_ms,
            callback,
        };
        let replaced = self
            .state
            .lock()
            .monitors
            .insert(test_id.to_string(), monitor)
            .is_some();
        debug!(test_id, timeout_ms, replaced, "timeout monitor registered");
    }

    /// Cancel a test's deadline. Safe to call for unknown or already-fired
    /// tests. Waits for a callback currently running on another thread.
    ///
    /// Returns `true` if a pending deadline was removed.
    pub fn remove_monitor(&self, test_id: &str) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let removed = state.monitors.remove(test_id).is_some();
        while state.is_firing_elsewhere(test_id, me) {
            self.callback_done.wait(&mut state);
        }
        removed
    }

    pub fn has_monitor(&self, test_id: &str) -> bool {
        self.state.lock().monitors.contains_key(test_id)
    }

    pub fn active_monitor_count(&self) -> usize {
        self.state.lock().monitors.len()
    }

    pub fn timeouts_fired(&self) -> u64 {
        self.state.lock().timeouts_fired
    }

    pub fn check_timeouts(&self) -> usize {
        self.check_timeouts_at(now_ms())
    }

    /// Fire every warning and timeout due at `now`. Returns how many
    /// callbacks ran.
    pub fn check_timeouts_at(&self, now: u64) -> usize {
        let me = thread::current().id();
        let mut due: Vec<(TimeoutEvent, TimeoutCallback)> = Vec::new();
        {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            for (test_id, m) in state.monitors.iter_mut() {
                let timeout_ms = m.deadline_ms - m.registered_ms;
                if now >= m.deadline_ms {
                    expired.push(test_id.clone());
                } else if let Some(at) = m.warning_at_ms {
                    if now >= at {
                        m.warning_at_ms = None;
                        due.push((
                            TimeoutEvent {
                                test_id: test_id.clone(),
                                reason: TimeoutReason::Warning {
                                    remaining_ms: m.deadline_ms - now,
                                },
                                timeout_ms,
                                elapsed_ms: now.saturating_sub(m.registered_ms),
                            },
                            m.callback.clone(),
                        ));
                    }
                }
            }
            for test_id in expired {
                if let Some(m) = state.monitors.remove(&test_id) {
                    due.push((
                        TimeoutEvent {
                            test_id,
                            reason: TimeoutReason::TimeoutExceeded,
                            timeout_ms: m.deadline_ms - m.registered_ms,
                            elapsed_ms: now.saturating_sub(m.registered_ms),
                        },
                        m.callback,
                    ));
                }
            }
            for (event, _) in &due {
                match event.reason {
                    TimeoutReason::TimeoutExceeded => state.timeouts_fired += 1,
                    TimeoutReason::Warning { .. } => state.warnings_fired += 1,
                }
                state.firing.push((event.test_id.clone(), me));
            }
        }

        let fired = due.len();
        for (event, callback) in due {
            match event.reason {
                TimeoutReason::TimeoutExceeded => warn!(
                    test_id = %event.test_id,
                    timeout_ms = event.timeout_ms,
                    "test timed out"
                ),
                TimeoutReason::Warning { remaining_ms } => info!(
                    test_id = %event.test_id,
                    remaining_ms,
                    "test approaching timeout"
                ),
            }
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!(test_id = %event.test_id, "timeout callback panicked");
            }

            let mut state = self.state.lock();
            if let Some(pos) = state
                .firing
                .iter()
                .position(|(id, t)| *id == event.test_id && *t == me)
            {
                state.firing.remove(pos);
            }
            self.callback_done.notify_all();
        }
        fired
    }

    // -- lifecycle ----------------------------------------------------------

    pub fn start(self: &Arc<Self>) -> std::io::Result<bool> {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return Ok(false);
        }
        let mut set = WorkerSet::new();
        let weak: Weak<TimeoutManager> = Arc::downgrade(self);
        set.push(Worker::spawn_periodic(
            "timeout-monitor",
            set.shutdown(),
            Duration::from_millis(self.config.tick_ms),
            move || {
                if let Some(manager) = weak.upgrade() {
                    manager.check_timeouts();
                }
            },
        )?);
        *workers = Some(set);
        Ok(true)
    }

    /// Stop the scan loop. Registered monitors are kept.
    pub fn stop(&self, timeout: Duration) -> bool {
        let set = self.workers.lock().take();
        match set {
            Some(set) => {
                set.stop(timeout);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    pub fn health(&self) -> ComponentHealth {
        let status = if self.is_running() {
            ServiceState::Healthy
        } else {
            ServiceState::Stopped
        };
        let state = self.state.lock();
        ComponentHealth::new(status)
            .detail("active_monitors", state.monitors.len())
            .detail("timeouts_fired", state.timeouts_fired)
            .detail("warnings_fired", state.warnings_fired)
    }
}

impl fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("config", &self.config)
            .field("active_monitors", &self.active_monitor_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    fn manager(warning_ratio: f64) -> Arc<TimeoutManager> {
        Arc::new(TimeoutManager::new(TimeoutConfig {
            tick_ms: 10,
            warning_ratio,
        }))
    }

    fn recorder() -> (Arc<Mutex<Vec<TimeoutEvent>>>, TimeoutCallback) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let cb: TimeoutCallback = Arc::new(move |e: &TimeoutEvent| sink.lock().push(e.clone()));
        (events, cb)
    }

    #[test]
    fn deadline_fires_exactly_once() {
        let m = manager(0.0);
        let (events, cb) = recorder();
        m.add_monitor_at("t1", Duration::from_secs(1), cb, 1000);
        assert_eq!(m.check_timeouts_at(1500), 0);
        assert_eq!(m.check_timeouts_at(2000), 1);
        assert_eq!(m.check_timeouts_at(9000), 0);

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, TimeoutReason::TimeoutExceeded);
        assert_eq!(events[0].reason.to_string(), "timeout_exceeded");
        assert_eq!(events[0].timeout_ms, 1000);
        assert!(!m.has_monitor("t1"));
        assert_eq!(m.timeouts_fired(), 1);
    }

    #[test]
    fn warning_precedes_timeout() {
        let m = manager(0.8);
        let (events, cb) = recorder();
        m.add_monitor_at("t1", Duration::from_secs(10), cb, 0);
        assert_eq!(m.check_timeouts_at(7_999), 0);
        assert_eq!(m.check_timeouts_at(8_000), 1);
        assert_eq!(m.check_timeouts_at(9_000), 0);
        assert_eq!(m.check_timeouts_at(10_000), 1);

        let events = events.lock();
        assert_eq!(
            events[0].reason,
            TimeoutReason::Warning {
                remaining_ms: 2_000
            }
        );
        assert_eq!(events[1].reason, TimeoutReason::TimeoutExceeded);
    }

    #[test]
    fn oversized_timeout_does_not_wrap() {
        let m = manager(0.8);
        let (events, cb) = recorder();
        m.add_monitor_at("t1", Duration::from_secs(18_446_744_073_709_552), cb.clone(), 1_000);
        m.add_monitor_at("t2", Duration::from_secs(u64::MAX), cb, 1_000);
        assert_eq!(m.check_timeouts_at(1_384), 0);
        assert_eq!(m.check_timeouts_at(1_000_000_000_000), 0);
        assert!(events.lock().is_empty());
        assert_eq!(m.active_monitor_count(), 2);
    }

    #[test]
    fn removed_monitor_never_fires() {
        let m = manager(0.0);
        let (events, cb) = recorder();
        m.add_monitor_at("t1", Duration::from_millis(100), cb, 0);
        assert!(m.remove_monitor("t1"));
        assert!(!m.remove_monitor("t1"));
        assert!(!m.remove_monitor("never-added"));
        assert_eq!(m.check_timeouts_at(1_000), 0);
        assert!(events.lock().is_empty());
    }

    #[test]
    fn re_registration_replaces_deadline() {
        let m = manager(0.0);
        let (events, cb) = recorder();
        m.add_monitor_at("t1", Duration::from_millis(100), cb.clone(), 0);
        m.add_monitor_at("t1", Duration::from_millis(500), cb, 50);
        assert_eq!(m.active_monitor_count(), 1);
        assert_eq!(m.check_timeouts_at(200), 0);
        assert_eq!(m.check_timeouts_at(550), 1);
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn remove_from_inside_callback_does_not_deadlock() {
        let m = manager(0.0);
        let inner = m.clone();
        let cb: TimeoutCallback = Arc::new(move |e: &TimeoutEvent| {
            inner.remove_monitor(&e.test_id);
        });
        m.add_monitor_at("t1", Duration::from_millis(1), cb, 0);
        assert_eq!(m.check_timeouts_at(10), 1);
    }

    #[test]
    fn remove_waits_for_in_flight_callback() {
        let m = manager(0.0);
        let finished = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let (f, s) = (finished.clone(), started.clone());
        let cb: TimeoutCallback = Arc::new(move |_e: &TimeoutEvent| {
            s.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(100));
            f.store(true, Ordering::SeqCst);
        });
        m.add_monitor_at("t1", Duration::from_millis(1), cb, 0);

        let firing = m.clone();
        let handle = thread::spawn(move || firing.check_timeouts_at(10));
        while !started.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(1));
        }
        m.remove_monitor("t1");
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn panicking_callback_is_contained() {
        let m = manager(0.0);
        let cb: TimeoutCallback = Arc::new(|_e: &TimeoutEvent| panic!("boom"));
        m.add_monitor_at("t1", Duration::from_millis(1), cb, 0);
        assert_eq!(m.check_timeouts_at(10), 1);
        // The firing record was cleared, so removal returns immediately.
        let start = Instant::now();
        m.remove_monitor("t1");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn background_loop_fires_real_deadline() {
        let m = manager(0.0);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        m.add_monitor(
            "t1",
            Duration::from_millis(30),
            Arc::new(move |_e: &TimeoutEvent| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(m.start().unwrap());
        thread::sleep(Duration::from_millis(150));
        assert!(m.stop(Duration::from_secs(2)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(m.health().status, ServiceState::Stopped);
    }
}
