//! Status tracker, the authoritative registry of test and plan status.
//!
//! Every mutation goes through one lock, and the derived counters are
//! adjusted in the same critical section as the record they describe, so
//! `active_tests` always equals the number of records in `running`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::{hours_to_ms, now_ms};
use crate::types::config::StatusConfig;
use crate::types::{
    ComponentHealth, PlanStatus, ServiceState, TestExecutionStatus, TestStatus, TestUpdate,
};
use crate::worker::{Worker, WorkerSet};

// ---------------------------------------------------------------------------
// Records and reports
// ---------------------------------------------------------------------------

/// Plan-level status as seen by status queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanExecutionStatus {
    pub plan_id: String,
    pub submission_id: Option<String>,
    pub status: PlanStatus,
    pub total_tests: usize,
    pub completed_tests: usize,
    pub failed_tests: usize,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub updated_at_ms: u64,
}

impl PlanExecutionStatus {
    fn new(plan_id: &str, status: PlanStatus, now: u64) -> Self {
        PlanExecutionStatus {
            plan_id: plan_id.to_string(),
            submission_id: None,
            status,
            total_tests: 0,
            completed_tests: 0,
            failed_tests: 0,
            started_at_ms: None,
            completed_at_ms: None,
            updated_at_ms: now,
        }
    }
}

/// Lifetime outcome counters. Also the content of the stats snapshot file.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerStats {
    pub tests_completed: u64,
    pub tests_failed: u64,
    pub plans_completed: u64,
    pub plans_failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerMetrics {
    pub active_tests: usize,
    pub queued_tests: usize,
    pub tracked_tests: usize,
    pub tracked_plans: usize,
    pub running_plans: usize,
    pub tests_by_status: BTreeMap<String, usize>,
    #[serde(flatten)]
    pub lifetime: TrackerStats,
    pub drift_corrections: u64,
    pub last_reconciled_ms: Option<u64>,
}

/// Counter values before and after a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Drift {
    pub active_before: usize,
    pub active_actual: usize,
    pub queued_before: usize,
    pub queued_actual: usize,
}

impl Drift {
    pub fn is_empty(&self) -> bool {
        self.active_before == self.active_actual && self.queued_before == self.queued_actual
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TrackerState {
    tests: HashMap<String, TestExecutionStatus>,
    plans: HashMap<String, PlanExecutionStatus>,
    active_tests: usize,
    queued_tests: usize,
    lifetime: TrackerStats,
    drift_corrections: u64,
    last_reconciled_ms: Option<u64>,
}

impl TrackerState {
    /// Upsert one test record and adjust counters for the transition.
    /// Returns the previous status, if the test was already tracked.
    fn apply(
        &mut self,
        test_id: &str,
        status: TestStatus,
        update: TestUpdate,
        now: u64,
    ) -> Option<TestStatus> {
        let previous = self.tests.get(test_id).map(|t| t.status);

        let was_running = previous == Some(TestStatus::Running);
        let is_running = status == TestStatus::Running;
        if !was_running && is_running {
            self.active_tests += 1;
        } else if was_running && !is_running {
            self.active_tests = self.active_tests.saturating_sub(1);
        }

        let was_queued = previous == Some(TestStatus::Queued);
        let is_queued = status == TestStatus::Queued;
        if !was_queued && is_queued {
            self.queued_tests += 1;
        } else if was_queued && !is_queued {
            self.queued_tests = self.queued_tests.saturating_sub(1);
        }

        let entering_terminal =
            status.is_terminal() && !previous.map(TestStatus::is_terminal).unwrap_or(false);
        if entering_terminal {
            if status == TestStatus::Completed {
                self.lifetime.tests_completed += 1;
            } else {
                self.lifetime.tests_failed += 1;
            }
        }

        let record = self
            .tests
            .entry(test_id.to_string())
            .or_insert_with(|| TestExecutionStatus::new(test_id, status, now));
        record.status = status;
        record.updated_at_ms = now;

        match status {
            TestStatus::Running if !was_running => {
                record.started_at_ms = Some(now);
                record.completed_at_ms = None;
                record.execution_time_ms = None;
            }
            TestStatus::Queued => {
                record.started_at_ms = None;
                record.completed_at_ms = None;
                record.execution_time_ms = None;
                record.progress = 0.0;
            }
            s if s.is_terminal() && entering_terminal => {
                record.completed_at_ms = Some(now);
                record.execution_time_ms =
                    record.started_at_ms.map(|start| now.saturating_sub(start));
                if s == TestStatus::Completed {
                    record.progress = 1.0;
                }
            }
            _ => {}
        }

        if let Some(message) = update.message {
            record.message = Some(message);
        }
        if let Some(progress) = update.progress {
            record.progress = progress.clamp(0.0, 1.0);
        }
        if let Some(env) = update.environment_id {
            record.environment_id = Some(env);
        }
        if let Some(plan) = update.plan_id {
            record.plan_id = Some(plan);
        }

        previous
    }

    fn count_status(&self, status: TestStatus) -> usize {
        self.tests.values().filter(|t| t.status == status).count()
    }
}

// ---------------------------------------------------------------------------
// StatusTracker
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct StatusTracker {
    config: StatusConfig,
    state: Mutex<TrackerState>,
    workers: Mutex<Option<WorkerSet>>,
}

impl StatusTracker {
    pub fn new(config: StatusConfig) -> Self {
        StatusTracker {
            config,
            state: Mutex::new(TrackerState::default()),
            workers: Mutex::new(None),
        }
    }

    // -- tests --------------------------------------------------------------

    /// Upsert a test's status. Returns the status it had before, if any.
    pub fn update_test_status(
        &self,
        test_id: &str,
        status: TestStatus,
        update: TestUpdate,
    ) -> Option<TestStatus> {
        let previous = self.state.lock().apply(test_id, status, update, now_ms());
        if previous != Some(status) {
            debug!(test_id, from = ?previous, to = %status, "test status changed");
        }
        previous
    }

    /// Move a running test to a terminal status.
    ///
    /// Only the first caller wins: returns `false` (and changes nothing) if
    /// the test is not currently running or `status` is not terminal.
    pub fn finish_test(&self, test_id: &str, status: TestStatus, update: TestUpdate) -> bool {
        if !status.is_terminal() {
            return false;
        }
        let mut state = self.state.lock();
        if state.tests.get(test_id).map(|t| t.status) != Some(TestStatus::Running) {
            return false;
        }
        state.apply(test_id, status, update, now_ms());
        drop(state);
        info!(test_id, status = %status, "test finished");
        true
    }

    pub fn get_test_status(&self, test_id: &str) -> Option<TestExecutionStatus> {
        self.state.lock().tests.get(test_id).cloned()
    }

    /// All tracked tests belonging to `plan_id`, ordered by id.
    pub fn get_tests_for_plan(&self, plan_id: &str) -> Vec<TestExecutionStatus> {
        let state = self.state.lock();
        let mut tests: Vec<TestExecutionStatus> = state
            .tests
            .values()
            .filter(|t| t.plan_id.as_deref() == Some(plan_id))
            .cloned()
            .collect();
        tests.sort_by(|a, b| a.test_id.cmp(&b.test_id));
        tests
    }

    /// Adjust the active counter directly. Reconciliation corrects any drift
    /// this introduces.
    pub fn increment_active_tests(&self) -> usize {
        let mut state = self.state.lock();
        state.active_tests += 1;
        state.active_tests
    }

    /// Counterpart of `increment_active_tests`; clamps at zero.
    pub fn decrement_active_tests(&self) -> usize {
        let mut state = self.state.lock();
        state.active_tests = state.active_tests.saturating_sub(1);
        state.active_tests
    }

    pub fn get_active_test_count(&self) -> usize {
        self.state.lock().active_tests
    }

    pub fn get_queued_test_count(&self) -> usize {
        self.state.lock().queued_tests
    }

    // -- plans --------------------------------------------------------------

    /// Upsert a plan's status. Returns the previous status, if any.
    pub fn update_plan_status(
        &self,
        plan_id: &str,
        status: PlanStatus,
        submission_id: Option<&str>,
    ) -> Option<PlanStatus> {
        let now = now_ms();
        let mut state = self.state.lock();
        let previous = state.plans.get(plan_id).map(|p| p.status);
        let entering_terminal =
            status.is_terminal() && !previous.map(PlanStatus::is_terminal).unwrap_or(false);
        if entering_terminal {
            match status {
                PlanStatus::Completed => state.lifetime.plans_completed += 1,
                _ => state.lifetime.plans_failed += 1,
            }
        }

        let record = state
            .plans
            .entry(plan_id.to_string())
            .or_insert_with(|| PlanExecutionStatus::new(plan_id, status, now));
        record.status = status;
        record.updated_at_ms = now;
        if let Some(sub) = submission_id {
            record.submission_id = Some(sub.to_string());
        }
        match status {
            PlanStatus::Running if record.started_at_ms.is_none() => {
                record.started_at_ms = Some(now);
            }
            PlanStatus::Queued => {
                record.completed_at_ms = None;
            }
            _ if entering_terminal => {
                record.completed_at_ms = Some(now);
            }
            _ => {}
        }
        drop(state);

        if previous != Some(status) {
            info!(plan_id, from = ?previous, to = %status, "plan status changed");
        }
        previous
    }

    /// Record a plan's test counters. `completed + failed` is capped at `total`.
    pub fn update_plan_progress(
        &self,
        plan_id: &str,
        total: usize,
        completed: usize,
        failed: usize,
    ) {
        let now = now_ms();
        let mut state = self.state.lock();
        let record = state
            .plans
            .entry(plan_id.to_string())
            .or_insert_with(|| PlanExecutionStatus::new(plan_id, PlanStatus::Queued, now));
        record.total_tests = total;
        record.completed_tests = completed.min(total);
        record.failed_tests = failed.min(total - record.completed_tests);
        record.updated_at_ms = now;
    }

    pub fn get_plan_status(&self, plan_id: &str) -> Option<PlanExecutionStatus> {
        self.state.lock().plans.get(plan_id).cloned()
    }

    // -- metrics and maintenance -------------------------------------------

    pub fn get_system_metrics(&self) -> TrackerMetrics {
        let state = self.state.lock();
        let mut tests_by_status = BTreeMap::new();
        for t in state.tests.values() {
            *tests_by_status.entry(t.status.to_string()).or_insert(0) += 1;
        }
        TrackerMetrics {
            active_tests: state.active_tests,
            queued_tests: state.queued_tests,
            tracked_tests: state.tests.len(),
            tracked_plans: state.plans.len(),
            running_plans: state
                .plans
                .values()
                .filter(|p| p.status == PlanStatus::Running)
                .count(),
            tests_by_status,
            lifetime: state.lifetime,
            drift_corrections: state.drift_corrections,
            last_reconciled_ms: state.last_reconciled_ms,
        }
    }

    /// Recompute the counters from the records, logging and correcting any
    /// drift.
    pub fn update_metrics(&self) -> Drift {
        let mut state = self.state.lock();
        let drift = Drift {
            active_before: state.active_tests,
            active_actual: state.count_status(TestStatus::Running),
            queued_before: state.queued_tests,
            queued_actual: state.count_status(TestStatus::Queued),
        };
        state.last_reconciled_ms = Some(now_ms());
        if !drift.is_empty() {
            state.active_tests = drift.active_actual;
            state.queued_tests = drift.queued_actual;
            state.drift_corrections += 1;
            drop(state);
            warn!(
                active_counter = drift.active_before,
                active_running = drift.active_actual,
                queued_counter = drift.queued_before,
                queued_actual = drift.queued_actual,
                "status counter drift corrected"
            );
        }
        drift
    }

    /// Evict terminal records older than `max_age_hours`. Returns how many
    /// test and plan records were removed.
    pub fn cleanup_old_statuses(&self, max_age_hours: u64) -> usize {
        self.cleanup_old_statuses_at(max_age_hours, now_ms())
    }

    pub fn cleanup_old_statuses_at(&self, max_age_hours: u64, now: u64) -> usize {
        let cutoff = now.saturating_sub(hours_to_ms(max_age_hours));
        let mut state = self.state.lock();
        let before = state.tests.len() + state.plans.len();
        state.tests.retain(|_, t| {
            !(t.status.is_terminal() && t.completed_at_ms.unwrap_or(t.updated_at_ms) < cutoff)
        });
        state.plans.retain(|_, p| {
            !(p.status.is_terminal() && p.completed_at_ms.unwrap_or(p.updated_at_ms) < cutoff)
        });
        let removed = before - (state.tests.len() + state.plans.len());
        drop(state);
        if removed > 0 {
            debug!(removed, max_age_hours, "old status records evicted");
        }
        removed
    }

    pub fn stats_snapshot(&self) -> TrackerStats {
        self.state.lock().lifetime
    }

    /// Seed the lifetime counters from a previous run.
    pub fn restore_stats(&self, stats: TrackerStats) {
        self.state.lock().lifetime = stats;
    }

    // -- lifecycle ----------------------------------------------------------

    /// Start the reconciliation worker. Returns `false` if already running.
    pub fn start(self: &Arc<Self>) -> std::io::Result<bool> {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return Ok(false);
        }
        let mut set = WorkerSet::new();
        let weak: Weak<StatusTracker> = Arc::downgrade(self);
        let retention = self.config.status_retention_hours;
        set.push(Worker::spawn_periodic(
            "status-reconcile",
            set.shutdown(),
            Duration::from_millis(self.config.metrics_interval_ms),
            move || {
                if let Some(tracker) = weak.upgrade() {
                    tracker.update_metrics();
                    tracker.cleanup_old_statuses(retention);
                }
            },
        )?);
        *workers = Some(set);
        Ok(true)
    }

    /// Stop the reconciliation worker. Returns `false` if not running.
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
            .detail("active_tests", state.active_tests)
            .detail("queued_tests", state.queued_tests)
            .detail("tracked_tests", state.tests.len())
            .detail("tracked_plans", state.plans.len())
            .detail("drift_corrections", state.drift_corrections)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
