//! Service recovery manager — durable record of in-flight plans and tests,
//! startup replay, and periodic save/backup/repair/eviction.
//!
//! The in-memory snapshot is the source for every write. File writes are
//! serialized by a dedicated I/O lock taken before the snapshot is copied,
//! so a later save can never be overwritten by an earlier one.
//!
//! The maintenance loop stays idle until startup recovery has run; before
//! that the in-memory snapshot is empty and must not replace the file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::errors::ErrorRecoveryManager;
use super::state::{
    load_state, read_json, write_json_atomic, PersistedPlanState, PersistedState,
    PersistedTestState, StateSource,
};
use crate::clock::{hours_to_ms, now_ms, IntervalSchedule};
use crate::error::{OrchestratorError, Result};
use crate::queue::QueueMonitor;
use crate::status::{StatusTracker, TrackerStats};
use crate::timeout::{TimeoutCallback, TimeoutManager};
use crate::types::config::PersistenceConfig;
use crate::types::plan::validate_priority;
use crate::types::{
    ComponentHealth, ErrorCategory, ErrorReport, ErrorSeverity, ExecutionPlan, PlanStatus,
    ServiceState, TestStatus, TestUpdate,
};
use crate::worker::{Worker, WorkerSet};

const COMPONENT: &str = "service_recovery";

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecoveryResult {
    pub source: StateSource,
    pub plans_recovered: usize,
    pub tests_recovered: usize,
    /// Tests moved to `failed` because they used up their recovery retries.
    pub tests_failed: usize,
    /// Plans whose every test had finished before the restart.
    pub plans_finalized: usize,
    pub stale_plans: usize,
    pub stale_tests: usize,
    pub recovered_test_ids: Vec<String>,
    pub errors: Vec<String>,
}

impl RecoveryResult {
    fn new(source: StateSource) -> Self {
        RecoveryResult {
            source,
            plans_recovered: 0,
            tests_recovered: 0,
            tests_failed: 0,
            plans_finalized: 0,
            stale_plans: 0,
            stale_tests: 0,
            recovered_test_ids: Vec::new(),
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountMismatch {
    pub plan_id: String,
    pub recorded_completed: usize,
    pub actual_completed: usize,
    pub recorded_failed: usize,
    pub actual_failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateIntegrityReport {
    pub valid: bool,
    pub plans: usize,
    pub tests: usize,
    /// Tests whose plan is not in the snapshot.
    pub orphaned_tests: Vec<String>,
    pub count_mismatches: Vec<CountMismatch>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub removed_orphans: usize,
    pub recounted_plans: usize,
}

impl RepairReport {
    pub fn is_empty(&self) -> bool {
        self.removed_orphans == 0 && self.recounted_plans == 0
    }
}

/// Outcome counts of a plan's tests: finished outcomes plus any terminal
/// test records not yet folded into them.
fn actual_counts(plan: &PersistedPlanState, state: &PersistedState) -> (usize, usize) {
    let mut outcomes: BTreeMap<&str, TestStatus> = plan
        .finished_tests
        .iter()
        .map(|(id, s)| (id.as_str(), *s))
        .collect();
    for t in state.tests.values() {
        if t.plan_id.as_deref() == Some(plan.plan_id.as_str()) && t.status.is_terminal() {
            outcomes.entry(t.test_id.as_str()).or_insert(t.status);
        }
    }
    let failed = outcomes.values().filter(|s| s.is_failure()).count();
    (outcomes.len() - failed, failed)
}

fn integrity_report(state: &PersistedState) -> StateIntegrityReport {
    let orphaned_tests: Vec<String> = state
        .tests
        .values()
        .filter(|t| match &t.plan_id {
            Some(plan_id) => !state.plans.contains_key(plan_id),
            None => true,
        })
        .map(|t| t.test_id.clone())
        .collect();
    let count_mismatches: Vec<CountMismatch> = state
        .plans
        .values()
        .filter_map(|plan| {
            let (completed, failed) = actual_counts(plan, state);
            if completed == plan.completed_tests && failed == plan.failed_tests {
                return None;
            }
            Some(CountMismatch {
                plan_id: plan.plan_id.clone(),
                recorded_completed: plan.completed_tests,
                actual_completed: completed,
                recorded_failed: plan.failed_tests,
                actual_failed: failed,
            })
        })
        .collect();
    StateIntegrityReport {
        valid: orphaned_tests.is_empty() && count_mismatches.is_empty(),
        plans: state.plans.len(),
        tests: state.tests.len(),
        orphaned_tests,
        count_mismatches,
    }
}

/// Validate the snapshot stored in `path` without loading a manager.
pub fn validate_state_file(path: &Path) -> Result<StateIntegrityReport> {
    let state: PersistedState = read_json(path)?.ok_or_else(|| {
        OrchestratorError::Persistence(format!("no state file at {}", path.display()))
    })?;
    Ok(integrity_report(&state))
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct Schedules {
    save: IntervalSchedule,
    backup: IntervalSchedule,
    consistency: IntervalSchedule,
    cleanup: IntervalSchedule,
}

impl Schedules {
    fn new(config: &PersistenceConfig) -> Self {
        Schedules {
            save: IntervalSchedule::new(config.save_interval_ms),
            backup: IntervalSchedule::new(config.backup_interval_ms),
            consistency: IntervalSchedule::new(config.consistency_interval_ms),
            cleanup: IntervalSchedule::new(config.cleanup_interval_ms),
        }
    }

    fn mark_all(&mut self, now: u64) {
        self.save.mark_run(now);
        self.backup.mark_run(now);
        self.consistency.mark_run(now);
        self.cleanup.mark_run(now);
    }
}

struct RecoveryState {
    snapshot: PersistedState,
    dirty: bool,
    ready: bool,
    saves: u64,
    backups: u64,
    save_failures: u64,
    last_save_failed: bool,
    last_save_ms: Option<u64>,
    last_backup_ms: Option<u64>,
    schedules: Schedules,
}

#[derive(Debug, Clone, Copy, Default)]
struct DueTasks {
    save: bool,
    backup: bool,
    consistency: bool,
    cleanup: bool,
}

pub struct ServiceRecoveryManager {
    config: PersistenceConfig,
    state_file: PathBuf,
    backup_file: PathBuf,
    stats_file: PathBuf,
    errors: Option<Arc<ErrorRecoveryManager>>,
    state: Mutex<RecoveryState>,
    io: Mutex<()>,
    workers: Mutex<Option<WorkerSet>>,
}

impl ServiceRecoveryManager {
    pub fn new(config: PersistenceConfig, state_dir: &Path) -> Self {
        ServiceRecoveryManager {
            state_file: state_dir.join(&config.state_file),
            backup_file: state_dir.join(&config.backup_file),
            stats_file: state_dir.join(&config.stats_file),
            errors: None,
            state: Mutex::new(RecoveryState {
                snapshot: PersistedState::default(),
                dirty: false,
                ready: false,
                saves: 0,
                backups: 0,
                save_failures: 0,
                last_save_failed: false,
                last_save_ms: None,
                last_backup_ms: None,
                schedules: Schedules::new(&config),
            }),
            config,
            io: Mutex::new(()),
            workers: Mutex::new(None),
        }
    }

    pub fn with_error_reporter(mut self, errors: Arc<ErrorRecoveryManager>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn backup_file(&self) -> &Path {
        &self.backup_file
    }

    fn report(&self, report: ErrorReport) {
        if let Some(errors) = &self.errors {
            errors.report_error(report);
        }
    }

    /// Mark the snapshot changed and, with `save_on_change`, write it now.
    fn changed(&self) {
        let save_now = {
            let mut state = self.state.lock();
            state.dirty = true;
            self.config.save_on_change
        };
        if save_now {
            // Failures are logged and reported by save_state.
            let _ = self.save_state();
        }
    }

    // -- persisted records --------------------------------------------------

    pub fn persist_test_state(&self, test: PersistedTestState) {
        {
            let mut state = self.state.lock();
            if let Some(plan_id) = &test.plan_id {
                if let Some(plan) = state.snapshot.plans.get_mut(plan_id) {
                    plan.test_states.insert(test.test_id.clone(), test.clone());
                }
            }
            state.snapshot.tests.insert(test.test_id.clone(), test);
        }
        self.changed();
    }

    pub fn persist_plan_state(&self, plan: &ExecutionPlan) {
        let now = now_ms();
        {
            let mut state = self.state.lock();
            match state.snapshot.plans.get_mut(&plan.plan_id) {
                Some(existing) => existing.refresh(plan, now),
                None => {
                    state
                        .snapshot
                        .plans
                        .insert(plan.plan_id.clone(), PersistedPlanState::from_plan(plan, now));
                }
            }
        }
        self.changed();
    }

    /// Record a test's terminal outcome on its plan and drop the test record.
    pub fn record_test_outcome(&self, plan_id: &str, test_id: &str, status: TestStatus) {
        {
            let mut state = self.state.lock();
            if let Some(plan) = state.snapshot.plans.get_mut(plan_id) {
                plan.finished_tests.insert(test_id.to_string(), status);
                plan.test_states.remove(test_id);
                plan.recount();
                plan.updated_at_ms = now_ms();
            }
            state.snapshot.tests.remove(test_id);
        }
        self.changed();
    }

    /// Remove a test record. Unknown ids are a no-op.
    pub fn remove_persisted_test(&self, test_id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.snapshot.tests.remove(test_id);
            if let Some(plan_id) = removed.as_ref().and_then(|t| t.plan_id.clone()) {
                if let Some(plan) = state.snapshot.plans.get_mut(&plan_id) {
                    plan.test_states.remove(test_id);
                }
            }
            removed.is_some()
        };
        if removed {
            self.changed();
        }
        removed
    }

    /// Remove a plan and every test record belonging to it.
    pub fn remove_persisted_plan(&self, plan_id: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.snapshot.plans.remove(plan_id).is_some();
            state
                .snapshot
                .tests
                .retain(|_, t| t.plan_id.as_deref() != Some(plan_id));
            removed
        };
        if removed {
            self.changed();
        }
        removed
    }

    pub fn get_persisted_test(&self, test_id: &str) -> Option<PersistedTestState> {
        self.state.lock().snapshot.tests.get(test_id).cloned()
    }

    pub fn get_persisted_plan(&self, plan_id: &str) -> Option<PersistedPlanState> {
        self.state.lock().snapshot.plans.get(plan_id).cloned()
    }

    pub fn snapshot(&self) -> PersistedState {
        self.state.lock().snapshot.clone()
    }

    // -- files --------------------------------------------------------------

    fn stamped_snapshot(&self) -> PersistedState {
        let state = self.state.lock();
        let mut snapshot = state.snapshot.clone();
        snapshot.timestamp = now_ms();
        snapshot.statistics = snapshot.compute_statistics(state.saves + 1);
        snapshot
    }

    /// Write the snapshot to the state file.
    pub fn save_state(&self) -> Result<()> {
        let _io = self.io.lock();
        let snapshot = self.stamped_snapshot();
        let result = write_json_atomic(&self.state_file, &snapshot);
        let now = now_ms();
        {
            let mut state = self.state.lock();
            match &result {
                Ok(()) => {
                    state.saves += 1;
                    state.dirty = false;
                    state.last_save_failed = false;
                    state.last_save_ms = Some(now);
                }
                Err(_) => {
                    state.save_failures += 1;
                    state.last_save_failed = true;
                }
            }
        }
        if let Err(e) = &result {
            error!(path = %self.state_file.display(), error = %e, "state save failed");
            self.report(
                ErrorReport::new(
                    ErrorCategory::SystemError,
                    ErrorSeverity::High,
                    COMPONENT,
                    format!("state save failed: {}", e),
                )
                .detail("path", self.state_file.display()),
            );
        } else {
            debug!(
                plans = snapshot.plans.len(),
                tests = snapshot.tests.len(),
                "state saved"
            );
        }
        result
    }

    /// Write the snapshot to the backup file.
    pub fn create_backup(&self) -> Result<()> {
        let _io = self.io.lock();
        let snapshot = self.stamped_snapshot();
        let result = write_json_atomic(&self.backup_file, &snapshot);
        match &result {
            Ok(()) => {
                let mut state = self.state.lock();
                state.backups += 1;
                state.last_backup_ms = Some(now_ms());
                drop(state);
                debug!(path = %self.backup_file.display(), "state backup written");
            }
            Err(e) => {
                warn!(path = %self.backup_file.display(), error = %e, "state backup failed");
                self.report(
                    ErrorReport::new(
                        ErrorCategory::SystemError,
                        ErrorSeverity::Medium,
                        COMPONENT,
                        format!("state backup failed: {}", e),
                    )
                    .detail("path", self.backup_file.display()),
                );
            }
        }
        result
    }

    pub fn save_stats(&self, stats: &TrackerStats) -> Result<()> {
        write_json_atomic(&self.stats_file, stats)
    }

    pub fn load_stats(&self) -> Result<Option<TrackerStats>> {
        read_json(&self.stats_file)
    }

    // -- startup recovery ---------------------------------------------------

    pub fn recover_on_startup(
        &self,
        tracker: &StatusTracker,
        queue: &QueueMonitor,
        timeouts: &TimeoutManager,
        on_timeout: TimeoutCallback,
    ) -> RecoveryResult {
        self.recover_on_startup_at(tracker, queue, timeouts, on_timeout, now_ms())
    }

    /// Load the persisted snapshot and replay unfinished work.
    ///
    /// Entries older than `max_recovery_age_hours` are dropped. Each
    /// unfinished test goes back to `queued` with its retry count bumped and
    /// its timeout monitor re-registered, or to `failed` once it exceeds
    /// `max_retries`. Plans are re-queued holding only their unfinished
    /// tests. A problem with one entry is recorded and the rest continue.
    pub fn recover_on_startup_at(
        &self,
        tracker: &StatusTracker,
        queue: &QueueMonitor,
        timeouts: &TimeoutManager,
        on_timeout: TimeoutCallback,
        now: u64,
    ) -> RecoveryResult {
        let loaded = load_state(&self.state_file, &self.backup_file);
        let mut result = RecoveryResult::new(loaded.source);
        result.errors.extend(loaded.errors);
        let mut snapshot = loaded.state;
        let max_age = hours_to_ms(self.config.max_recovery_age_hours);

        let before_plans = snapshot.plans.len();
        snapshot
            .plans
            .retain(|_, p| now.saturating_sub(p.updated_at_ms) <= max_age);
        result.stale_plans = before_plans - snapshot.plans.len();
        let before_tests = snapshot.tests.len();
        snapshot
            .tests
            .retain(|_, t| now.saturating_sub(t.updated_at_ms) <= max_age);
        result.stale_tests = before_tests - snapshot.tests.len();

        let plan_ids: Vec<String> = snapshot.plans.keys().cloned().collect();
        let mut recovered = PersistedState {
            version: snapshot.version,
            ..PersistedState::default()
        };
        for plan_id in plan_ids {
            let Some(plan) = snapshot.plans.remove(&plan_id) else {
                continue;
            };
            let outcome = self.recover_plan(
                plan,
                &mut snapshot,
                tracker,
                queue,
                timeouts,
                &on_timeout,
                &mut result,
            );
            match outcome {
                Ok(Some((plan, tests))) => {
                    recovered.tests.extend(tests.into_iter().map(|t| (t.test_id.clone(), t)));
                    recovered.plans.insert(plan.plan_id.clone(), plan);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(plan_id = %plan_id, error = %e, "plan not recovered");
                    result.errors.push(format!("plan {}: {}", plan_id, e));
                }
            }
        }

        // Whatever is left belongs to no recoverable plan.
        for test in snapshot.tests.into_values() {
            if test.status.is_terminal() {
                continue;
            }
            let owner = test.plan_id.as_deref().unwrap_or("<none>");
            warn!(test_id = %test.test_id, plan_id = owner, "orphaned test discarded");
            result
                .errors
                .push(format!("test {}: plan {} not recoverable", test.test_id, owner));
        }

        info!(
            source = ?result.source,
            plans = result.plans_recovered,
            tests = result.tests_recovered,
            failed = result.tests_failed,
            stale = result.stale_plans + result.stale_tests,
            errors = result.errors.len(),
            "startup recovery finished"
        );

        {
            let mut state = self.state.lock();
            state.snapshot = recovered;
            state.dirty = true;
            state.ready = true;
        }
        if let Err(e) = self.save_state() {
            result.errors.push(format!("save after recovery: {}", e));
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn recover_plan(
        &self,
        mut plan: PersistedPlanState,
        snapshot: &mut PersistedState,
        tracker: &StatusTracker,
        queue: &QueueMonitor,
        timeouts: &TimeoutManager,
        on_timeout: &TimeoutCallback,
        result: &mut RecoveryResult,
    ) -> Result<Option<(PersistedPlanState, Vec<PersistedTestState>)>> {
        if plan.status.is_terminal() {
            queue.mark_seen(&plan.plan_id);
            snapshot
                .tests
                .retain(|_, t| t.plan_id.as_deref() != Some(plan.plan_id.as_str()));
            return Ok(None);
        }
        validate_priority(&plan.plan_id, plan.priority)?;
        if plan.test_case_ids.is_empty() {
            return Err(OrchestratorError::invalid_plan(&plan.plan_id, "no test cases"));
        }

        // Fold terminal test records into the plan's outcomes.
        let plan_id = plan.plan_id.clone();
        let mut tests: BTreeMap<String, PersistedTestState> = std::mem::take(&mut plan.test_states);
        let owned: Vec<String> = snapshot
            .tests
            .values()
            .filter(|t| t.plan_id.as_deref() == Some(plan_id.as_str()))
            .map(|t| t.test_id.clone())
            .collect();
        for id in owned {
            if let Some(t) = snapshot.tests.remove(&id) {
                tests.insert(id, t);
            }
        }
        for t in tests.values() {
            if t.status.is_terminal() {
                plan.finished_tests.entry(t.test_id.clone()).or_insert(t.status);
            }
        }

        let mut requeued = Vec::new();
        for test_id in plan.remaining_tests() {
            let mut test = tests
                .remove(&test_id)
                .unwrap_or_else(|| PersistedTestState::new(&test_id, Some(&plan_id), TestStatus::Queued, now_ms()));
            test.retry_count += 1;
            if test.retry_count > self.config.max_retries {
                warn!(test_id = %test_id, retries = test.retry_count - 1, "recovery retries exhausted");
                tracker.update_test_status(
                    &test_id,
                    TestStatus::Failed,
                    TestUpdate::new()
                        .plan(plan_id.clone())
                        .message("recovery retries exhausted"),
                );
                plan.finished_tests.insert(test_id.clone(), TestStatus::Failed);
                result.tests_failed += 1;
                continue;
            }
            test.status = TestStatus::Queued;
            test.environment_id = None;
            test.progress = 0.0;
            test.plan_id = Some(plan_id.clone());
            test.message = Some("recovered after restart".into());
            tracker.update_test_status(
                &test_id,
                TestStatus::Queued,
                TestUpdate::new()
                    .plan(plan_id.clone())
                    .message("recovered after restart"),
            );
            if let Some(secs) = test.timeout_secs {
                timeouts.add_monitor(&test_id, Duration::from_secs(secs), on_timeout.clone());
            }
            result.recovered_test_ids.push(test_id.clone());
            result.tests_recovered += 1;
            requeued.push(test);
        }
        plan.recount();

        if requeued.is_empty() {
            let status = if plan.failed_tests > 0 {
                PlanStatus::Failed
            } else {
                PlanStatus::Completed
            };
            tracker.update_plan_status(&plan_id, status, Some(&plan.submission_id));
            tracker.update_plan_progress(&plan_id, plan.total_tests, plan.completed_tests, plan.failed_tests);
            queue.mark_seen(&plan_id);
            info!(plan_id = %plan_id, status = %status, "plan finished before restart; finalized");
            result.plans_finalized += 1;
            return Ok(None);
        }

        plan.status = PlanStatus::Queued;
        plan.updated_at_ms = now_ms();
        tracker.update_plan_status(&plan_id, PlanStatus::Queued, Some(&plan.submission_id));
        tracker.update_plan_progress(&plan_id, plan.total_tests, plan.completed_tests, plan.failed_tests);
        if !queue.enqueue_recovered(plan.to_recovered_plan()) {
            debug!(plan_id = %plan_id, "recovered plan already queued");
        }
        result.plans_recovered += 1;
        plan.test_states = requeued
            .iter()
            .map(|t| (t.test_id.clone(), t.clone()))
            .collect();
        Ok(Some((plan, requeued)))
    }

    // -- consistency --------------------------------------------------------

    /// Read-only consistency check of the in-memory snapshot.
    pub fn validate_state_integrity(&self) -> StateIntegrityReport {
        integrity_report(&self.state.lock().snapshot)
    }

    /// Drop orphaned tests and recompute plan counters from their tests.
    pub fn repair_state_consistency(&self) -> RepairReport {
        let mut report = RepairReport::default();
        {
            let mut state = self.state.lock();
            let snapshot = &mut state.snapshot;
            let plans = &snapshot.plans;
            let before = snapshot.tests.len();
            snapshot.tests.retain(|_, t| match &t.plan_id {
                Some(plan_id) => plans.contains_key(plan_id),
                None => false,
            });
            report.removed_orphans = before - snapshot.tests.len();

            let terminal: Vec<(String, String, TestStatus)> = snapshot
                .tests
                .values()
                .filter(|t| t.status.is_terminal())
                .filter_map(|t| Some((t.plan_id.clone()?, t.test_id.clone(), t.status)))
                .collect();
            for (plan_id, test_id, status) in terminal {
                if let Some(plan) = snapshot.plans.get_mut(&plan_id) {
                    plan.finished_tests.entry(test_id.clone()).or_insert(status);
                    plan.test_states.remove(&test_id);
                }
                snapshot.tests.remove(&test_id);
            }
            for plan in snapshot.plans.values_mut() {
                let before = (plan.completed_tests, plan.failed_tests);
                plan.recount();
                if before != (plan.completed_tests, plan.failed_tests) {
                    report.recounted_plans += 1;
                }
            }
        }
        if !report.is_empty() {
            warn!(
                removed_orphans = report.removed_orphans,
                recounted_plans = report.recounted_plans,
                "persisted state repaired"
            );
            self.changed();
        }
        report
    }

    pub fn cleanup_old_entries(&self, max_age_hours: u64) -> usize {
        self.cleanup_old_entries_at(max_age_hours, now_ms())
    }

    /// Evict terminal plans and tests older than `max_age_hours`.
    pub fn cleanup_old_entries_at(&self, max_age_hours: u64, now: u64) -> usize {
        let cutoff = now.saturating_sub(hours_to_ms(max_age_hours));
        let removed = {
            let mut state = self.state.lock();
            let snapshot = &mut state.snapshot;
            let before = snapshot.plans.len() + snapshot.tests.len();
            snapshot
                .plans
                .retain(|_, p| !(p.status.is_terminal() && p.updated_at_ms < cutoff));
            snapshot
                .tests
                .retain(|_, t| !(t.status.is_terminal() && t.updated_at_ms < cutoff));
            before - snapshot.plans.len() - snapshot.tests.len()
        };
        if removed > 0 {
            debug!(removed, "old persisted entries evicted");
            self.changed();
        }
        removed
    }

    // -- background loop ----------------------------------------------------

    pub fn run_maintenance(&self) {
        self.run_maintenance_at(now_ms());
    }

    /// Run whichever periodic tasks are due at `now`.
    pub fn run_maintenance_at(&self, now: u64) {
        let due = {
            let mut state = self.state.lock();
            if !state.ready {
                return;
            }
            let mut due = DueTasks::default();
            let dirty = state.dirty;
            let s = &mut state.schedules;
            if s.save.is_due(now) {
                s.save.mark_run(now);
                due.save = dirty;
            }
            if s.backup.is_due(now) {
                s.backup.mark_run(now);
                due.backup = true;
            }
            if s.consistency.is_due(now) {
                s.consistency.mark_run(now);
                due.consistency = true;
            }
            if s.cleanup.is_due(now) {
                s.cleanup.mark_run(now);
                due.cleanup = true;
            }
            due
        };

        if due.consistency {
            self.repair_state_consistency();
        }
        if due.cleanup {
            self.cleanup_old_entries_at(self.config.cleanup_age_hours, now);
        }
        if due.save {
            let _ = self.save_state();
        }
        if due.backup {
            let _ = self.create_backup();
        }
    }

    pub fn start(self: &Arc<Self>) -> std::io::Result<bool> {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return Ok(false);
        }
        self.state.lock().schedules.mark_all(now_ms());
        let mut set = WorkerSet::new();
        let weak: Weak<ServiceRecoveryManager> = Arc::downgrade(self);
        set.push(Worker::spawn_periodic(
            "state-persistence",
            set.shutdown(),
            Duration::from_millis(self.config.tick_ms),
            move || {
                if let Some(manager) = weak.upgrade() {
                    manager.run_maintenance();
                }
            },
        )?);
        *workers = Some(set);
        Ok(true)
    }

    /// Stop the loop and write a final snapshot.
    pub fn stop(&self, timeout: Duration) -> bool {
        let set = self.workers.lock().take();
        let Some(set) = set else {
            return false;
        };
        set.stop(timeout);
        if self.state.lock().ready {
            let _ = self.save_state();
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    pub fn health(&self) -> ComponentHealth {
        let running = self.is_running();
        let state = self.state.lock();
        let status = if !running {
            ServiceState::Stopped
        } else if state.last_save_failed {
            ServiceState::Degraded
        } else {
            ServiceState::Healthy
        };
        ComponentHealth::new(status)
            .detail("persisted_plans", state.snapshot.plans.len())
            .detail("persisted_tests", state.snapshot.tests.len())
            .detail("saves", state.saves)
            .detail("backups", state.backups)
            .detail("save_failures", state.save_failures)
            .detail("last_save_ms", state.last_save_ms)
            .detail("last_backup_ms", state.last_backup_ms)
            .detail("state_file", self.state_file.display().to_string())
    }
}

impl std::fmt::Debug for ServiceRecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRecoveryManager")
            .field("state_file", &self.state_file)
            .field("backup_file", &self.backup_file)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryPlanSource;
    use crate::types::config::{StatusConfig, TimeoutConfig};
    use crate::types::{HardwareRequirements, PlanSubmission};

    struct Harness {
        _dir: tempfile::TempDir,
        dir: PathBuf,
        tracker: StatusTracker,
        queue: QueueMonitor,
        timeouts: TimeoutManager,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        Harness {
            dir: dir.path().to_path_buf(),
            _dir: dir,
            tracker: StatusTracker::new(StatusConfig::default()),
            queue: QueueMonitor::new(Arc::new(InMemoryPlanSource::new())),
            timeouts: TimeoutManager::new(TimeoutConfig::default()),
        }
    }

    fn manager(dir: &Path) -> ServiceRecoveryManager {
        ServiceRecoveryManager::new(PersistenceConfig::default(), dir)
    }

    fn noop() -> TimeoutCallback {
        Arc::new(|_| {})
    }

    fn plan(id: &str, tests: &[&str]) -> ExecutionPlan {
        ExecutionPlan::from_submission(PlanSubmission {
            plan_id: id.into(),
            submission_id: format!("sub-{}", id),
            test_case_ids: tests.iter().map(|t| t.to_string()).collect(),
            priority: 5,
            hardware_requirements: HardwareRequirements::default(),
            created_at_ms: 1,
        })
        .unwrap()
    }

    fn running(test_id: &str, plan_id: &str) -> PersistedTestState {
        let mut t = PersistedTestState::new(test_id, Some(plan_id), TestStatus::Running, now_ms());
        t.timeout_secs = Some(60);
        t
    }

    #[test]
    fn persist_twice_remove_once_leaves_nothing() {
        let h = harness();
        let m = manager(&h.dir);
        let mut p = plan("p1", &["t1"]);
        m.persist_plan_state(&p);
        p.status = PlanStatus::Running;
        m.persist_plan_state(&p);
        m.persist_test_state(running("t1", "p1"));
        m.persist_test_state(running("t1", "p1"));
        assert_eq!(m.snapshot().tests.len(), 1);
        assert_eq!(m.get_persisted_plan("p1").unwrap().test_states.len(), 1);

        assert!(m.remove_persisted_test("t1"));
        assert!(!m.remove_persisted_test("t1"));
        assert!(m.remove_persisted_plan("p1"));
        assert!(!m.remove_persisted_plan("p1"));
        assert!(m.snapshot().is_empty());
    }

    #[test]
    fn save_on_change_writes_state_file() {
        let h = harness();
        let m = manager(&h.dir);
        m.persist_plan_state(&plan("p1", &["t1", "t2"]));
        let on_disk: PersistedState = read_json(m.state_file()).unwrap().unwrap();
        assert_eq!(on_disk.plans.len(), 1);
        assert_eq!(on_disk.statistics.total_plans, 1);
        assert!(on_disk.timestamp > 0);
    }

    #[test]
    fn crash_mid_plan_requeues_only_unfinished_tests() {
        let h = harness();
        {
            let m = manager(&h.dir);
            let mut p = plan("p1", &["t1", "t2", "t3", "t4", "t5"]);
            p.status = PlanStatus::Running;
            m.persist_plan_state(&p);
            for id in ["t1", "t2", "t3"] {
                m.persist_test_state(running(id, "p1"));
            }
            m.record_test_outcome("p1", "t1", TestStatus::Completed);
            m.record_test_outcome("p1", "t2", TestStatus::Completed);
            // Process dies here.
        }

        let m = manager(&h.dir);
        let result = m.recover_on_startup(&h.tracker, &h.queue, &h.timeouts, noop());
        assert_eq!(result.source, StateSource::Primary);
        assert_eq!(result.plans_recovered, 1);
        assert_eq!(result.recovered_test_ids, vec!["t3", "t4", "t5"]);
        assert!(result.errors.is_empty(), "{:?}", result.errors);

        let queued = h.queue.get_next_execution_plan().unwrap();
        assert_eq!(queued.test_case_ids, vec!["t3", "t4", "t5"]);
        assert_eq!(queued.completed_tests, 2);
        assert_eq!(queued.total_tests, 5);

        assert_eq!(h.tracker.get_plan_status("p1").unwrap().status, PlanStatus::Queued);
        assert_eq!(h.tracker.get_test_status("t3").unwrap().status, TestStatus::Queued);
        assert!(h.tracker.get_test_status("t1").is_none());
        // Only t3 had a timeout registered.
        assert!(h.timeouts.has_monitor("t3"));
        assert!(!h.timeouts.has_monitor("t4"));
        assert_eq!(m.get_persisted_test("t3").unwrap().retry_count, 1);
    }

    #[test]
    fn exhausted_retries_mark_test_failed() {
        let h = harness();
        {
            let m = manager(&h.dir);
            let mut p = plan("p1", &["t1"]);
            p.status = PlanStatus::Running;
            m.persist_plan_state(&p);
            let mut t = running("t1", "p1");
            t.retry_count = 3;
            m.persist_test_state(t);
        }
        let m = manager(&h.dir);
        let result = m.recover_on_startup(&h.tracker, &h.queue, &h.timeouts, noop());
        assert_eq!(result.tests_failed, 1);
        assert_eq!(result.plans_finalized, 1);
        assert_eq!(h.tracker.get_test_status("t1").unwrap().status, TestStatus::Failed);
        assert_eq!(h.tracker.get_plan_status("p1").unwrap().status, PlanStatus::Failed);
        assert_eq!(h.queue.get_queued_plan_count(), 0);
        assert!(m.snapshot().is_empty());
    }

    #[test]
    fn finished_plans_are_not_polled_again_after_recovery() {
        let h = harness();
        {
            let m = manager(&h.dir);
            let mut p1 = plan("p1", &["t1"]);
            p1.status = PlanStatus::Running;
            m.persist_plan_state(&p1);
            m.record_test_outcome("p1", "t1", TestStatus::Completed);
            let mut p2 = plan("p2", &["t2"]);
            p2.status = PlanStatus::Completed;
            m.persist_plan_state(&p2);
        }

        // Both submissions are still in the store.
        let source = Arc::new(InMemoryPlanSource::new());
        for id in ["p1", "p2"] {
            source.submit(PlanSubmission {
                plan_id: id.into(),
                submission_id: format!("sub-{}", id),
                test_case_ids: vec![id.replace('p', "t")],
                priority: 5,
                hardware_requirements: HardwareRequirements::default(),
                created_at_ms: 1,
            });
        }
        let queue = QueueMonitor::new(source);

        let m = manager(&h.dir);
        let result = m.recover_on_startup(&h.tracker, &queue, &h.timeouts, noop());
        assert_eq!(result.plans_finalized, 1);
        assert_eq!(h.tracker.get_plan_status("p1").unwrap().status, PlanStatus::Completed);
        assert!(queue.poll_for_new_plans().is_empty());
        assert!(queue.get_next_execution_plan().is_none());
    }

    #[test]
    fn stale_entries_are_discarded() {
        let h = harness();
        {
            let m = manager(&h.dir);
            m.persist_plan_state(&plan("p1", &["t1"]));
            m.persist_test_state(running("t1", "p1"));
        }
        let m = manager(&h.dir);
        let later = now_ms() + hours_to_ms(25);
        let result = m.recover_on_startup_at(&h.tracker, &h.queue, &h.timeouts, noop(), later);
        assert_eq!(result.stale_plans, 1);
        assert_eq!(result.stale_tests, 1);
        assert_eq!(result.plans_recovered, 0);
        assert_eq!(h.queue.get_queued_plan_count(), 0);
    }

    #[test]
    fn bad_entries_do_not_abort_recovery() {
        let h = harness();
        let mut state = PersistedState::default();
        let now = now_ms();
        let mut good = PersistedPlanState::from_plan(&plan("good", &["g1"]), now);
        good.status = PlanStatus::Running;
        let mut bad = PersistedPlanState::from_plan(&plan("bad", &["b1"]), now);
        bad.priority = 42;
        state.plans.insert("good".into(), good);
        state.plans.insert("bad".into(), bad);
        state.tests.insert(
            "lonely".into(),
            PersistedTestState::new("lonely", None, TestStatus::Running, now),
        );
        let m = manager(&h.dir);
        write_json_atomic(m.state_file(), &state).unwrap();

        let result = m.recover_on_startup(&h.tracker, &h.queue, &h.timeouts, noop());
        assert_eq!(result.plans_recovered, 1);
        assert_eq!(result.errors.len(), 2, "{:?}", result.errors);
        assert_eq!(h.queue.get_next_execution_plan().unwrap().plan_id, "good");
    }

    #[test]
    fn recovery_uses_backup_when_primary_corrupt() {
        let h = harness();
        {
            let m = manager(&h.dir);
            m.persist_plan_state(&plan("p1", &["t1"]));
            m.create_backup().unwrap();
        }
        std::fs::write(h.dir.join(&PersistenceConfig::default().state_file), "{").unwrap();
        let m = manager(&h.dir);
        let result = m.recover_on_startup(&h.tracker, &h.queue, &h.timeouts, noop());
        assert_eq!(result.source, StateSource::Backup);
        assert_eq!(result.plans_recovered, 1);
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn integrity_check_and_repair() {
        let h = harness();
        let m = manager(&h.dir);
        m.persist_plan_state(&plan("p1", &["t1", "t2"]));
        m.persist_test_state(PersistedTestState::new("ghost", Some("gone"), TestStatus::Running, now_ms()));
        m.persist_test_state(PersistedTestState::new("t1", Some("p1"), TestStatus::Completed, now_ms()));

        let report = m.validate_state_integrity();
        assert!(!report.valid);
        assert_eq!(report.orphaned_tests, vec!["ghost"]);
        assert_eq!(report.count_mismatches.len(), 1);
        assert_eq!(report.count_mismatches[0].actual_completed, 1);
        // Validation does not mutate.
        assert_eq!(m.snapshot().tests.len(), 2);

        let repair = m.repair_state_consistency();
        assert_eq!(repair.removed_orphans, 1);
        assert_eq!(repair.recounted_plans, 1);
        assert!(m.validate_state_integrity().valid);
        assert_eq!(m.get_persisted_plan("p1").unwrap().completed_tests, 1);
        assert!(m.get_persisted_test("t1").is_none());

        let from_file = validate_state_file(m.state_file()).unwrap();
        assert!(from_file.valid);
    }

    #[test]
    fn cleanup_evicts_old_terminal_entries() {
        let h = harness();
        let m = manager(&h.dir);
        let mut done = plan("done", &["a"]);
        done.status = PlanStatus::Completed;
        m.persist_plan_state(&done);
        m.persist_plan_state(&plan("open", &["b"]));
        assert_eq!(m.cleanup_old_entries(48), 0);
        assert_eq!(m.cleanup_old_entries_at(48, now_ms() + hours_to_ms(49)), 1);
        assert!(m.get_persisted_plan("open").is_some());
    }

    #[test]
    fn maintenance_waits_for_recovery() {
        let h = harness();
        std::fs::create_dir_all(&h.dir).unwrap();
        let mut state = PersistedState::default();
        state
            .plans
            .insert("p1".into(), PersistedPlanState::from_plan(&plan("p1", &["t"]), now_ms()));
        let m = manager(&h.dir);
        write_json_atomic(m.state_file(), &state).unwrap();

        // Not ready: the empty in-memory snapshot must not overwrite the file.
        m.run_maintenance_at(now_ms() + hours_to_ms(1));
        let on_disk: PersistedState = read_json(m.state_file()).unwrap().unwrap();
        assert_eq!(on_disk.plans.len(), 1);

        m.recover_on_startup(&h.tracker, &h.queue, &h.timeouts, noop());
        m.run_maintenance_at(now_ms() + hours_to_ms(1));
        assert!(m.backup_file().exists());
    }

    #[test]
    fn stats_round_trip() {
        let h = harness();
        let m = manager(&h.dir);
        assert!(m.load_stats().unwrap().is_none());
        let stats = TrackerStats {
            tests_completed: 4,
            tests_failed: 1,
            plans_completed: 2,
            plans_failed: 0,
        };
        m.save_stats(&stats).unwrap();
        assert_eq!(m.load_stats().unwrap(), Some(stats));
    }

    #[test]
    fn start_stop_writes_final_state() {
        let h = harness();
        let m = Arc::new(manager(&h.dir));
        m.recover_on_startup(&h.tracker, &h.queue, &h.timeouts, noop());
        assert!(m.start().unwrap());
        assert!(!m.start().unwrap());
        assert_eq!(m.health().status, ServiceState::Healthy);
        assert!(m.stop(Duration::from_secs(2)));
        assert!(!m.stop(Duration::from_secs(1)));
        assert!(m.state_file().exists());
        assert_eq!(m.health().status, ServiceState::Stopped);
    }
}
