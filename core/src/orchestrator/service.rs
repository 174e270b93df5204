//! Orchestrator service — owns every component, runs the scheduling loop,
//! and drives each test from allocation to release.
//!
//! # Lifecycle
//!
//! `stopped → starting → running → stopping → stopped`. The transition out
//! of `stopped` (and out of `running`) is claimed under the lifecycle lock,
//! so of several concurrent `start` or `stop` calls exactly one proceeds.
//! The slow part of either transition runs outside the lock.
//!
//! # Main loop
//!
//! Each iteration polls the plan source, takes the highest-priority plan,
//! and dispatches its tests one by one. A dispatch waits for a free
//! execution slot and a matching environment, then hands the test to its
//! own thread. Test threads and the timeout callback race to finish a test;
//! `StatusTracker::finish_test` picks the winner, and only the winner
//! releases the environment and counts the outcome.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::health::{LifecycleState, ServiceCounters, ServiceHealth, SystemMetrics, TimeoutMetrics};
use crate::clock::now_ms;
use crate::error::Result;
use crate::execution::{runner_from_config, TestRequest, TestRunner};
use crate::infrastructure::ProvisionerRegistry;
use crate::queue::{PlanSource, QueueMonitor};
use crate::recovery::{
    default_actions, ErrorRecoveryManager, PersistedTestState, RecoveryResult,
    ServiceRecoveryManager, StateDirLock,
};
use crate::resource::ResourceManager;
use crate::status::StatusTracker;
use crate::timeout::{TimeoutCallback, TimeoutEvent, TimeoutManager, TimeoutReason};
use crate::types::config::OrchestratorConfig;
use crate::types::{
    ErrorCategory, ErrorEvent, ErrorReport, ErrorSeverity, ExecutionPlan, PlanStatus, TestStatus,
    TestUpdate,
};
use crate::worker::{Shutdown, Slots, Worker};

const COMPONENT: &str = "orchestrator";

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Plan bookkeeping
// ---------------------------------------------------------------------------

/// A plan being executed. `outstanding` counts dispatched-or-pending tests
/// that have not produced an outcome yet.
struct PlanRun {
    progress: Mutex<PlanProgress>,
}

struct PlanProgress {
    plan: ExecutionPlan,
    outstanding: usize,
}

impl PlanRun {
    fn new(plan: ExecutionPlan) -> Self {
        let outstanding = plan.test_case_ids.len();
        PlanRun {
            progress: Mutex::new(PlanProgress { plan, outstanding }),
        }
    }

    /// Count one outcome. Returns the updated plan and whether it was the last.
    fn record(&self, status: TestStatus) -> (ExecutionPlan, bool) {
        let mut progress = self.progress.lock();
        progress.plan.record_outcome(!status.is_failure());
        progress.outstanding = progress.outstanding.saturating_sub(1);
        (progress.plan.clone(), progress.outstanding == 0)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

struct Lifecycle {
    state: LifecycleState,
    shutdown: Shutdown,
    main: Option<Worker>,
    lock: Option<StateDirLock>,
    started_at_ms: Option<u64>,
    last_recovery: Option<RecoveryResult>,
}

struct Started {
    shutdown: Shutdown,
    main: Worker,
    lock: StateDirLock,
    recovery: RecoveryResult,
}

// ---------------------------------------------------------------------------
// OrchestratorService
// ---------------------------------------------------------------------------

pub struct OrchestratorService {
    config: OrchestratorConfig,
    tracker: Arc<StatusTracker>,
    queue: Arc<QueueMonitor>,
    resources: Arc<ResourceManager>,
    timeouts: Arc<TimeoutManager>,
    errors: Arc<ErrorRecoveryManager>,
    persistence: Arc<ServiceRecoveryManager>,
    runner: Arc<dyn TestRunner>,
    on_timeout: TimeoutCallback,
    slots: Slots,
    lifecycle: Mutex<Lifecycle>,
    plans: Mutex<HashMap<String, Arc<PlanRun>>>,
    counters: Mutex<ServiceCounters>,
}

impl OrchestratorService {
    /// Build a service with the provisioners and runner the config selects.
    pub fn new(config: OrchestratorConfig, source: Arc<dyn PlanSource>) -> Result<Arc<Self>> {
        let provisioners = ProvisionerRegistry::from_config(&config.provisioners);
        let runner = runner_from_config(&config.runner);
        Self::with_backends(config, source, provisioners, runner)
    }

    pub fn with_backends(
        config: OrchestratorConfig,
        source: Arc<dyn PlanSource>,
        provisioners: ProvisionerRegistry,
        runner: Arc<dyn TestRunner>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let errors = Arc::new(ErrorRecoveryManager::new(config.errors.clone()));
        let tracker = Arc::new(StatusTracker::new(config.status.clone()));
        let queue = Arc::new(QueueMonitor::new(source));
        let resources = Arc::new(
            ResourceManager::new(config.resources.clone(), provisioners)
                .with_error_reporter(errors.clone()),
        );
        let timeouts = Arc::new(TimeoutManager::new(config.timeouts.clone()));
        let persistence = Arc::new(
            ServiceRecoveryManager::new(config.persistence.clone(), &config.state_dir)
                .with_error_reporter(errors.clone()),
        );
        for action in default_actions(Arc::downgrade(&resources)) {
            if let Err(e) = errors.register_recovery_action(action) {
                warn!(error = %e, "recovery action not registered");
            }
        }

        let service = Arc::new_cyclic(|weak: &Weak<OrchestratorService>| {
            let timeout_owner = weak.clone();
            let on_timeout: TimeoutCallback = Arc::new(move |event: &TimeoutEvent| {
                if let Some(service) = timeout_owner.upgrade() {
                    service.handle_timeout(event);
                }
            });
            let exhaustion_owner = weak.clone();
            errors.set_exhaustion_handler(Arc::new(move |event: &ErrorEvent| {
                if let Some(service) = exhaustion_owner.upgrade() {
                    service.handle_exhausted(event);
                }
            }));
            OrchestratorService {
                slots: Slots::new(config.max_concurrent_tests),
                config,
                tracker,
                queue,
                resources,
                timeouts,
                errors,
                persistence,
                runner,
                on_timeout,
                lifecycle: Mutex::new(Lifecycle {
                    state: LifecycleState::Stopped,
                    shutdown: Shutdown::new(),
                    main: None,
                    lock: None,
                    started_at_ms: None,
                    last_recovery: None,
                }),
                plans: Mutex::new(HashMap::new()),
                counters: Mutex::new(ServiceCounters::default()),
            }
        });
        Ok(service)
    }

    // -- accessors ----------------------------------------------------------

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.tracker
    }

    pub fn queue(&self) -> &Arc<QueueMonitor> {
        &self.queue
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn timeouts(&self) -> &Arc<TimeoutManager> {
        &self.timeouts
    }

    pub fn errors(&self) -> &Arc<ErrorRecoveryManager> {
        &self.errors
    }

    pub fn persistence(&self) -> &Arc<ServiceRecoveryManager> {
        &self.persistence
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle_state() == LifecycleState::Running
    }

    /// Result of the startup recovery performed by the last `start`.
    pub fn last_recovery(&self) -> Option<RecoveryResult> {
        self.lifecycle.lock().last_recovery.clone()
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.config.stop_timeout_ms)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Start every component, replay persisted work and launch the main loop.
    ///
    /// Returns `Ok(false)` without side effects unless the service is stopped.
    /// On error every component that did start is stopped again.
    pub fn start(self: &Arc<Self>) -> Result<bool> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != LifecycleState::Stopped {
                return Ok(false);
            }
            lifecycle.state = LifecycleState::Starting;
        }
        info!(state_dir = %self.config.state_dir.display(), "orchestrator starting");

        match self.start_components() {
            Ok(started) => {
                let recovery = started.recovery.clone();
                {
                    let mut lifecycle = self.lifecycle.lock();
                    lifecycle.state = LifecycleState::Running;
                    lifecycle.shutdown = started.shutdown;
                    lifecycle.main = Some(started.main);
                    lifecycle.lock = Some(started.lock);
                    lifecycle.started_at_ms = Some(now_ms());
                    lifecycle.last_recovery = Some(started.recovery);
                }
                info!(
                    plans_recovered = recovery.plans_recovered,
                    tests_recovered = recovery.tests_recovered,
                    max_concurrent_tests = self.slots.capacity(),
                    "orchestrator running"
                );
                Ok(true)
            }
            Err(e) => {
                error!(error = %e, "orchestrator failed to start");
                self.stop_components(self.stop_timeout());
                self.lifecycle.lock().state = LifecycleState::Stopped;
                Err(e)
            }
        }
    }

    fn start_components(self: &Arc<Self>) -> Result<Started> {
        let lock = StateDirLock::acquire(&self.config.state_dir)?;
        self.tracker.start()?;
        self.resources.start()?;
        self.timeouts.start()?;
        self.errors.start()?;
        self.persistence.start()?;

        let recovery = self.persistence.recover_on_startup(
            &self.tracker,
            &self.queue,
            &self.timeouts,
            self.on_timeout.clone(),
        );
        match self.persistence.load_stats() {
            Ok(Some(stats)) => self.tracker.restore_stats(stats),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "stats snapshot unreadable; starting from zero"),
        }

        let shutdown = Shutdown::new();
        let loop_shutdown = shutdown.clone();
        let weak = Arc::downgrade(self);
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let main = Worker::spawn("orchestrator-main", move || {
            main_loop(weak, loop_shutdown, poll)
        })?;
        Ok(Started {
            shutdown,
            main,
            lock,
            recovery,
        })
    }

    /// Stop the main loop, wait for in-flight tests, stop every component in
    /// reverse start order and write the final state and stats.
    ///
    /// Returns `false` without side effects unless the service is running.
    pub fn stop(&self) -> bool {
        let (shutdown, main, lock) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != LifecycleState::Running {
                return false;
            }
            lifecycle.state = LifecycleState::Stopping;
            (
                lifecycle.shutdown.clone(),
                lifecycle.main.take(),
                lifecycle.lock.take(),
            )
        };
        info!("orchestrator stopping");
        let timeout = self.stop_timeout();

        shutdown.trigger();
        if let Some(main) = main {
            main.join_timeout(timeout);
        }
        if !self.slots.wait_idle(timeout) {
            warn!(
                in_flight = self.slots.in_use(),
                "test executions still running at stop"
            );
        }
        self.stop_components(timeout);
        if let Err(e) = self.persistence.save_stats(&self.tracker.stats_snapshot()) {
            warn!(error = %e, "stats snapshot not saved");
        }
        self.plans.lock().clear();
        drop(lock);

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = LifecycleState::Stopped;
            lifecycle.started_at_ms = None;
        }
        info!("orchestrator stopped");
        true
    }

    fn stop_components(&self, timeout: Duration) {
        self.persistence.stop(timeout);
        self.errors.stop(timeout);
        self.timeouts.stop(timeout);
        self.resources.stop(timeout);
        self.tracker.stop(timeout);
    }

    // -- main loop ----------------------------------------------------------

    /// One guarded loop iteration. Returns whether a plan was processed.
    fn run_iteration_guarded(self: &Arc<Self>, shutdown: &Shutdown) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_iteration(shutdown))) {
            Ok(busy) => busy,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                self.counters.lock().loop_errors += 1;
                error!(error = %message, "main loop iteration failed");
                self.errors.report_error(ErrorReport::new(
                    ErrorCategory::SystemError,
                    ErrorSeverity::High,
                    COMPONENT,
                    format!("main loop iteration failed: {}", message),
                ));
                false
            }
        }
    }

    fn run_iteration(self: &Arc<Self>, shutdown: &Shutdown) -> bool {
        self.queue.poll_for_new_plans();
        let Some(plan) = self.queue.get_next_execution_plan() else {
            return false;
        };
        self.process_plan(plan, shutdown);
        true
    }

    fn process_plan(self: &Arc<Self>, mut plan: ExecutionPlan, shutdown: &Shutdown) {
        let plan_id = plan.plan_id.clone();
        plan.status = PlanStatus::Running;
        plan.started_at_ms.get_or_insert_with(now_ms);
        self.tracker
            .update_plan_status(&plan_id, PlanStatus::Running, Some(&plan.submission_id));
        self.tracker.update_plan_progress(
            &plan_id,
            plan.total_tests,
            plan.completed_tests,
            plan.failed_tests,
        );
        self.persistence.persist_plan_state(&plan);
        for test_id in &plan.test_case_ids {
            let already_final = self
                .tracker
                .get_test_status(test_id)
                .map(|t| t.status.is_terminal() && t.plan_id.as_deref() == Some(plan_id.as_str()))
                .unwrap_or(false);
            if !already_final {
                self.tracker.update_test_status(
                    test_id,
                    TestStatus::Queued,
                    TestUpdate::new().plan(plan_id.clone()),
                );
            }
        }
        self.counters.lock().plans_started += 1;
        info!(
            plan_id = %plan_id,
            priority = plan.priority,
            tests = plan.test_case_ids.len(),
            "plan started"
        );

        let run = Arc::new(PlanRun::new(plan.clone()));
        self.plans.lock().insert(plan_id.clone(), run.clone());
        if plan.test_case_ids.is_empty() {
            let snapshot = run.progress.lock().plan.clone();
            self.finalize_plan(snapshot);
            return;
        }

        let timeout = Duration::from_secs(self.config.default_test_timeout_secs);
        for test_id in &plan.test_case_ids {
            if shutdown.is_triggered() {
                info!(plan_id = %plan_id, "shutdown requested; undispatched tests left for recovery");
                return;
            }
            // Moved to a terminal state while waiting, e.g. by exhausted recovery.
            if let Some(record) = self.tracker.get_test_status(test_id) {
                if record.status.is_terminal() {
                    self.complete_test(&plan_id, test_id, record.status, None);
                    continue;
                }
            }
            let Some(slot) = self.slots.acquire(shutdown) else {
                return;
            };
            let Some(env_id) = self.allocate_with_wait(&plan, test_id, shutdown) else {
                drop(slot);
                if shutdown.is_triggered() {
                    return;
                }
                self.fail_unallocated(&plan_id, test_id);
                continue;
            };

            self.counters.lock().tests_dispatched += 1;
            let request = TestRequest {
                test_id: test_id.clone(),
                plan_id: plan_id.clone(),
                environment_id: env_id.clone(),
                timeout,
            };
            let service = Arc::clone(self);
            let spawned = Worker::spawn(&format!("test-{}", test_id), move || {
                let _slot = slot;
                service.execute_test(request);
            });
            if let Err(e) = spawned {
                error!(test_id = %test_id, error = %e, "could not spawn test thread");
                self.errors.report_error(
                    ErrorReport::new(
                        ErrorCategory::SystemError,
                        ErrorSeverity::High,
                        COMPONENT,
                        format!("could not spawn test thread: {}", e),
                    )
                    .test(test_id),
                );
                self.tracker.update_test_status(
                    test_id,
                    TestStatus::Error,
                    TestUpdate::new().message("could not spawn test thread"),
                );
                self.complete_test(&plan_id, test_id, TestStatus::Error, Some(env_id));
            }
        }
    }

    /// Allocate an environment, backing off `poll_interval` between tries,
    /// until `allocation_timeout_secs` passes or shutdown is requested.
    fn allocate_with_wait(
        &self,
        plan: &ExecutionPlan,
        test_id: &str,
        shutdown: &Shutdown,
    ) -> Option<String> {
        let deadline = Instant::now() + Duration::from_secs(self.config.allocation_timeout_secs);
        let backoff = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            if let Some(env_id) = self
                .resources
                .allocate_environment(&plan.hardware_requirements, test_id)
            {
                return Some(env_id);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            debug!(test_id, "no environment available; waiting");
            if shutdown.wait(backoff.min(deadline - now)) {
                return None;
            }
        }
    }

    fn fail_unallocated(&self, plan_id: &str, test_id: &str) {
        self.counters.lock().allocation_failures += 1;
        warn!(plan_id, test_id, "no matching environment became available");
        self.errors.report_error(
            ErrorReport::new(
                ErrorCategory::ResourceExhaustion,
                ErrorSeverity::Medium,
                COMPONENT,
                format!("no environment available for test {}", test_id),
            )
            .test(test_id)
            .detail("plan_id", plan_id),
        );
        self.tracker.update_test_status(
            test_id,
            TestStatus::Error,
            TestUpdate::new()
                .plan(plan_id)
                .message("no environment available"),
        );
        self.complete_test(plan_id, test_id, TestStatus::Error, None);
    }

    // -- test execution -----------------------------------------------------

    fn execute_test(&self, request: TestRequest) {
        let TestRequest {
            test_id,
            plan_id,
            environment_id,
            timeout,
        } = &request;
        let now = now_ms();
        self.tracker.update_test_status(
            test_id,
            TestStatus::Running,
            TestUpdate::new()
                .plan(plan_id.clone())
                .environment(environment_id.clone())
                .message("running"),
        );
        let retry_count = self
            .persistence
            .get_persisted_test(test_id)
            .map(|t| t.retry_count)
            .unwrap_or(0);
        let mut persisted = PersistedTestState::new(test_id, Some(plan_id.as_str()), TestStatus::Running, now);
        persisted.environment_id = Some(environment_id.clone());
        persisted.started_at_ms = Some(now);
        persisted.retry_count = retry_count;
        persisted.timeout_secs = Some(timeout.as_secs());
        self.persistence.persist_test_state(persisted);
        self.timeouts
            .add_monitor(test_id, *timeout, self.on_timeout.clone());

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.runner.run(&request)));
        self.timeouts.remove_monitor(test_id);

        let (status, update) = match outcome {
            Ok(Ok(result)) if result.status.is_terminal() => {
                let message = match &result.failure {
                    Some(reason) => reason.clone(),
                    None => format!("finished in {} ms", result.execution_time_ms),
                };
                (result.status, TestUpdate::new().progress(1.0).message(message))
            }
            Ok(Ok(result)) => (
                TestStatus::Error,
                TestUpdate::new().message(format!("runner returned non-terminal status {}", result.status)),
            ),
            Ok(Err(e)) => {
                self.errors.report_error(
                    ErrorReport::new(
                        ErrorCategory::SystemError,
                        ErrorSeverity::Medium,
                        COMPONENT,
                        format!("test runner failed: {}", e),
                    )
                    .test(test_id)
                    .detail("environment_id", environment_id),
                );
                (TestStatus::Error, TestUpdate::new().message(e.to_string()))
            }
            Err(payload) => {
                let message = format!("test runner panicked: {}", panic_message(payload.as_ref()));
                error!(test_id = %test_id, "{}", message);
                (TestStatus::Error, TestUpdate::new().message(message))
            }
        };

        if self.tracker.finish_test(test_id, status, update) {
            self.complete_test(plan_id, test_id, status, Some(environment_id.clone()));
        } else {
            debug!(test_id = %test_id, status = %status, "result discarded; test already finished");
        }
    }

    /// Timeout callback. Acts only on expired tests that are still running;
    /// warnings are left to the timeout manager's own logging.
    fn handle_timeout(&self, event: &TimeoutEvent) {
        if let TimeoutReason::Warning { .. } = event.reason {
            return;
        }
        let Some(record) = self.tracker.get_test_status(&event.test_id) else {
            return;
        };
        if record.status != TestStatus::Running {
            debug!(test_id = %event.test_id, status = %record.status, "timeout for test not running; ignored");
            return;
        }
        let message = format!(
            "{} after {} ms (limit {} ms)",
            event.reason, event.elapsed_ms, event.timeout_ms
        );
        if !self
            .tracker
            .finish_test(&event.test_id, TestStatus::Timeout, TestUpdate::new().message(message.clone()))
        {
            return;
        }
        self.errors.report_error(
            ErrorReport::new(
                ErrorCategory::Timeout,
                ErrorSeverity::Medium,
                COMPONENT,
                format!("test {} timed out: {}", event.test_id, message),
            )
            .test(&event.test_id),
        );
        let Some(plan_id) = record.plan_id else {
            if let Some(env_id) = record.environment_id {
                self.release(&env_id);
            }
            return;
        };
        self.complete_test(&plan_id, &event.test_id, TestStatus::Timeout, record.environment_id);
    }

    /// Exhaustion handler: the attributed test goes to `error` unless it
    /// already finished.
    fn handle_exhausted(&self, event: &ErrorEvent) {
        let Some(test_id) = &event.test_id else {
            return;
        };
        let Some(record) = self.tracker.get_test_status(test_id) else {
            return;
        };
        let message = format!("recovery exhausted: {}", event.message);
        match record.status {
            TestStatus::Running => {
                if self
                    .tracker
                    .finish_test(test_id, TestStatus::Error, TestUpdate::new().message(message))
                {
                    match record.plan_id {
                        Some(plan_id) => self.complete_test(
                            &plan_id,
                            test_id,
                            TestStatus::Error,
                            record.environment_id,
                        ),
                        None => {
                            if let Some(env_id) = record.environment_id {
                                self.release(&env_id);
                            }
                        }
                    }
                }
            }
            // Picked up as already-final by the dispatch loop.
            TestStatus::Queued => {
                self.tracker
                    .update_test_status(test_id, TestStatus::Error, TestUpdate::new().message(message));
            }
            _ => {}
        }
    }

    fn release(&self, env_id: &str) {
        if let Err(e) = self.resources.release_environment(env_id) {
            warn!(env_id, error = %e, "environment release failed");
        }
    }

    /// Release the environment, record the outcome and finish the plan if
    /// this was its last test.
    fn complete_test(&self, plan_id: &str, test_id: &str, status: TestStatus, env_id: Option<String>) {
        if let Some(env_id) = env_id {
            self.release(&env_id);
        }
        self.persistence.record_test_outcome(plan_id, test_id, status);
        let run = self.plans.lock().get(plan_id).cloned();
        let Some(run) = run else {
            return;
        };
        let (plan, last) = run.record(status);
        self.tracker.update_plan_progress(
            plan_id,
            plan.total_tests,
            plan.completed_tests,
            plan.failed_tests,
        );
        if last {
            self.finalize_plan(plan);
        }
    }

    fn finalize_plan(&self, mut plan: ExecutionPlan) {
        let status = plan.final_status();
        plan.status = status;
        plan.completed_at_ms = Some(now_ms());
        self.tracker.update_plan_progress(
            &plan.plan_id,
            plan.total_tests,
            plan.completed_tests,
            plan.failed_tests,
        );
        self.tracker
            .update_plan_status(&plan.plan_id, status, Some(&plan.submission_id));
        self.persistence.remove_persisted_plan(&plan.plan_id);
        self.plans.lock().remove(&plan.plan_id);
        self.counters.lock().plans_finished += 1;
        info!(
            plan_id = %plan.plan_id,
            status = %status,
            completed = plan.completed_tests,
            failed = plan.failed_tests,
            "plan finished"
        );
    }

    // -- reporting ----------------------------------------------------------

    /// Service status plus every component's own health report. Degraded
    /// mode is re-evaluated so an expired window clears it.
    pub fn get_health_status(&self) -> ServiceHealth {
        let (lifecycle, started_at) = {
            let lifecycle = self.lifecycle.lock();
            (lifecycle.state, lifecycle.started_at_ms)
        };
        let degraded_mode = self.errors.check_degraded_mode();
        let mut components = BTreeMap::new();
        components.insert("status_tracker".to_string(), self.tracker.health());
        components.insert("queue_monitor".to_string(), self.queue.health());
        components.insert("resource_manager".to_string(), self.resources.health());
        components.insert("timeout_manager".to_string(), self.timeouts.health());
        components.insert("error_recovery".to_string(), self.errors.health());
        components.insert("service_recovery".to_string(), self.persistence.health());
        ServiceHealth {
            status: ServiceHealth::overall(lifecycle, degraded_mode, &components),
            lifecycle,
            degraded_mode,
            uptime_ms: started_at
                .map(|s| now_ms().saturating_sub(s))
                .unwrap_or(0),
            active_tests: self.tracker.get_active_test_count(),
            queued_tests: self.tracker.get_queued_test_count(),
            available_environments: self.resources.available_count(),
            components,
        }
    }

    pub fn get_system_metrics(&self) -> SystemMetrics {
        let status = self.tracker.get_system_metrics();
        let queue = self.queue.get_queue_status();
        let resources = self.resources.get_resource_utilization();
        SystemMetrics {
            timestamp_ms: now_ms(),
            active_tests: status.active_tests,
            queued_tests: status.queued_tests,
            queued_plans: queue.queued_plans,
            available_environments: resources.available_environments,
            degraded_mode: self.errors.is_degraded(),
            unresolved_errors: self.errors.unresolved_count(),
            service: *self.counters.lock(),
            status,
            queue,
            resources,
            timeouts: TimeoutMetrics {
                active_monitors: self.timeouts.active_monitor_count(),
                timeouts_fired: self.timeouts.timeouts_fired(),
            },
        }
    }
}

fn main_loop(service: Weak<OrchestratorService>, shutdown: Shutdown, poll: Duration) {
    debug!("main loop started");
    while !shutdown.is_triggered() {
        let Some(svc) = service.upgrade() else {
            break;
        };
        let busy = svc.run_iteration_guarded(&shutdown);
        drop(svc);
        if !busy && shutdown.wait(poll) {
            break;
        }
    }
    debug!("main loop stopped");
}

impl fmt::Debug for OrchestratorService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorService")
            .field("state", &self.lifecycle_state())
            .field("state_dir", &self.config.state_dir)
            .field("max_concurrent_tests", &self.slots.capacity())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
