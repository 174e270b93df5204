//! Error recovery manager — the error-event log, automated recovery and
//! degraded-mode detection.
//!
//! Any component can report an error; reporting never fails. A background
//! loop runs the registered recovery actions against unresolved errors.
//! Degraded mode is edge-triggered: it is entered once when the unresolved
//! errors inside the rolling window cross a threshold, and left once when
//! they fall back below it.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::actions::RecoveryAction;
use super::retry::AttemptTracker;
use crate::clock::{hours_to_ms, now_ms};
use crate::error::{OrchestratorError, Result};
use crate::types::config::ErrorRecoveryConfig;
use crate::types::{
    ComponentHealth, ErrorCategory, ErrorEvent, ErrorReport, ErrorSeverity, ServiceState,
};
use crate::worker::{Worker, WorkerSet};

/// Called once for an error whose recovery budget is used up.
pub type ExhaustionHandler = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorSummary {
    pub window_hours: u64,
    pub total_errors: usize,
    pub resolved_errors: usize,
    pub unresolved_errors: usize,
    pub by_category: BTreeMap<ErrorCategory, usize>,
    pub by_severity: BTreeMap<ErrorSeverity, usize>,
    pub by_component: BTreeMap<String, usize>,
    pub degraded_mode: bool,
    pub degraded_reasons: Vec<String>,
    /// Most recent errors in the window, newest first.
    pub recent: Vec<ErrorEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorLogExport {
    exported_at_ms: u64,
    window_hours: u64,
    summary: ErrorSummary,
    errors: Vec<ErrorEvent>,
}

/// Outcome of one pass of the recovery loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryCycle {
    pub attempted: usize,
    pub resolved: usize,
    pub failed: usize,
    pub exhausted: usize,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ErrorState {
    events: Vec<ErrorEvent>,
    index: HashMap<String, usize>,
    actions: Vec<RecoveryAction>,
    attempts: AttemptTracker,
    category_totals: BTreeMap<ErrorCategory, u64>,
    severity_totals: BTreeMap<ErrorSeverity, u64>,
    degraded: bool,
    degraded_reasons: Vec<String>,
    degraded_since_ms: Option<u64>,
    degraded_transitions: u64,
}

impl ErrorState {
    fn get_mut(&mut self, id: &str) -> Option<&mut ErrorEvent> {
        let idx = *self.index.get(id)?;
        self.events.get_mut(idx)
    }

    fn reindex(&mut self) {
        self.index = self
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id.clone(), i))
            .collect();
    }
}

/// A degraded-mode transition produced by an evaluation.
enum Transition {
    Entered(Vec<String>),
    Exited,
}

pub struct ErrorRecoveryManager {
    config: ErrorRecoveryConfig,
    state: Mutex<ErrorState>,
    exhaustion: Mutex<Option<ExhaustionHandler>>,
    workers: Mutex<Option<WorkerSet>>,
}

impl ErrorRecoveryManager {
    pub fn new(config: ErrorRecoveryConfig) -> Self {
        ErrorRecoveryManager {
            config,
            state: Mutex::new(ErrorState::default()),
            exhaustion: Mutex::new(None),
            workers: Mutex::new(None),
        }
    }

    // -- reporting ----------------------------------------------------------

    /// Record an error and return its id.
    pub fn report_error(&self, report: ErrorReport) -> String {
        self.report_error_at(report, now_ms())
    }

    pub fn report_error_at(&self, report: ErrorReport, now: u64) -> String {
        let id = format!("err-{}", Uuid::new_v4().simple());
        let event = ErrorEvent {
            id: id.clone(),
            timestamp_ms: now,
            category: report.category,
            severity: report.severity,
            component: report.component,
            message: report.message,
            details: report.details,
            environment_id: report.environment_id,
            test_id: report.test_id,
            retry_count: 0,
            resolved: false,
            resolved_at_ms: None,
            resolution: None,
            recovery_exhausted: false,
        };
        log_event(&event);

        let transition = {
            let mut state = self.state.lock();
            *state.category_totals.entry(event.category).or_insert(0) += 1;
            *state.severity_totals.entry(event.severity).or_insert(0) += 1;
            let pos = state.events.len();
            state.index.insert(id.clone(), pos);
            state.events.push(event);
            self.evaluate_degraded(&mut state, now)
        };
        log_transition(transition);
        id
    }

    /// Mark an error resolved. Resolving twice is a no-op; returns `false`
    /// only for an unknown id.
    pub fn resolve_error(&self, error_id: &str, resolution: Option<&str>) -> bool {
        let now = now_ms();
        let transition = {
            let mut state = self.state.lock();
            let Some(event) = state.get_mut(error_id) else {
                return false;
            };
            if event.resolved {
                return true;
            }
            event.resolved = true;
            event.resolved_at_ms = Some(now);
            event.resolution = resolution.map(str::to_string);
            state.attempts.forget(error_id);
            self.evaluate_degraded(&mut state, now)
        };
        info!(error_id, resolution = resolution.unwrap_or(""), "error resolved");
        log_transition(transition);
        true
    }

    pub fn get_error(&self, error_id: &str) -> Option<ErrorEvent> {
        let state = self.state.lock();
        state
            .index
            .get(error_id)
            .and_then(|i| state.events.get(*i))
            .cloned()
    }

    pub fn unresolved_count(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| !e.resolved)
            .count()
    }

    // -- recovery actions ---------------------------------------------------

    pub fn register_recovery_action(&self, action: RecoveryAction) -> Result<()> {
        let mut state = self.state.lock();
        if state.actions.iter().any(|a| a.name == action.name) {
            return Err(OrchestratorError::DuplicateAction(action.name));
        }
        debug!(action = %action.name, "recovery action registered");
        state.actions.push(action);
        Ok(())
    }

    pub fn action_names(&self) -> Vec<String> {
        self.state
            .lock()
            .actions
            .iter()
            .map(|a| a.name.clone())
            .collect()
    }

    pub fn set_exhaustion_handler(&self, handler: ExhaustionHandler) {
        *self.exhaustion.lock() = Some(handler);
    }

    pub fn run_recovery_cycle(&self) -> RecoveryCycle {
        self.run_recovery_cycle_at(now_ms())
    }

    /// Try the applicable actions on every unresolved error.
    ///
    /// For each error, actions run in registration order; the first success
    /// resolves the error. A failed attempt increments the error's
    /// `retry_count` and defers that action by its retry delay. Handlers run
    /// without the manager lock held.
    pub fn run_recovery_cycle_at(&self, now: u64) -> RecoveryCycle {
        let (pending, actions) = {
            let state = self.state.lock();
            let pending: Vec<ErrorEvent> = state
                .events
                .iter()
                .filter(|e| !e.resolved && !e.recovery_exhausted)
                .cloned()
                .collect();
            (pending, state.actions.clone())
        };

        let mut cycle = RecoveryCycle::default();
        let mut exhausted_events = Vec::new();
        for event in pending {
            let applicable: Vec<&RecoveryAction> =
                actions.iter().filter(|a| a.applies_to(&event)).collect();
            if applicable.is_empty() {
                continue;
            }

            let mut resolved_by = None;
            for action in &applicable {
                let ready = self
                    .state
                    .lock()
                    .attempts
                    .is_ready(&event.id, &action.name, &action.retry, now);
                if !ready {
                    continue;
                }
                cycle.attempted += 1;
                let outcome = catch_unwind(AssertUnwindSafe(|| (action.handler)(&event)))
                    .unwrap_or_else(|_| {
                        Err(OrchestratorError::Execution(format!(
                            "recovery action '{}' panicked",
                            action.name
                        )))
                    });
                match outcome {
                    Ok(()) => {
                        resolved_by = Some(action.name.clone());
                        break;
                    }
                    Err(e) => {
                        cycle.failed += 1;
                        let mut state = self.state.lock();
                        let failures =
                            state
                                .attempts
                                .record_failure(&event.id, &action.name, &action.retry, now);
                        if let Some(ev) = state.get_mut(&event.id) {
                            ev.retry_count += 1;
                        }
                        drop(state);
                        warn!(
                            error_id = %event.id,
                            action = %action.name,
                            attempt = failures,
                            max_retries = action.retry.max_retries,
                            error = %e,
                            "recovery attempt failed"
                        );
                    }
                }
            }

            if let Some(name) = resolved_by {
                cycle.resolved += 1;
                self.resolve_error(&event.id, Some(&format!("recovered by {}", name)));
                continue;
            }

            // Out of budget on every applicable action: terminal.
            let mut state = self.state.lock();
            let exhausted = applicable
                .iter()
                .all(|a| !state.attempts.has_budget(&event.id, &a.name, &a.retry));
            if exhausted {
                if let Some(ev) = state.get_mut(&event.id) {
                    if !ev.recovery_exhausted {
                        ev.recovery_exhausted = true;
                        exhausted_events.push(ev.clone());
                    }
                }
            }
        }

        let handler = self.exhaustion.lock().clone();
        for event in exhausted_events {
            cycle.exhausted += 1;
            error!(
                error_id = %event.id,
                category = %event.category,
                retries = event.retry_count,
                "recovery exhausted"
            );
            if let Some(handler) = &handler {
                if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                    error!(error_id = %event.id, "exhaustion handler panicked");
                }
            }
        }

        let transition = {
            let mut state = self.state.lock();
            self.evaluate_degraded(&mut state, now)
        };
        log_transition(transition);
        cycle
    }

    // -- degraded mode ------------------------------------------------------

    fn degraded_reasons(&self, state: &ErrorState, now: u64) -> Vec<String> {
        let window_start = now.saturating_sub(self.config.degraded_window_ms);
        let mut critical = 0usize;
        let mut per_category: BTreeMap<ErrorCategory, usize> = BTreeMap::new();
        for e in state
            .events
            .iter()
            .filter(|e| !e.resolved && e.timestamp_ms >= window_start)
        {
            if e.severity == ErrorSeverity::Critical {
                critical += 1;
            }
            *per_category.entry(e.category).or_insert(0) += 1;
        }

        let mut reasons = Vec::new();
        if self.config.critical_threshold > 0 && critical >= self.config.critical_threshold {
            reasons.push(format!("unresolved critical errors: {}", critical));
        }
        for (category, threshold) in &self.config.category_thresholds {
            let count = per_category.get(category).copied().unwrap_or(0);
            if *threshold > 0 && count >= *threshold {
                reasons.push(format!("unresolved {} errors: {}", category, count));
            }
        }
        reasons
    }

    fn evaluate_degraded(&self, state: &mut ErrorState, now: u64) -> Option<Transition> {
        let reasons = self.degraded_reasons(state, now);
        let should_degrade = !reasons.is_empty();
        state.degraded_reasons = reasons.clone();
        match (state.degraded, should_degrade) {
            (false, true) => {
                state.degraded = true;
                state.degraded_since_ms = Some(now);
                state.degraded_transitions += 1;
                Some(Transition::Entered(reasons))
            }
            (true, false) => {
                state.degraded = false;
                state.degraded_since_ms = None;
                Some(Transition::Exited)
            }
            _ => None,
        }
    }

    /// Re-evaluate degraded mode at `now` and return whether it is active.
    pub fn check_degraded_mode_at(&self, now: u64) -> bool {
        let (degraded, transition) = {
            let mut state = self.state.lock();
            let t = self.evaluate_degraded(&mut state, now);
            (state.degraded, t)
        };
        log_transition(transition);
        degraded
    }

    pub fn check_degraded_mode(&self) -> bool {
        self.check_degraded_mode_at(now_ms())
    }

    /// Current flag, without re-evaluating.
    pub fn is_degraded(&self) -> bool {
        self.state.lock().degraded
    }

    /// How many times degraded mode has been entered.
    pub fn degraded_transitions(&self) -> u64 {
        self.state.lock().degraded_transitions
    }

    // -- reporting ----------------------------------------------------------

    pub fn get_error_summary(&self, hours: u64) -> ErrorSummary {
        self.summary_at(hours, now_ms()).0
    }

    fn summary_at(&self, hours: u64, now: u64) -> (ErrorSummary, Vec<ErrorEvent>) {
        let since = now.saturating_sub(hours_to_ms(hours));
        let state = self.state.lock();
        let window: Vec<ErrorEvent> = state
            .events
            .iter()
            .filter(|e| e.timestamp_ms >= since)
            .cloned()
            .collect();

        let mut summary = ErrorSummary {
            window_hours: hours,
            total_errors: window.len(),
            resolved_errors: window.iter().filter(|e| e.resolved).count(),
            unresolved_errors: window.iter().filter(|e| !e.resolved).count(),
            by_category: BTreeMap::new(),
            by_severity: BTreeMap::new(),
            by_component: BTreeMap::new(),
            degraded_mode: state.degraded,
            degraded_reasons: state.degraded_reasons.clone(),
            recent: window.iter().rev().take(10).cloned().collect(),
        };
        for e in &window {
            *summary.by_category.entry(e.category).or_insert(0) += 1;
            *summary.by_severity.entry(e.severity).or_insert(0) += 1;
            *summary.by_component.entry(e.component.clone()).or_insert(0) += 1;
        }
        (summary, window)
    }

    /// Write the errors of the last `hours` with a summary to `path` as JSON.
    /// Returns the number of errors written.
    pub fn export_error_log(&self, path: &Path, hours: u64) -> Result<usize> {
        let now = now_ms();
        let (summary, errors) = self.summary_at(hours, now);
        let count = errors.len();
        let export = ErrorLogExport {
            exported_at_ms: now,
            window_hours: hours,
            summary,
            errors,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(&export)?)?;
        info!(path = %path.display(), count, "error log exported");
        Ok(count)
    }

    /// Evict resolved errors older than `max_age_hours`.
    pub fn cleanup_old_errors(&self, max_age_hours: u64) -> usize {
        self.cleanup_old_errors_at(max_age_hours, now_ms())
    }

    pub fn cleanup_old_errors_at(&self, max_age_hours: u64, now: u64) -> usize {
        let cutoff = now.saturating_sub(hours_to_ms(max_age_hours));
        let mut state = self.state.lock();
        let before = state.events.len();
        state
            .events
            .retain(|e| !(e.resolved && e.timestamp_ms < cutoff));
        let removed = before - state.events.len();
        if removed > 0 {
            state.reindex();
            debug!(removed, "old errors evicted");
        }
        removed
    }

    // -- lifecycle ----------------------------------------------------------

    pub fn start(self: &Arc<Self>) -> std::io::Result<bool> {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return Ok(false);
        }
        let mut set = WorkerSet::new();
        let weak: Weak<ErrorRecoveryManager> = Arc::downgrade(self);
        let retention = self.config.retention_hours;
        set.push(Worker::spawn_periodic(
            "error-recovery",
            set.shutdown(),
            Duration::from_millis(self.config.recovery_interval_ms),
            move || {
                if let Some(manager) = weak.upgrade() {
                    manager.run_recovery_cycle();
                    manager.cleanup_old_errors(retention);
                }
            },
        )?);
        *workers = Some(set);
        Ok(true)
    }

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
        let degraded = self.check_degraded_mode();
        let status = if !self.is_running() {
            ServiceState::Stopped
        } else if degraded {
            ServiceState::Degraded
        } else {
            ServiceState::Healthy
        };
        let state = self.state.lock();
        ComponentHealth::new(status)
            .detail("degraded_mode", state.degraded)
            .detail("degraded_reasons", &state.degraded_reasons)
            .detail("degraded_since_ms", state.degraded_since_ms)
            .detail("degraded_transitions", state.degraded_transitions)
            .detail("total_errors", state.events.len())
            .detail(
                "unresolved_errors",
                state.events.iter().filter(|e| !e.resolved).count(),
            )
            .detail("errors_by_category", &state.category_totals)
            .detail("errors_by_severity", &state.severity_totals)
            .detail("recovery_actions", state.actions.len())
    }
}

impl std::fmt::Debug for ErrorRecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorRecoveryManager")
            .field("config", &self.config)
            .finish()
    }
}

fn log_event(event: &ErrorEvent) {
    let env = event.environment_id.as_deref().unwrap_or("-");
    let test = event.test_id.as_deref().unwrap_or("-");
    match event.severity {
        ErrorSeverity::Low => debug!(
            error_id = %event.id, category = %event.category, component = %event.component,
            environment_id = env, test_id = test, "{}", event.message
        ),
        ErrorSeverity::Medium => info!(
            error_id = %event.id, category = %event.category, component = %event.component,
            environment_id = env, test_id = test, "{}", event.message
        ),
        ErrorSeverity::High => warn!(
            error_id = %event.id, category = %event.category, component = %event.component,
            environment_id = env, test_id = test, "{}", event.message
        ),
        ErrorSeverity::Critical => error!(
            error_id = %event.id, category = %event.category, component = %event.component,
            environment_id = env, test_id = test, "{}", event.message
        ),
    }
}

fn log_transition(transition: Option<Transition>) {
    match transition {
        Some(Transition::Entered(reasons)) => {
            error!(reasons = ?reasons, "entering degraded mode");
        }
        Some(Transition::Exited) => warn!("leaving degraded mode"),
        None => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::retry::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MIN: u64 = 60_000;

    fn manager() -> ErrorRecoveryManager {
        ErrorRecoveryManager::new(ErrorRecoveryConfig::default())
    }

    fn env_failure(severity: ErrorSeverity) -> ErrorReport {
        ErrorReport::new(
            ErrorCategory::EnvironmentFailure,
            severity,
            "resource_manager",
            "environment unreachable",
        )
    }

    #[test]
    fn report_assigns_unique_ids() {
        let m = manager();
        let a = m.report_error(env_failure(ErrorSeverity::Low));
        let b = m.report_error(env_failure(ErrorSeverity::Low).environment("d1"));
        assert_ne!(a, b);
        assert!(a.starts_with("err-"));
        assert_eq!(m.get_error(&a).unwrap().id, a);
        assert_eq!(m.get_error(&b).unwrap().id, b);
        assert_eq!(m.get_error(&b).unwrap().environment_id.as_deref(), Some("d1"));
        assert_eq!(m.unresolved_count(), 2);
    }

    #[test]
    fn resolve_is_idempotent() {
        let m = manager();
        let id = m.report_error(env_failure(ErrorSeverity::Medium));
        assert!(m.resolve_error(&id, Some("manual")));
        let first = m.get_error(&id).unwrap();
        assert!(m.resolve_error(&id, Some("again")));
        let second = m.get_error(&id).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.resolution.as_deref(), Some("manual"));
        assert!(!m.resolve_error("err-missing", None));
    }

    #[test]
    fn duplicate_action_rejected() {
        let m = manager();
        let action = |name: &str| {
            RecoveryAction::new(
                name,
                &[ErrorCategory::Unknown],
                &[ErrorSeverity::Low],
                RetryPolicy::fixed(1, 0),
                |_e| Ok(()),
            )
        };
        m.register_recovery_action(action("a")).unwrap();
        let err = m.register_recovery_action(action("a")).unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateAction(_)));
        m.register_recovery_action(action("b")).unwrap();
        assert_eq!(m.action_names(), vec!["a", "b"]);
    }

    #[test]
    fn first_successful_action_resolves() {
        let m = manager();
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let c2 = calls.clone();
        m.register_recovery_action(RecoveryAction::new(
            "failing",
            &[ErrorCategory::EnvironmentFailure],
            &[ErrorSeverity::High],
            RetryPolicy::fixed(3, 1000),
            move |_e| {
                c1.fetch_add(1, Ordering::SeqCst);
                Err(OrchestratorError::Execution("nope".into()))
            },
        ))
        .unwrap();
        m.register_recovery_action(RecoveryAction::new(
            "working",
            &[ErrorCategory::EnvironmentFailure],
            &[ErrorSeverity::High],
            RetryPolicy::fixed(3, 1000),
            move |_e| {
                c2.fetch_add(100, Ordering::SeqCst);
                Ok(())
            },
        ))
        .unwrap();

        let id = m.report_error_at(env_failure(ErrorSeverity::High), 0);
        let cycle = m.run_recovery_cycle_at(10);
        assert_eq!(cycle.attempted, 2);
        assert_eq!(cycle.resolved, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 101);

        let event = m.get_error(&id).unwrap();
        assert!(event.resolved);
        assert_eq!(event.retry_count, 1);
        assert_eq!(event.resolution.as_deref(), Some("recovered by working"));

        // Resolved errors are not retried.
        assert_eq!(m.run_recovery_cycle_at(5000).attempted, 0);
    }

    #[test]
    fn budget_exhaustion_fires_handler_once() {
        let m = manager();
        m.register_recovery_action(RecoveryAction::new(
            "always_fails",
            &[ErrorCategory::Timeout],
            &[ErrorSeverity::Medium],
            RetryPolicy::fixed(2, 100),
            |_e| Err(OrchestratorError::Execution("still broken".into())),
        ))
        .unwrap();
        let exhausted = Arc::new(Mutex::new(Vec::new()));
        let sink = exhausted.clone();
        m.set_exhaustion_handler(Arc::new(move |e: &ErrorEvent| {
            sink.lock().push(e.test_id.clone())
        }));

        let id = m.report_error_at(
            ErrorReport::new(ErrorCategory::Timeout, ErrorSeverity::Medium, "c", "slow").test("t1"),
            0,
        );
        assert_eq!(m.run_recovery_cycle_at(0).failed, 1);
        // Backoff: not retried before the delay.
        assert_eq!(m.run_recovery_cycle_at(50).attempted, 0);
        let cycle = m.run_recovery_cycle_at(100);
        assert_eq!(cycle.failed, 1);
        assert_eq!(cycle.exhausted, 1);
        assert_eq!(m.run_recovery_cycle_at(10_000).exhausted, 0);

        assert_eq!(exhausted.lock().clone(), vec![Some("t1".to_string())]);
        let event = m.get_error(&id).unwrap();
        assert_eq!(event.retry_count, 2);
        assert!(event.recovery_exhausted);
        assert!(!event.resolved);
    }

    #[test]
    fn errors_without_actions_are_left_alone() {
        let m = manager();
        m.report_error_at(
            ErrorReport::new(ErrorCategory::PermissionError, ErrorSeverity::Low, "c", "denied"),
            0,
        );
        assert_eq!(m.run_recovery_cycle_at(1), RecoveryCycle::default());
    }

    #[test]
    fn degraded_mode_is_edge_triggered() {
        let m = manager();
        for i in 0..4 {
            m.report_error_at(env_failure(ErrorSeverity::High), i * MIN);
        }
        assert!(!m.is_degraded());
        m.report_error_at(env_failure(ErrorSeverity::High), 4 * MIN);
        assert!(m.is_degraded());
        m.report_error_at(env_failure(ErrorSeverity::High), 5 * MIN);
        m.report_error_at(env_failure(ErrorSeverity::High), 6 * MIN);
        assert_eq!(m.degraded_transitions(), 1);

        // The first errors age out of the 10 minute window.
        assert!(m.check_degraded_mode_at(12 * MIN));
        assert!(!m.check_degraded_mode_at(17 * MIN));
        assert_eq!(m.degraded_transitions(), 1);
    }

    #[test]
    fn single_critical_error_degrades_until_resolved() {
        let m = manager();
        let id = m.report_error_at(
            ErrorReport::new(ErrorCategory::SystemError, ErrorSeverity::Critical, "svc", "loop"),
            now_ms(),
        );
        assert!(m.is_degraded());
        m.resolve_error(&id, None);
        assert!(!m.is_degraded());
    }

    #[test]
    fn summary_and_export() {
        let m = manager();
        let id = m.report_error(env_failure(ErrorSeverity::High).environment("d1"));
        m.report_error(ErrorReport::new(
            ErrorCategory::NetworkIssue,
            ErrorSeverity::Low,
            "queue_monitor",
            "timeout",
        ));
        m.resolve_error(&id, None);

        let summary = m.get_error_summary(1);
        assert_eq!(summary.total_errors, 2);
        assert_eq!(summary.resolved_errors, 1);
        assert_eq!(summary.by_category[&ErrorCategory::NetworkIssue], 1);
        assert_eq!(summary.by_component["resource_manager"], 1);
        assert_eq!(summary.recent[0].component, "queue_monitor");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("errors.json");
        assert_eq!(m.export_error_log(&path, 1).unwrap(), 2);
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["errors"].as_array().unwrap().len(), 2);
        assert_eq!(json["summary"]["total_errors"], 2);
        // Reporting has no side effects on the log.
        assert_eq!(m.get_error_summary(1).total_errors, 2);
    }

    #[test]
    fn cleanup_evicts_only_old_resolved() {
        let m = manager();
        let old = m.report_error_at(env_failure(ErrorSeverity::Low), 0);
        let old_open = m.report_error_at(env_failure(ErrorSeverity::Low), 0);
        m.resolve_error(&old, None);
        let later = hours_to_ms(25);
        assert_eq!(m.cleanup_old_errors_at(24, later), 1);
        assert!(m.get_error(&old).is_none());
        assert!(m.get_error(&old_open).is_some());
        // Index still valid after eviction.
        assert!(m.resolve_error(&old_open, None));
    }

    #[test]
    fn health_reflects_lifecycle_and_mode() {
        let m = Arc::new(ErrorRecoveryManager::new(ErrorRecoveryConfig {
            recovery_interval_ms: 10,
            ..ErrorRecoveryConfig::default()
        }));
        assert_eq!(m.health().status, ServiceState::Stopped);
        assert!(m.start().unwrap());
        assert_eq!(m.health().status, ServiceState::Healthy);
        m.report_error(ErrorReport::new(
            ErrorCategory::SystemError,
            ErrorSeverity::Critical,
            "svc",
            "boom",
        ));
        let health = m.health();
        assert_eq!(health.status, ServiceState::Degraded);
        assert_eq!(health.get("degraded_mode"), Some(&serde_json::json!(true)));
        assert!(m.stop(Duration::from_secs(2)));
    }
}
