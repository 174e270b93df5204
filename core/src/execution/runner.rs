//! Test runner seam. Executes one test case in an allocated environment.
//!
//! The orchestrator calls `run` from a per-test thread and treats it as a
//! single blocking call. Timeouts are enforced by the timeout manager, not
//! by the runner; a runner that overruns simply has its result discarded.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::infrastructure::runner::render_template;
use crate::infrastructure::{CommandRunner, ShellRunner};
use crate::types::config::RunnerConfig;
use crate::types::TestStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRequest {
    pub test_id: String,
    pub plan_id: String,
    pub environment_id: String,
    pub timeout: Duration,
}

/// What a runner reports back for one test.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestResult {
    pub status: TestStatus,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub coverage: Option<f64>,
    #[serde(default)]
    pub failure: Option<String>,
}

impl TestResult {
    pub fn passed(execution_time_ms: u64) -> Self {
        TestResult {
            status: TestStatus::Completed,
            execution_time_ms,
            artifacts: Vec::new(),
            coverage: None,
            failure: None,
        }
    }

    pub fn failed(execution_time_ms: u64, reason: impl Into<String>) -> Self {
        TestResult {
            status: TestStatus::Failed,
            execution_time_ms,
            artifacts: Vec::new(),
            coverage: None,
            failure: Some(reason.into()),
        }
    }
}

/// Executes a test case. `Err` means the runner itself broke (the test is
/// moved to `error`); a failing test is `Ok` with a failed status.
pub trait TestRunner: Send + Sync {
    fn run(&self, request: &TestRequest) -> Result<TestResult>;
}

/// Build the runner described by the config: a command runner when a
/// command template is set, otherwise the simulated runner.
pub fn runner_from_config(config: &RunnerConfig) -> Arc<dyn TestRunner> {
    match &config.command {
        Some(template) => Arc::new(CommandTestRunner::new(
            template,
            Arc::new(ShellRunner::new()),
        )),
        None => Arc::new(SimulatedTestRunner::new(Duration::from_millis(
            config.simulated_duration_ms,
        ))),
    }
}

// ---------------------------------------------------------------------------
// SimulatedTestRunner
// ---------------------------------------------------------------------------

/// Scripted behavior for one test id.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    Pass,
    Fail(String),
    /// The runner returns `Err`.
    Crash(String),
    /// Run for `duration` and then pass.
    Slow(Duration),
}

/// Sleeps for a fixed duration and passes, unless a test is scripted.
pub struct SimulatedTestRunner {
    duration: Duration,
    script: Mutex<HashMap<String, ScriptedOutcome>>,
    executions: Mutex<Vec<TestRequest>>,
}

impl SimulatedTestRunner {
    pub fn new(duration: Duration) -> Self {
        SimulatedTestRunner {
            duration,
            script: Mutex::new(HashMap::new()),
            executions: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, test_id: &str, outcome: ScriptedOutcome) {
        self.script.lock().insert(test_id.to_string(), outcome);
    }

    /// Every request seen so far, in call order.
    pub fn executions(&self) -> Vec<TestRequest> {
        self.executions.lock().clone()
    }

    pub fn executed_test_ids(&self) -> Vec<String> {
        self.executions
            .lock()
            .iter()
            .map(|r| r.test_id.clone())
            .collect()
    }
}

impl TestRunner for SimulatedTestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestResult> {
        self.executions.lock().push(request.clone());
        let outcome = self
            .script
            .lock()
            .get(&request.test_id)
            .cloned()
            .unwrap_or(ScriptedOutcome::Pass);
        let started = Instant::now();
        let sleep = match &outcome {
            ScriptedOutcome::Slow(d) => *d,
            _ => self.duration,
        };
        std::thread::sleep(sleep);
        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            ScriptedOutcome::Pass | ScriptedOutcome::Slow(_) => Ok(TestResult::passed(elapsed)),
            ScriptedOutcome::Fail(reason) => Ok(TestResult::failed(elapsed, reason)),
            ScriptedOutcome::Crash(reason) => Err(OrchestratorError::Execution(reason)),
        }
    }
}

impl fmt::Debug for SimulatedTestRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimulatedTestRunner")
            .field("duration", &self.duration)
            .field("executions", &self.executions.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CommandTestRunner
// ---------------------------------------------------------------------------

/// Runs a shell template per test. Exit status 0 is `completed`, any other
/// exit is `failed` with the runner's error text as the failure reason.
pub struct CommandTestRunner {
    template: String,
    runner: Arc<dyn CommandRunner>,
}

impl CommandTestRunner {
    pub fn new(template: &str, runner: Arc<dyn CommandRunner>) -> Self {
        CommandTestRunner {
            template: template.to_string(),
            runner,
        }
    }

    fn command_for(&self, request: &TestRequest) -> String {
        render_template(
            &self.template,
            &[
                ("test_id", request.test_id.clone()),
                ("environment_id", request.environment_id.clone()),
                ("timeout_secs", request.timeout.as_secs().to_string()),
            ],
        )
    }
}

impl TestRunner for CommandTestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestResult> {
        let cmd = self.command_for(request);
        debug!(test_id = %request.test_id, cmd = %cmd, "running test command");
        let started = Instant::now();
        let outcome = self.runner.run(&cmd);
        let elapsed = started.elapsed().as_millis() as u64;
        Ok(match outcome {
            Ok(_) => TestResult::passed(elapsed),
            Err(reason) => TestResult::failed(elapsed, reason),
        })
    }
}

impl fmt::Debug for CommandTestRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTestRunner")
            .field("template", &self.template)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::MockRunner;

    fn request(test_id: &str) -> TestRequest {
        TestRequest {
            test_id: test_id.into(),
            plan_id: "p1".into(),
            environment_id: "docker-01".into(),
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn simulated_runner_follows_script() {
        let runner = SimulatedTestRunner::new(Duration::from_millis(1));
        runner.script("bad", ScriptedOutcome::Fail("assertion".into()));
        runner.script("boom", ScriptedOutcome::Crash("runner died".into()));

        assert_eq!(runner.run(&request("ok")).unwrap().status, TestStatus::Completed);
        let failed = runner.run(&request("bad")).unwrap();
        assert_eq!(failed.status, TestStatus::Failed);
        assert_eq!(failed.failure.as_deref(), Some("assertion"));
        assert!(matches!(
            runner.run(&request("boom")),
            Err(OrchestratorError::Execution(_))
        ));
        assert_eq!(runner.executed_test_ids(), vec!["ok", "bad", "boom"]);
    }

    #[test]
    fn slow_outcome_takes_its_duration() {
        let runner = SimulatedTestRunner::new(Duration::from_millis(1));
        runner.script("slow", ScriptedOutcome::Slow(Duration::from_millis(50)));
        let result = runner.run(&request("slow")).unwrap();
        assert!(result.execution_time_ms >= 50);
        assert_eq!(result.status, TestStatus::Completed);
    }

    #[test]
    fn command_runner_renders_template_and_maps_exit() {
        let mock = Arc::new(MockRunner::new());
        mock.respond("flaky", Err("exit status 1".into()));
        let runner = CommandTestRunner::new(
            "run-test {test_id} --env {environment_id} --timeout {timeout_secs}",
            mock.clone(),
        );

        assert_eq!(runner.run(&request("t1")).unwrap().status, TestStatus::Completed);
        let failed = runner.run(&request("flaky")).unwrap();
        assert_eq!(failed.status, TestStatus::Failed);
        assert_eq!(failed.failure.as_deref(), Some("exit status 1"));
        assert_eq!(
            mock.executed_commands()[0],
            "run-test t1 --env docker-01 --timeout 30"
        );
    }

    #[test]
    fn config_selects_runner() {
        let runner = runner_from_config(&RunnerConfig::default());
        assert_eq!(runner.run(&request("t1")).unwrap().status, TestStatus::Completed);
    }
}
