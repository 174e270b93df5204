use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Error,
}

impl TestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TestStatus::Completed | TestStatus::Failed | TestStatus::Timeout | TestStatus::Error
        )
    }

    /// Terminal outcomes that count against a plan.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            TestStatus::Failed | TestStatus::Timeout | TestStatus::Error
        )
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Queued => "queued",
            TestStatus::Running => "running",
            TestStatus::Completed => "completed",
            TestStatus::Failed => "failed",
            TestStatus::Timeout => "timeout",
            TestStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Live status record for one test, owned by the status tracker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestExecutionStatus {
    pub test_id: String,
    pub plan_id: Option<String>,
    pub status: TestStatus,
    pub environment_id: Option<String>,
    /// Fraction complete in [0.0, 1.0].
    pub progress: f64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub execution_time_ms: Option<u64>,
    pub message: Option<String>,
    pub updated_at_ms: u64,
}

impl TestExecutionStatus {
    pub fn new(test_id: &str, status: TestStatus, now_ms: u64) -> Self {
        TestExecutionStatus {
            test_id: test_id.to_string(),
            plan_id: None,
            status,
            environment_id: None,
            progress: 0.0,
            started_at_ms: None,
            completed_at_ms: None,
            execution_time_ms: None,
            message: None,
            updated_at_ms: now_ms,
        }
    }
}

/// Optional fields carried by a status update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestUpdate {
    pub message: Option<String>,
    pub progress: Option<f64>,
    pub environment_id: Option<String>,
    pub plan_id: Option<String>,
}

impl TestUpdate {
    pub fn new() -> Self {
        TestUpdate::default()
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn environment(mut self, env_id: impl Into<String>) -> Self {
        self.environment_id = Some(env_id.into());
        self
    }

    pub fn plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TestStatus::Queued.is_terminal());
        assert!(!TestStatus::Running.is_terminal());
        for s in [
            TestStatus::Completed,
            TestStatus::Failed,
            TestStatus::Timeout,
            TestStatus::Error,
        ] {
            assert!(s.is_terminal(), "{} should be terminal", s);
        }
        assert!(!TestStatus::Completed.is_failure());
        assert!(TestStatus::Timeout.is_failure());
    }

    #[test]
    fn status_serde_matches_display() {
        for s in [TestStatus::Queued, TestStatus::Timeout, TestStatus::Error] {
            let json = serde_json::to_string(&s).unwrap();
            assert_eq!(json, format!("\"{}\"", s));
        }
    }

    #[test]
    fn update_builder() {
        let u = TestUpdate::new().message("booting").progress(0.25).environment("docker-1");
        assert_eq!(u.message.as_deref(), Some("booting"));
        assert_eq!(u.progress, Some(0.25));
        assert_eq!(u.environment_id.as_deref(), Some("docker-1"));
        assert!(u.plan_id.is_none());
    }
}
