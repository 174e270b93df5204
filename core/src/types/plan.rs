use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::environment::HardwareRequirements;
use crate::error::{OrchestratorError, Result};

/// Highest scheduling priority (dequeued first).
pub const HIGHEST_PRIORITY: u8 = 1;
/// Lowest scheduling priority.
pub const LOWEST_PRIORITY: u8 = 10;
/// Priority applied when a submission does not name one.
pub const DEFAULT_PRIORITY: u8 = 5;

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Failed)
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStatus::Queued => write!(f, "queued"),
            PlanStatus::Running => write!(f, "running"),
            PlanStatus::Completed => write!(f, "completed"),
            PlanStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A plan as it appears in the external submission store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanSubmission {
    pub plan_id: String,
    pub submission_id: String,
    pub test_case_ids: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub hardware_requirements: HardwareRequirements,
    /// Submission time in epoch milliseconds.
    pub created_at_ms: u64,
}

/// A validated plan owned by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub submission_id: String,
    /// Tests still to run. After a crash recovery this holds only the
    /// tests that had not finished.
    pub test_case_ids: Vec<String>,
    pub priority: u8,
    pub hardware_requirements: HardwareRequirements,
    pub status: PlanStatus,
    pub total_tests: usize,
    pub completed_tests: usize,
    pub failed_tests: usize,
    pub submitted_at_ms: u64,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
}

impl ExecutionPlan {
    /// Validate a submission and build a queued plan from it.
    pub fn from_submission(submission: PlanSubmission) -> Result<ExecutionPlan> {
        if submission.plan_id.trim().is_empty() {
            return Err(OrchestratorError::invalid_plan(
                &submission.plan_id,
                "plan_id is empty",
            ));
        }
        validate_priority(&submission.plan_id, submission.priority)?;

        let mut seen = HashSet::new();
        for id in &submission.test_case_ids {
            if id.trim().is_empty() {
                return Err(OrchestratorError::invalid_plan(
                    &submission.plan_id,
                    "empty test case id",
                ));
            }
            if !seen.insert(id.as_str()) {
                return Err(OrchestratorError::invalid_plan(
                    &submission.plan_id,
                    format!("duplicate test case id '{}'", id),
                ));
            }
        }

        let total = submission.test_case_ids.len();
        Ok(ExecutionPlan {
            plan_id: submission.plan_id,
            submission_id: submission.submission_id,
            test_case_ids: submission.test_case_ids,
            priority: submission.priority,
            hardware_requirements: submission.hardware_requirements,
            status: PlanStatus::Queued,
            total_tests: total,
            completed_tests: 0,
            failed_tests: 0,
            submitted_at_ms: submission.created_at_ms,
            started_at_ms: None,
            completed_at_ms: None,
        })
    }

    /// Tests that have produced a terminal outcome.
    pub fn finished_tests(&self) -> usize {
        self.completed_tests + self.failed_tests
    }

    /// Record the outcome of one test, keeping `completed + failed <= total`.
    pub fn record_outcome(&mut self, passed: bool) {
        if self.finished_tests() >= self.total_tests {
            return;
        }
        if passed {
            self.completed_tests += 1;
        } else {
            self.failed_tests += 1;
        }
    }

    /// The terminal status this plan should take given its counters.
    pub fn final_status(&self) -> PlanStatus {
        if self.failed_tests > 0 {
            PlanStatus::Failed
        } else {
            PlanStatus::Completed
        }
    }
}

/// Reject priorities outside 1..=10.
pub fn validate_priority(plan_id: &str, priority: u8) -> Result<()> {
    if !(HIGHEST_PRIORITY..=LOWEST_PRIORITY).contains(&priority) {
        return Err(OrchestratorError::invalid_plan(
            plan_id,
            format!(
                "priority {} outside {}..={}",
                priority, HIGHEST_PRIORITY, LOWEST_PRIORITY
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(id: &str, tests: &[&str], priority: u8) -> PlanSubmission {
        PlanSubmission {
            plan_id: id.into(),
            submission_id: format!("sub-{}", id),
            test_case_ids: tests.iter().map(|t| t.to_string()).collect(),
            priority,
            hardware_requirements: HardwareRequirements::default(),
            created_at_ms: 1000,
        }
    }

    #[test]
    fn builds_queued_plan() {
        let plan = ExecutionPlan::from_submission(submission("p1", &["t1", "t2"], 3)).unwrap();
        assert_eq!(plan.status, PlanStatus::Queued);
        assert_eq!(plan.total_tests, 2);
        assert_eq!(plan.submitted_at_ms, 1000);
        assert!(plan.started_at_ms.is_none());
    }

    #[test]
    fn priority_defaults_to_five() {
        let json = r#"{"plan_id":"p1","submission_id":"s1","test_case_ids":["a"],"created_at_ms":5}"#;
        let sub: PlanSubmission = serde_json::from_str(json).unwrap();
        assert_eq!(sub.priority, DEFAULT_PRIORITY);
        assert_eq!(sub.hardware_requirements, HardwareRequirements::default());
    }

    #[test]
    fn rejects_out_of_range_priority() {
        assert!(ExecutionPlan::from_submission(submission("p1", &["t"], 0)).is_err());
        assert!(ExecutionPlan::from_submission(submission("p1", &["t"], 11)).is_err());
        assert!(ExecutionPlan::from_submission(submission("p1", &["t"], 10)).is_ok());
    }

    #[test]
    fn rejects_duplicate_and_empty_ids() {
        let err = ExecutionPlan::from_submission(submission("p1", &["t", "t"], 5)).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        assert!(ExecutionPlan::from_submission(submission("p1", &["t", " "], 5)).is_err());
        assert!(ExecutionPlan::from_submission(submission("", &["t"], 5)).is_err());
    }

    #[test]
    fn outcomes_never_exceed_total() {
        let mut plan = ExecutionPlan::from_submission(submission("p1", &["a", "b"], 5)).unwrap();
        plan.record_outcome(true);
        plan.record_outcome(false);
        plan.record_outcome(true);
        assert_eq!(plan.completed_tests, 1);
        assert_eq!(plan.failed_tests, 1);
        assert_eq!(plan.final_status(), PlanStatus::Failed);
    }

    #[test]
    fn plan_status_serde() {
        assert_eq!(serde_json::to_string(&PlanStatus::Running).unwrap(), "\"running\"");
        assert!(PlanStatus::Completed.is_terminal());
        assert!(!PlanStatus::Queued.is_terminal());
    }
}
