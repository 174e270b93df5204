//! On-disk snapshot of in-flight work.
//!
//! Layout: `{ timestamp, version, plans, tests, statistics }`. Plans carry
//! their own test states and the terminal status of every test that already
//! finished, so recovery can tell which tests still have to run. Readers
//! ignore unknown fields and default missing ones.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{OrchestratorError, Result};
use crate::types::{
    ExecutionPlan, HardwareRequirements, PlanStatus, TestStatus, DEFAULT_PRIORITY,
};

pub const STATE_VERSION: u32 = 1;

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedTestState {
    pub test_id: String,
    #[serde(default)]
    pub plan_id: Option<String>,
    pub status: TestStatus,
    #[serde(default)]
    pub environment_id: Option<String>,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    /// Times this test has been re-queued by startup recovery.
    #[serde(default)]
    pub retry_count: u32,
    /// Timeout the test ran under, re-registered on recovery.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
    pub updated_at_ms: u64,
}

impl PersistedTestState {
    pub fn new(test_id: &str, plan_id: Option<&str>, status: TestStatus, now: u64) -> Self {
        PersistedTestState {
            test_id: test_id.to_string(),
            plan_id: plan_id.map(str::to_string),
            status,
            environment_id: None,
            progress: 0.0,
            started_at_ms: None,
            retry_count: 0,
            timeout_secs: None,
            message: None,
            updated_at_ms: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedPlanState {
    pub plan_id: String,
    #[serde(default)]
    pub submission_id: String,
    pub test_case_ids: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub hardware_requirements: HardwareRequirements,
    pub status: PlanStatus,
    pub total_tests: usize,
    #[serde(default)]
    pub completed_tests: usize,
    #[serde(default)]
    pub failed_tests: usize,
    /// Terminal status of every test of this plan that already finished.
    #[serde(default)]
    pub finished_tests: BTreeMap<String, TestStatus>,
    /// Latest state of this plan's unfinished tests.
    #[serde(default)]
    pub test_states: BTreeMap<String, PersistedTestState>,
    #[serde(default)]
    pub submitted_at_ms: u64,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    pub updated_at_ms: u64,
}

impl PersistedPlanState {
    pub fn from_plan(plan: &ExecutionPlan, now: u64) -> Self {
        PersistedPlanState {
            plan_id: plan.plan_id.clone(),
            submission_id: plan.submission_id.clone(),
            test_case_ids: plan.test_case_ids.clone(),
            priority: plan.priority,
            hardware_requirements: plan.hardware_requirements.clone(),
            status: plan.status,
            total_tests: plan.total_tests,
            completed_tests: plan.completed_tests,
            failed_tests: plan.failed_tests,
            finished_tests: BTreeMap::new(),
            test_states: BTreeMap::new(),
            submitted_at_ms: plan.submitted_at_ms,
            started_at_ms: plan.started_at_ms,
            updated_at_ms: now,
        }
    }

    /// Refresh the plan-level fields from `plan`, keeping recorded outcomes
    /// and test states.
    pub fn refresh(&mut self, plan: &ExecutionPlan, now: u64) {
        let finished = std::mem::take(&mut self.finished_tests);
        let tests = std::mem::take(&mut self.test_states);
        let test_case_ids = std::mem::take(&mut self.test_case_ids);
        *self = PersistedPlanState::from_plan(plan, now);
        // A recovered plan only lists its remaining tests; keep the full list.
        if test_case_ids.len() > self.test_case_ids.len() {
            self.test_case_ids = test_case_ids;
        }
        self.finished_tests = finished;
        self.test_states = tests;
    }

    /// Tests not yet finished, in submission order.
    pub fn remaining_tests(&self) -> Vec<String> {
        self.test_case_ids
            .iter()
            .filter(|id| !self.finished_tests.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Recompute the outcome counters from `finished_tests`.
    pub fn recount(&mut self) {
        self.completed_tests = self
            .finished_tests
            .values()
            .filter(|s| !s.is_failure())
            .count();
        self.failed_tests = self.finished_tests.len() - self.completed_tests;
    }

    /// Rebuild a queued plan holding only the remaining tests.
    pub fn to_recovered_plan(&self) -> ExecutionPlan {
        ExecutionPlan {
            plan_id: self.plan_id.clone(),
            submission_id: self.submission_id.clone(),
            test_case_ids: self.remaining_tests(),
            priority: self.priority,
            hardware_requirements: self.hardware_requirements.clone(),
            status: PlanStatus::Queued,
            total_tests: self.total_tests,
            completed_tests: self.completed_tests,
            failed_tests: self.failed_tests,
            submitted_at_ms: self.submitted_at_ms,
            started_at_ms: self.started_at_ms,
            completed_at_ms: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StateStatistics {
    pub total_plans: usize,
    pub total_tests: usize,
    pub running_tests: usize,
    pub queued_tests: usize,
    pub saves: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    pub timestamp: u64,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub plans: BTreeMap<String, PersistedPlanState>,
    #[serde(default)]
    pub tests: BTreeMap<String, PersistedTestState>,
    #[serde(default)]
    pub statistics: StateStatistics,
}

impl Default for PersistedState {
    fn default() -> Self {
        PersistedState {
            timestamp: 0,
            version: STATE_VERSION,
            plans: BTreeMap::new(),
            tests: BTreeMap::new(),
            statistics: StateStatistics::default(),
        }
    }
}

impl PersistedState {
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty() && self.tests.is_empty()
    }

    pub fn compute_statistics(&self, saves: u64) -> StateStatistics {
        StateStatistics {
            total_plans: self.plans.len(),
            total_tests: self.tests.len(),
            running_tests: self
                .tests
                .values()
                .filter(|t| t.status == TestStatus::Running)
                .count(),
            queued_tests: self
                .tests
                .values()
                .filter(|t| t.status == TestStatus::Queued)
                .count(),
            saves,
        }
    }
}

/// Where a loaded snapshot came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateSource {
    Primary,
    Backup,
    Empty,
}

#[derive(Debug)]
pub struct LoadedState {
    pub state: PersistedState,
    pub source: StateSource,
    /// Problems met while loading, e.g. a corrupt primary file.
    pub errors: Vec<String>,
}

/// Load the primary snapshot, falling back to the backup when the primary
/// is missing or unreadable. Neither present yields an empty state.
pub fn load_state(primary: &Path, backup: &Path) -> LoadedState {
    let mut errors = Vec::new();
    match read_json::<PersistedState>(primary) {
        Ok(Some(state)) => {
            return LoadedState {
                state,
                source: StateSource::Primary,
                errors,
            }
        }
        Ok(None) => {}
        Err(e) => {
            warn!(path = %primary.display(), error = %e, "state file unreadable; trying backup");
            errors.push(format!("{}: {}", primary.display(), e));
        }
    }
    match read_json::<PersistedState>(backup) {
        Ok(Some(state)) => LoadedState {
            state,
            source: StateSource::Backup,
            errors,
        },
        Ok(None) => LoadedState {
            state: PersistedState::default(),
            source: StateSource::Empty,
            errors,
        },
        Err(e) => {
            warn!(path = %backup.display(), error = %e, "backup state file unreadable");
            errors.push(format!("{}: {}", backup.display(), e));
            LoadedState {
                state: PersistedState::default(),
                source: StateSource::Empty,
                errors,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Serialize `value` to `path` through a synced temp file and a rename, so
/// readers see either the old or the new content.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        OrchestratorError::Persistence(format!(
            "rename {} -> {}: {}",
            tmp.display(),
            path.display(),
            e
        ))
    })
}

/// Read and parse `path`. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&content)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlanSubmission;

    fn plan(tests: &[&str]) -> ExecutionPlan {
        ExecutionPlan::from_submission(PlanSubmission {
            plan_id: "p1".into(),
            submission_id: "s1".into(),
            test_case_ids: tests.iter().map(|t| t.to_string()).collect(),
            priority: 2,
            hardware_requirements: HardwareRequirements::default(),
            created_at_ms: 10,
        })
        .unwrap()
    }

    #[test]
    fn remaining_tests_skip_finished() {
        let mut p = PersistedPlanState::from_plan(&plan(&["a", "b", "c", "d", "e"]), 0);
        p.finished_tests.insert("b".into(), TestStatus::Completed);
        p.finished_tests.insert("d".into(), TestStatus::Timeout);
        p.recount();
        assert_eq!(p.remaining_tests(), vec!["a", "c", "e"]);
        assert_eq!((p.completed_tests, p.failed_tests), (1, 1));

        let recovered = p.to_recovered_plan();
        assert_eq!(recovered.status, PlanStatus::Queued);
        assert_eq!(recovered.test_case_ids, vec!["a", "c", "e"]);
        assert_eq!(recovered.total_tests, 5);
        assert_eq!(recovered.priority, 2);
    }

    #[test]
    fn refresh_keeps_full_test_list_and_outcomes() {
        let mut p = PersistedPlanState::from_plan(&plan(&["a", "b", "c"]), 0);
        p.finished_tests.insert("a".into(), TestStatus::Completed);
        let mut recovered = p.to_recovered_plan();
        recovered.status = PlanStatus::Running;
        p.refresh(&recovered, 5);
        assert_eq!(p.test_case_ids, vec!["a", "b", "c"]);
        assert_eq!(p.status, PlanStatus::Running);
        assert_eq!(p.finished_tests.len(), 1);
        assert_eq!(p.updated_at_ms, 5);
    }

    #[test]
    fn atomic_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut state = PersistedState::default();
        state.timestamp = 42;
        state
            .tests
            .insert("t1".into(), PersistedTestState::new("t1", Some("p1"), TestStatus::Running, 1));
        write_json_atomic(&path, &state).unwrap();
        assert!(!temp_path(&path).exists());

        let back: PersistedState = read_json(&path).unwrap().unwrap();
        assert_eq!(back, state);
        assert!(read_json::<PersistedState>(&dir.path().join("missing.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn tolerates_unknown_and_missing_fields() {
        let json = r#"{"timestamp":5,"extra":true,
            "tests":{"t1":{"test_id":"t1","status":"queued","updated_at_ms":1,"future":1}}}"#;
        let state: PersistedState = serde_json::from_str(json).unwrap();
        assert_eq!(state.version, 0);
        assert!(state.plans.is_empty());
        assert_eq!(state.tests["t1"].retry_count, 0);
    }

    #[test]
    fn load_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("state.json");
        let backup = dir.path().join("backup.json");

        let loaded = load_state(&primary, &backup);
        assert_eq!(loaded.source, StateSource::Empty);
        assert!(loaded.errors.is_empty());

        let mut state = PersistedState::default();
        state.timestamp = 7;
        write_json_atomic(&backup, &state).unwrap();
        fs::write(&primary, "{ truncated").unwrap();

        let loaded = load_state(&primary, &backup);
        assert_eq!(loaded.source, StateSource::Backup);
        assert_eq!(loaded.state.timestamp, 7);
        assert_eq!(loaded.errors.len(), 1);
    }
}
