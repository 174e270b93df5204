//! Plan submission stores the queue monitor reads from.
//!
//! The queue monitor only ever reads a `PlanSource`; removing submissions is
//! the submitting layer's business.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{OrchestratorError, Result};
use crate::types::PlanSubmission;

/// Read access to the external plan submission store.
pub trait PlanSource: Send + Sync {
    /// Return submissions whose `plan_id` is not in `seen`.
    ///
    /// Returns `OrchestratorError::SourceUnavailable` when the store cannot be
    /// read yet; callers treat that as "nothing new".
    fn list_new_plans(&self, seen: &HashSet<String>) -> Result<Vec<PlanSubmission>>;
}

// ---------------------------------------------------------------------------
// InMemoryPlanSource
// ---------------------------------------------------------------------------

/// Thread-safe in-process submission store.
#[derive(Debug)]
pub struct InMemoryPlanSource {
    plans: Mutex<BTreeMap<String, PlanSubmission>>,
    available: AtomicBool,
}

impl InMemoryPlanSource {
    pub fn new() -> Self {
        InMemoryPlanSource {
            plans: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Add or replace a submission.
    pub fn submit(&self, submission: PlanSubmission) {
        self.plans
            .lock()
            .insert(submission.plan_id.clone(), submission);
    }

    /// Toggle availability, simulating a store that is still starting up.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.plans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.lock().is_empty()
    }
}

impl Default for InMemoryPlanSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanSource for InMemoryPlanSource {
    fn list_new_plans(&self, seen: &HashSet<String>) -> Result<Vec<PlanSubmission>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(OrchestratorError::SourceUnavailable(
                "in-memory store offline".into(),
            ));
        }
        Ok(self
            .plans
            .lock()
            .values()
            .filter(|p| !seen.contains(&p.plan_id))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// DirectoryPlanSource
// ---------------------------------------------------------------------------

/// Reads one JSON `PlanSubmission` per `*.json` file in a directory.
#[derive(Debug, Clone)]
pub struct DirectoryPlanSource {
    dir: PathBuf,
}

impl DirectoryPlanSource {
    pub fn new(dir: &Path) -> Self {
        DirectoryPlanSource {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl PlanSource for DirectoryPlanSource {
    fn list_new_plans(&self, seen: &HashSet<String>) -> Result<Vec<PlanSubmission>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            OrchestratorError::SourceUnavailable(format!("{}: {}", self.dir.display(), e))
        })?;

        let mut plans = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable submission");
                    continue;
                }
            };
            match serde_json::from_str::<PlanSubmission>(&content) {
                Ok(plan) if !seen.contains(&plan.plan_id) => plans.push(plan),
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed submission");
                }
            }
        }
        Ok(plans)
    }
}
