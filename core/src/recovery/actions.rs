//! Recovery actions: named, retry-bounded remediation strategies.

use std::fmt;
use std::sync::{Arc, Weak};

use super::retry::RetryPolicy;
use crate::error::{OrchestratorError, Result};
use crate::resource::ResourceManager;
use crate::types::{ErrorCategory, ErrorEvent, ErrorSeverity};

pub type RecoveryHandler = Arc<dyn Fn(&ErrorEvent) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct RecoveryAction {
    pub name: String,
    pub categories: Vec<ErrorCategory>,
    pub severities: Vec<ErrorSeverity>,
    pub retry: RetryPolicy,
    pub handler: RecoveryHandler,
}

impl RecoveryAction {
    pub fn new<F>(
        name: &str,
        categories: &[ErrorCategory],
        severities: &[ErrorSeverity],
        retry: RetryPolicy,
        handler: F,
    ) -> Self
    where
        F: Fn(&ErrorEvent) -> Result<()> + Send + Sync + 'static,
    {
        RecoveryAction {
            name: name.to_string(),
            categories: categories.to_vec(),
            severities: severities.to_vec(),
            retry,
            handler: Arc::new(handler),
        }
    }

    pub fn applies_to(&self, event: &ErrorEvent) -> bool {
        self.categories.contains(&event.category) && self.severities.contains(&event.severity)
    }
}

impl fmt::Debug for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryAction")
            .field("name", &self.name)
            .field("categories", &self.categories)
            .field("severities", &self.severities)
            .field("retry", &self.retry)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in actions
// ---------------------------------------------------------------------------

pub const ENVIRONMENT_RESTART: &str = "environment_restart";
pub const RESOURCE_CLEANUP: &str = "resource_cleanup";
pub const NETWORK_RETRY: &str = "network_retry";

fn resources_gone() -> OrchestratorError {
    OrchestratorError::Execution("resource manager is no longer running".into())
}

/// Cleanup and re-provision the environment the error is attributed to.
pub fn environment_restart(resources: Weak<ResourceManager>) -> RecoveryAction {
    RecoveryAction::new(
        ENVIRONMENT_RESTART,
        &[ErrorCategory::EnvironmentFailure],
        &[ErrorSeverity::High, ErrorSeverity::Critical],
        RetryPolicy::fixed(3, 30_000),
        move |event| {
            let resources = resources.upgrade().ok_or_else(resources_gone)?;
            let env_id = event.environment_id.as_deref().ok_or_else(|| {
                OrchestratorError::Execution("error is not attributed to an environment".into())
            })?;
            resources.recover_environment(env_id)
        },
    )
}

/// Run an immediate idle/failed environment cleanup pass.
pub fn resource_cleanup(resources: Weak<ResourceManager>) -> RecoveryAction {
    RecoveryAction::new(
        RESOURCE_CLEANUP,
        &[ErrorCategory::ResourceExhaustion],
        &[ErrorSeverity::Medium, ErrorSeverity::High],
        RetryPolicy::fixed(2, 60_000),
        move |_event| {
            let resources = resources.upgrade().ok_or_else(resources_gone)?;
            resources.cleanup_idle_environments();
            Ok(())
        },
    )
}

/// Transient network faults are considered resolved on the next recovery
/// pass after they were reported.
pub fn network_retry() -> RecoveryAction {
    RecoveryAction::new(
        NETWORK_RETRY,
        &[ErrorCategory::NetworkIssue],
        &[ErrorSeverity::Low, ErrorSeverity::Medium],
        RetryPolicy::fixed(5, 5_000),
        |_event| Ok(()),
    )
}

pub fn default_actions(resources: Weak<ResourceManager>) -> Vec<RecoveryAction> {
    vec![
        environment_restart(resources.clone()),
        resource_cleanup(resources),
        network_retry(),
    ]
}
