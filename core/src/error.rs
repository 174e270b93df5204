use thiserror::Error;

/// Result alias used across the orchestrator core.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors raised by orchestrator components.
///
/// Background loops never propagate these; they log them and report them
/// to the error recovery manager instead.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A submission failed validation and can never be scheduled.
    #[error("invalid plan '{plan_id}': {reason}")]
    InvalidPlan { plan_id: String, reason: String },

    /// The plan submission store could not be read right now.
    #[error("plan source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("provisioning {env_type} environment '{env_id}' failed: {reason}")]
    Provisioning {
        env_type: String,
        env_id: String,
        reason: String,
    },

    #[error("cleanup of environment '{env_id}' failed: {reason}")]
    Cleanup { env_id: String, reason: String },

    #[error("recovery action already registered: {0}")]
    DuplicateAction(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("test execution failed: {0}")]
    Execution(String),

    /// Another process holds the state directory lock.
    #[error("state directory is locked: {0}")]
    Locked(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl OrchestratorError {
    pub fn invalid_plan(plan_id: &str, reason: impl Into<String>) -> Self {
        OrchestratorError::InvalidPlan {
            plan_id: plan_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::SourceUnavailable(_)
                | OrchestratorError::Io(_)
                | OrchestratorError::Provisioning { .. }
                | OrchestratorError::Cleanup { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = OrchestratorError::invalid_plan("p1", "priority 11 out of range");
        assert_eq!(err.to_string(), "invalid plan 'p1': priority 11 out of range");

        let err = OrchestratorError::Provisioning {
            env_type: "docker".into(),
            env_id: "docker-1".into(),
            reason: "daemon unreachable".into(),
        };
        assert!(err.to_string().contains("docker-1"));
        assert!(err.to_string().contains("daemon unreachable"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: OrchestratorError = io.into();
        assert!(matches!(err, OrchestratorError::Io(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn validation_errors_are_not_transient() {
        assert!(!OrchestratorError::invalid_plan("p", "x").is_transient());
        assert!(!OrchestratorError::DuplicateAction("a".into()).is_transient());
        assert!(OrchestratorError::SourceUnavailable("warming up".into()).is_transient());
    }
}
