use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    EnvironmentFailure,
    ResourceExhaustion,
    NetworkIssue,
    Timeout,
    PermissionError,
    ConfigurationError,
    SystemError,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::EnvironmentFailure => "environment_failure",
            ErrorCategory::ResourceExhaustion => "resource_exhaustion",
            ErrorCategory::NetworkIssue => "network_issue",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::PermissionError => "permission_error",
            ErrorCategory::ConfigurationError => "configuration_error",
            ErrorCategory::SystemError => "system_error",
            ErrorCategory::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// A recorded error, owned by the error recovery manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEvent {
    pub id: String,
    pub timestamp_ms: u64,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub component: String,
    pub message: String,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
    pub environment_id: Option<String>,
    pub test_id: Option<String>,
    pub retry_count: u32,
    pub resolved: bool,
    pub resolved_at_ms: Option<u64>,
    pub resolution: Option<String>,
    /// Set once every applicable recovery action has used its retry budget.
    #[serde(default)]
    pub recovery_exhausted: bool,
}

/// Input for `ErrorRecoveryManager::report_error`.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub component: String,
    pub message: String,
    pub details: BTreeMap<String, String>,
    pub environment_id: Option<String>,
    pub test_id: Option<String>,
}

impl ErrorReport {
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        component: &str,
        message: impl Into<String>,
    ) -> Self {
        ErrorReport {
            category,
            severity,
            component: component.to_string(),
            message: message.into(),
            details: BTreeMap::new(),
            environment_id: None,
            test_id: None,
        }
    }

    pub fn environment(mut self, env_id: &str) -> Self {
        self.environment_id = Some(env_id.to_string());
        self
    }

    pub fn test(mut self, test_id: &str) -> Self {
        self.test_id = Some(test_id.to_string());
        self
    }

    pub fn detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}
