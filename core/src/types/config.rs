//! Orchestrator configuration.
//!
//! Loaded from YAML. Every section and field has a default, so an empty
//! document yields a runnable configuration; policy constants (health
//! thresholds, pool floor, degraded-mode limits, persistence intervals) live
//! here rather than in the components.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::environment::{EnvironmentType, HardwareConfig};
use super::error_event::ErrorCategory;
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    #[default]
    Fixed,
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Directory holding the state file, its backup, stats and the lock file.
    pub state_dir: PathBuf,
    /// Main loop sleep between iterations when the queue is empty.
    pub poll_interval_ms: u64,
    pub max_concurrent_tests: usize,
    pub default_test_timeout_secs: u64,
    /// How long a dispatched test waits for a matching environment before
    /// it is moved to `error`.
    pub allocation_timeout_secs: u64,
    /// Bound on joining each background worker during stop.
    pub stop_timeout_ms: u64,
    pub status: StatusConfig,
    pub resources: ResourceConfig,
    pub timeouts: TimeoutConfig,
    pub errors: ErrorRecoveryConfig,
    pub persistence: PersistenceConfig,
    /// Provisioning strategy per environment type. Types without an entry
    /// use the simulated provisioner.
    pub provisioners: BTreeMap<EnvironmentType, ProvisionerConfig>,
    pub runner: RunnerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            state_dir: PathBuf::from("testpilot-state"),
            poll_interval_ms: 1000,
            max_concurrent_tests: 4,
            default_test_timeout_secs: 300,
            allocation_timeout_secs: 300,
            stop_timeout_ms: 10_000,
            status: StatusConfig::default(),
            resources: ResourceConfig::default(),
            timeouts: TimeoutConfig::default(),
            errors: ErrorRecoveryConfig::default(),
            persistence: PersistenceConfig::default(),
            provisioners: BTreeMap::new(),
            runner: RunnerConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<OrchestratorConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate a configuration from a YAML string.
    pub fn parse(content: &str) -> Result<OrchestratorConfig> {
        let config: OrchestratorConfig = if content.trim().is_empty() {
            OrchestratorConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject values that would stall loops or make the pool unusable.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("default_test_timeout_secs", self.default_test_timeout_secs),
            ("status.metrics_interval_ms", self.status.metrics_interval_ms),
            (
                "resources.health_check_interval_ms",
                self.resources.health_check_interval_ms,
            ),
            (
                "resources.cleanup_interval_ms",
                self.resources.cleanup_interval_ms,
            ),
            ("timeouts.tick_ms", self.timeouts.tick_ms),
            ("errors.recovery_interval_ms", self.errors.recovery_interval_ms),
            ("errors.degraded_window_ms", self.errors.degraded_window_ms),
            ("persistence.tick_ms", self.persistence.tick_ms),
            ("persistence.save_interval_ms", self.persistence.save_interval_ms),
            (
                "persistence.backup_interval_ms",
                self.persistence.backup_interval_ms,
            ),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(OrchestratorError::Config(format!("{} must be > 0", name)));
            }
        }
        if self.max_concurrent_tests == 0 {
            return Err(OrchestratorError::Config(
                "max_concurrent_tests must be > 0".into(),
            ));
        }
        if self.resources.max_environments == 0 {
            return Err(OrchestratorError::Config(
                "resources.max_environments must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.timeouts.warning_ratio) {
            return Err(OrchestratorError::Config(
                "timeouts.warning_ratio must be in [0.0, 1.0)".into(),
            ));
        }
        let seeded: usize = self.resources.initial_pool.iter().map(|s| s.count).sum();
        if seeded > self.resources.max_environments {
            return Err(OrchestratorError::Config(format!(
                "initial_pool seeds {} environments but max_environments is {}",
                seeded, self.resources.max_environments
            )));
        }
        Ok(())
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(&self.persistence.state_file)
    }

    pub fn backup_file(&self) -> PathBuf {
        self.state_dir.join(&self.persistence.backup_file)
    }

    pub fn stats_file(&self) -> PathBuf {
        self.state_dir.join(&self.persistence.stats_file)
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    /// How often the tracker reconciles its counters.
    pub metrics_interval_ms: u64,
    /// Terminal records older than this are evicted.
    pub status_retention_hours: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        StatusConfig {
            metrics_interval_ms: 30_000,
            status_retention_hours: 24,
        }
    }
}

/// Environments created when the resource manager starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSeed {
    pub env_type: EnvironmentType,
    #[serde(default = "default_seed_count")]
    pub count: usize,
    #[serde(default)]
    pub hardware_config: HardwareConfig,
}

fn default_seed_count() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceConfig {
    pub max_environments: usize,
    pub health_check_interval_ms: u64,
    pub cleanup_interval_ms: u64,
    /// A busy environment held longer than this is reported degraded.
    pub busy_degraded_after_ms: u64,
    /// Failure counts in [degraded_failure_count, unhealthy_failure_count] are degraded.
    pub degraded_failure_count: u32,
    /// Failure counts above this are unhealthy.
    pub unhealthy_failure_count: u32,
    /// Unhealthy environments at or above this failure count are replaced
    /// instead of recovered.
    pub replace_after_failures: u32,
    /// Failed environments are removed after this long.
    pub failed_retention_ms: u64,
    /// Available environments unused for this long may be trimmed.
    pub idle_timeout_ms: u64,
    /// Minimum number of idle environments kept by the cleanup loop.
    /// Defaults to `max(2, max_environments / 4)`.
    pub min_pool_size: Option<usize>,
    pub initial_pool: Vec<PoolSeed>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        ResourceConfig {
            max_environments: 10,
            health_check_interval_ms: 30_000,
            cleanup_interval_ms: 300_000,
            busy_degraded_after_ms: 3_600_000,
            degraded_failure_count: 2,
            unhealthy_failure_count: 3,
            replace_after_failures: 5,
            failed_retention_ms: 3_600_000,
            idle_timeout_ms: 1_800_000,
            min_pool_size: None,
            initial_pool: Vec::new(),
        }
    }
}

impl ResourceConfig {
    pub fn pool_floor(&self) -> usize {
        self.min_pool_size
            .unwrap_or_else(|| std::cmp::max(2, self.max_environments / 4))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Scan interval of the deadline loop.
    pub tick_ms: u64,
    /// Fraction of the timeout after which a warning fires.
    pub warning_ratio: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            tick_ms: 1000,
            warning_ratio: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ErrorRecoveryConfig {
    pub recovery_interval_ms: u64,
    /// Rolling window used for degraded-mode evaluation.
    pub degraded_window_ms: u64,
    /// Unresolved critical errors in the window that trigger degraded mode.
    pub critical_threshold: usize,
    /// Unresolved errors per category in the window that trigger degraded mode.
    pub category_thresholds: BTreeMap<ErrorCategory, usize>,
    /// Resolved errors older than this are evicted.
    pub retention_hours: u64,
}

impl Default for ErrorRecoveryConfig {
    fn default() -> Self {
        let mut category_thresholds = BTreeMap::new();
        category_thresholds.insert(ErrorCategory::EnvironmentFailure, 5);
        category_thresholds.insert(ErrorCategory::ResourceExhaustion, 3);
        ErrorRecoveryConfig {
            recovery_interval_ms: 30_000,
            degraded_window_ms: 600_000,
            critical_threshold: 1,
            category_thresholds,
            retention_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    pub state_file: String,
    pub backup_file: String,
    pub stats_file: String,
    /// Wake interval of the persistence loop; individual tasks run on their
    /// own intervals below.
    pub tick_ms: u64,
    pub save_interval_ms: u64,
    pub backup_interval_ms: u64,
    pub consistency_interval_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Persisted entries older than this are discarded at startup.
    pub max_recovery_age_hours: u64,
    /// Recovery attempts before a test is marked failed.
    pub max_retries: u32,
    /// Terminal entries older than this are evicted by the background loop.
    pub cleanup_age_hours: u64,
    /// Write the state file on every persisted change, not only on the timer.
    pub save_on_change: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            state_file: "orchestrator_state.json".into(),
            backup_file: "orchestrator_state.backup.json".into(),
            stats_file: "stats.json".into(),
            tick_ms: 1000,
            save_interval_ms: 30_000,
            backup_interval_ms: 300_000,
            consistency_interval_ms: 60_000,
            cleanup_interval_ms: 3_600_000,
            max_recovery_age_hours: 24,
            max_retries: 3,
            cleanup_age_hours: 48,
            save_on_change: true,
        }
    }
}

/// How environments of one type are provisioned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProvisionerConfig {
    Simulated {
        #[serde(default)]
        provision_delay_ms: u64,
        #[serde(default)]
        cleanup_delay_ms: u64,
    },
    /// Shell command templates. Placeholders: `{env_id}`, `{architecture}`,
    /// `{memory_mb}`, `{cpu_cores}`.
    Command {
        provision: String,
        cleanup: String,
        #[serde(default)]
        probe: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Shell command template run per test. Placeholders: `{test_id}`,
    /// `{environment_id}`, `{timeout_secs}`. Unset means simulated execution.
    pub command: Option<String>,
    pub simulated_duration_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            command: None,
            simulated_duration_ms: 100,
        }
    }
}
