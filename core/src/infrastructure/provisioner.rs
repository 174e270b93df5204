//! Environment provisioning strategies, one per environment type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::runner::{render_template, CommandRunner, ShellRunner};
use super::simulated::SimulatedProvisioner;
use crate::error::{OrchestratorError, Result};
use crate::types::config::ProvisionerConfig;
use crate::types::{EnvironmentType, HardwareConfig, HealthState};

/// Creates, tears down and probes environments of one type.
///
/// Calls may block on real I/O; the resource manager never calls them while
/// holding its pool lock.
pub trait Provisioner: Send + Sync {
    fn env_type(&self) -> EnvironmentType;

    /// Whether new environments can be created on allocation demand.
    /// Physical boards only enter the pool through the initial seed.
    fn can_provision_on_demand(&self) -> bool {
        self.env_type() != EnvironmentType::Physical
    }

    fn provision(&self, env_id: &str, config: &HardwareConfig) -> Result<()>;

    fn cleanup(&self, env_id: &str) -> Result<()>;

    fn health_probe(&self, env_id: &str) -> HealthState;
}

// ---------------------------------------------------------------------------
// CommandProvisioner
// ---------------------------------------------------------------------------

/// Runs configured shell templates through a `CommandRunner`.
///
/// The probe command's stdout decides health: `degraded` or `unhealthy`
/// (case-insensitive, trimmed) map to those states, anything else from a
/// successful run is healthy, and a failed run is unhealthy.
pub struct CommandProvisioner {
    env_type: EnvironmentType,
    provision: String,
    cleanup: String,
    probe: Option<String>,
    runner: Arc<dyn CommandRunner>,
}

impl CommandProvisioner {
    pub fn new(
        env_type: EnvironmentType,
        provision: &str,
        cleanup: &str,
        probe: Option<&str>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        CommandProvisioner {
            env_type,
            provision: provision.to_string(),
            cleanup: cleanup.to_string(),
            probe: probe.map(str::to_string),
            runner,
        }
    }
}

impl Provisioner for CommandProvisioner {
    fn env_type(&self) -> EnvironmentType {
        self.env_type
    }

    fn provision(&self, env_id: &str, config: &HardwareConfig) -> Result<()> {
        let cmd = render_template(
            &self.provision,
            &[
                ("env_id", env_id.to_string()),
                ("architecture", config.architecture.clone()),
                ("memory_mb", config.memory_mb.to_string()),
                ("cpu_cores", config.cpu_cores.to_string()),
            ],
        );
        debug!(env_id, cmd = %cmd, "provisioning");
        self.runner
            .run(&cmd)
            .map(|_| ())
            .map_err(|reason| OrchestratorError::Provisioning {
                env_type: self.env_type.to_string(),
                env_id: env_id.to_string(),
                reason,
            })
    }

    fn cleanup(&self, env_id: &str) -> Result<()> {
        let cmd = render_template(&self.cleanup, &[("env_id", env_id.to_string())]);
        self.runner
            .run(&cmd)
            .map(|_| ())
            .map_err(|reason| OrchestratorError::Cleanup {
                env_id: env_id.to_string(),
                reason,
            })
    }

    fn health_probe(&self, env_id: &str) -> HealthState {
        let Some(probe) = &self.probe else {
            return HealthState::Healthy;
        };
        let cmd = render_template(probe, &[("env_id", env_id.to_string())]);
        match self.runner.run(&cmd) {
            Ok(out) => match out.trim().to_ascii_lowercase().as_str() {
                "degraded" => HealthState::Degraded,
                "unhealthy" => HealthState::Unhealthy,
                _ => HealthState::Healthy,
            },
            Err(e) => {
                debug!(env_id, error = %e, "health probe failed");
                HealthState::Unhealthy
            }
        }
    }
}

impl fmt::Debug for CommandProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandProvisioner")
            .field("env_type", &self.env_type)
            .field("provision", &self.provision)
            .field("cleanup", &self.cleanup)
            .field("probe", &self.probe)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ProvisionerRegistry
// ---------------------------------------------------------------------------

const ALL_TYPES: [EnvironmentType; 4] = [
    EnvironmentType::Docker,
    EnvironmentType::Qemu,
    EnvironmentType::Physical,
    EnvironmentType::Container,
];

/// Provisioner lookup by environment type.
#[derive(Clone, Default)]
pub struct ProvisionerRegistry {
    provisioners: HashMap<EnvironmentType, Arc<dyn Provisioner>>,
}

impl ProvisionerRegistry {
    pub fn new() -> Self {
        ProvisionerRegistry::default()
    }

    /// A simulated provisioner for every type.
    pub fn simulated() -> Self {
        let mut registry = ProvisionerRegistry::new();
        for env_type in ALL_TYPES {
            registry.register(Arc::new(SimulatedProvisioner::new(env_type)));
        }
        registry
    }

    /// Build from configuration; unconfigured types are simulated.
    pub fn from_config(
        configs: &std::collections::BTreeMap<EnvironmentType, ProvisionerConfig>,
    ) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner::new());
        let mut registry = ProvisionerRegistry::simulated();
        for (env_type, config) in configs {
            let provisioner: Arc<dyn Provisioner> = match config {
                ProvisionerConfig::Simulated {
                    provision_delay_ms,
                    cleanup_delay_ms,
                } => Arc::new(
                    SimulatedProvisioner::new(*env_type)
                        .with_delays(*provision_delay_ms, *cleanup_delay_ms),
                ),
                ProvisionerConfig::Command {
                    provision,
                    cleanup,
                    probe,
                } => Arc::new(CommandProvisioner::new(
                    *env_type,
                    provision,
                    cleanup,
                    probe.as_deref(),
                    runner.clone(),
                )),
            };
            registry.register(provisioner);
        }
        registry
    }

    /// Add or replace the provisioner for its type.
    pub fn register(&mut self, provisioner: Arc<dyn Provisioner>) {
        self.provisioners.insert(provisioner.env_type(), provisioner);
    }

    pub fn get(&self, env_type: EnvironmentType) -> Option<Arc<dyn Provisioner>> {
        self.provisioners.get(&env_type).cloned()
    }
}

impl fmt::Debug for ProvisionerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.provisioners.keys().collect();
        types.sort();
        f.debug_struct("ProvisionerRegistry")
            .field("types", &types)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::runner::MockRunner;

    fn command_provisioner(runner: Arc<MockRunner>) -> CommandProvisioner {
        CommandProvisioner::new(
            EnvironmentType::Docker,
            "docker run -d --name {env_id} --memory {memory_mb}m --cpus {cpu_cores} img-{architecture}",
            "docker rm -f {env_id}",
            Some("probe {env_id}"),
            runner,
        )
    }

    #[test]
    fn command_provision_renders_template() {
        let runner = Arc::new(MockRunner::new());
        let p = command_provisioner(runner.clone());
        p.provision("docker-7", &HardwareConfig::default()).unwrap();
        assert_eq!(
            runner.executed_commands(),
            vec!["docker run -d --name docker-7 --memory 2048m --cpus 2 img-x86_64"]
        );
    }

    #[test]
    fn command_failures_map_to_errors() {
        let runner = Arc::new(MockRunner::new());
        runner.respond("docker run", Err("daemon down".into()));
        runner.respond("docker rm", Err("busy".into()));
        let p = command_provisioner(runner);
        let err = p.provision("d1", &HardwareConfig::default()).unwrap_err();
        assert!(matches!(err, OrchestratorError::Provisioning { .. }));
        assert!(err.to_string().contains("daemon down"));
        assert!(matches!(
            p.cleanup("d1").unwrap_err(),
            OrchestratorError::Cleanup { .. }
        ));
    }

    #[test]
    fn probe_output_decides_health() {
        let runner = Arc::new(MockRunner::new());
        runner.respond("probe a", Ok("ok\n".into()));
        runner.respond("probe b", Ok(" Degraded \n".into()));
        runner.respond("probe c", Err("unreachable".into()));
        let p = command_provisioner(runner);
        assert_eq!(p.health_probe("a"), HealthState::Healthy);
        assert_eq!(p.health_probe("b"), HealthState::Degraded);
        assert_eq!(p.health_probe("c"), HealthState::Unhealthy);
    }

    #[test]
    fn physical_is_not_on_demand() {
        let runner = Arc::new(MockRunner::new());
        let p = CommandProvisioner::new(EnvironmentType::Physical, "a", "b", None, runner);
        assert!(!p.can_provision_on_demand());
        assert_eq!(p.health_probe("board-1"), HealthState::Healthy);
    }

    #[test]
    fn registry_from_config_overrides_types() {
        let mut configs = std::collections::BTreeMap::new();
        configs.insert(
            EnvironmentType::Qemu,
            ProvisionerConfig::Command {
                provision: "true".into(),
                cleanup: "true".into(),
                probe: None,
            },
        );
        let registry = ProvisionerRegistry::from_config(&configs);
        for t in ALL_TYPES {
            assert_eq!(registry.get(t).unwrap().env_type(), t);
        }
        assert!(format!("{:?}", registry).contains("Qemu"));
    }
}
