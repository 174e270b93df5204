//! Simulated provisioner for tests and local runs.
//!
//! Records every operation and lets callers inject provisioning, cleanup
//! and probe outcomes, so resource-manager behavior can be exercised
//! deterministically.

use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::provisioner::Provisioner;
use crate::error::{OrchestratorError, Result};
use crate::types::{EnvironmentType, HardwareConfig, HealthState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOp {
    Provision(String),
    Cleanup(String),
    Probe(String),
}

#[derive(Debug, Default)]
struct SimState {
    live: HashSet<String>,
    fail_provision: bool,
    fail_cleanup: HashSet<String>,
    fail_all_cleanup: bool,
    probes: HashMap<String, HealthState>,
    ops: Vec<ProvisionOp>,
}

#[derive(Debug)]
pub struct SimulatedProvisioner {
    env_type: EnvironmentType,
    provision_delay: Duration,
    cleanup_delay: Duration,
    state: Mutex<SimState>,
}

impl SimulatedProvisioner {
    pub fn new(env_type: EnvironmentType) -> Self {
        SimulatedProvisioner {
            env_type,
            provision_delay: Duration::ZERO,
            cleanup_delay: Duration::ZERO,
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_delays(mut self, provision_ms: u64, cleanup_ms: u64) -> Self {
        self.provision_delay = Duration::from_millis(provision_ms);
        self.cleanup_delay = Duration::from_millis(cleanup_ms);
        self
    }

    pub fn set_fail_provision(&self, fail: bool) {
        self.state.lock().fail_provision = fail;
    }

    /// Make cleanup of one environment fail (or succeed again).
    pub fn set_fail_cleanup(&self, env_id: &str, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.fail_cleanup.insert(env_id.to_string());
        } else {
            state.fail_cleanup.remove(env_id);
        }
    }

    pub fn set_fail_all_cleanup(&self, fail: bool) {
        self.state.lock().fail_all_cleanup = fail;
    }

    /// Force the probe result for one environment.
    pub fn set_probe(&self, env_id: &str, health: HealthState) {
        self.state.lock().probes.insert(env_id.to_string(), health);
    }

    pub fn clear_probe(&self, env_id: &str) {
        self.state.lock().probes.remove(env_id);
    }

    pub fn ops(&self) -> Vec<ProvisionOp> {
        self.state.lock().ops.clone()
    }

    pub fn provision_count(&self) -> usize {
        self.state
            .lock()
            .ops
            .iter()
            .filter(|op| matches!(op, ProvisionOp::Provision(_)))
            .count()
    }

    pub fn is_live(&self, env_id: &str) -> bool {
        self.state.lock().live.contains(env_id)
    }
}

impl Provisioner for SimulatedProvisioner {
    fn env_type(&self) -> EnvironmentType {
        self.env_type
    }

    fn provision(&self, env_id: &str, _config: &HardwareConfig) -> Result<()> {
        if !self.provision_delay.is_zero() {
            thread::sleep(self.provision_delay);
        }
        let mut state = self.state.lock();
        state.ops.push(ProvisionOp::Provision(env_id.to_string()));
        if state.fail_provision {
            return Err(OrchestratorError::Provisioning {
                env_type: self.env_type.to_string(),
                env_id: env_id.to_string(),
                reason: "simulated provisioning failure".into(),
            });
        }
        state.live.insert(env_id.to_string());
        Ok(())
    }

    fn cleanup(&self, env_id: &str) -> Result<()> {
        if !self.cleanup_delay.is_zero() {
            thread::sleep(self.cleanup_delay);
        }
        let mut state = self.state.lock();
        state.ops.push(ProvisionOp::Cleanup(env_id.to_string()));
        if state.fail_all_cleanup || state.fail_cleanup.contains(env_id) {
            return Err(OrchestratorError::Cleanup {
                env_id: env_id.to_string(),
                reason: "simulated cleanup failure".into(),
            });
        }
        Ok(())
    }

    fn health_probe(&self, env_id: &str) -> HealthState {
        let mut state = self.state.lock();
        state.ops.push(ProvisionOp::Probe(env_id.to_string()));
        if let Some(h) = state.probes.get(env_id) {
            return *h;
        }
        if state.live.contains(env_id) {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        }
    }
}
