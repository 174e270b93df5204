//! Environment pool: allocation, release, health checking and self-repair.
//!
//! The pool lock guards only the in-memory structures. Provisioning, cleanup
//! and probes run with the lock released: the environment is first moved to
//! a transitional status (`provisioning`, `cleanup`, `maintenance`) that keeps
//! it out of the allocatable set, the I/O runs, and the outcome is applied
//! under a fresh lock.
//!
//! Repairs of unhealthy environments run on short-lived worker threads. An
//! environment is claimed for repair at most once at a time.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::health::{assess, policy_signals, probe_signal};
use super::matching::{best_fit, environment_type_for, hardware_config_for};
use crate::clock::now_ms;
use crate::error::{OrchestratorError, Result};
use crate::infrastructure::ProvisionerRegistry;
use crate::recovery::ErrorRecoveryManager;
use crate::types::config::ResourceConfig;
use crate::types::health::HealthAssessment;
use crate::types::{
    ComponentHealth, EnvironmentStatus, EnvironmentType, ErrorCategory, ErrorReport,
    ErrorSeverity, HardwareConfig, HardwareRequirements, HealthState, ManagedEnvironment,
    ResourceUsage, ServiceState,
};
use crate::worker::{join_all, Worker, WorkerSet};

const COMPONENT: &str = "resource_manager";

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolStats {
    pub allocations: u64,
    pub releases: u64,
    pub provisioned: u64,
    pub provision_failures: u64,
    pub cleanup_failures: u64,
    pub recoveries: u64,
    pub replacements: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceUtilization {
    pub total_environments: usize,
    pub available_environments: usize,
    pub busy_environments: usize,
    pub provisioning_environments: usize,
    pub failed_environments: usize,
    pub max_environments: usize,
    pub pool_floor: usize,
    pub by_type: BTreeMap<EnvironmentType, usize>,
    pub total_memory_mb: u64,
    pub allocated_memory_mb: u64,
    pub memory_utilization: f64,
    pub total_cpu_cores: u64,
    pub allocated_cpu_cores: u64,
    pub cpu_utilization: f64,
    #[serde(flatten)]
    pub stats: PoolStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed_failed: usize,
    pub trimmed_idle: usize,
}

// ---------------------------------------------------------------------------
// Pool state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PoolState {
    environments: BTreeMap<String, ManagedEnvironment>,
    available: BTreeSet<String>,
    /// Environment id -> time it entered the failed set.
    failed: BTreeMap<String, u64>,
    repairing: HashSet<String>,
    stats: PoolStats,
}

impl PoolState {
    fn try_allocate(
        &mut self,
        req: &HardwareRequirements,
        test_id: &str,
        now: u64,
    ) -> Option<String> {
        let candidates = self
            .available
            .iter()
            .filter_map(|id| self.environments.get(id))
            .filter(|e| e.status == EnvironmentStatus::Available && e.health != HealthState::Unhealthy);
        let id = best_fit(candidates, req)?.id.clone();

        self.available.remove(&id);
        let env = self.environments.get_mut(&id)?;
        env.status = EnvironmentStatus::Busy;
        env.current_test_id = Some(test_id.to_string());
        env.allocated_at_ms = Some(now);
        env.last_used_ms = now;
        env.total_tests_run += 1;
        env.resource_usage = Some(ResourceUsage {
            cpu_cores: req.min_cpu_cores,
            memory_mb: req.min_memory_mb,
        });
        self.stats.allocations += 1;
        Some(id)
    }

    /// Move an environment into the failed set. Returns whether it was
    /// assigned to a test at the time.
    fn fail(&mut self, env_id: &str, now: u64) -> Option<bool> {
        let env = self.environments.get_mut(env_id)?;
        env.status = EnvironmentStatus::Error;
        env.health = HealthState::Unhealthy;
        env.failure_count += 1;
        env.failed_at_ms = Some(now);
        let busy = env.current_test_id.is_some();
        self.available.remove(env_id);
        self.failed.insert(env_id.to_string(), now);
        Some(busy)
    }

    fn mark_available(&mut self, env_id: &str, now: u64) {
        if let Some(env) = self.environments.get_mut(env_id) {
            env.status = EnvironmentStatus::Available;
            env.health = HealthState::Healthy;
            env.current_test_id = None;
            env.resource_usage = None;
            env.allocated_at_ms = None;
            env.failed_at_ms = None;
            env.last_used_ms = now;
            self.failed.remove(env_id);
            self.available.insert(env_id.to_string());
        }
    }

    fn remove(&mut self, env_id: &str) -> Option<ManagedEnvironment> {
        self.available.remove(env_id);
        self.failed.remove(env_id);
        self.repairing.remove(env_id);
        self.environments.remove(env_id)
    }
}

/// A failed environment reserved for one repair.
#[derive(Debug, Clone)]
struct Claim {
    env_id: String,
    env_type: EnvironmentType,
    hardware_config: HardwareConfig,
    failure_count: u32,
}

enum ClaimOutcome {
    Claimed(Claim),
    Missing,
    NotFailed,
}

fn new_environment_id(env_type: EnvironmentType) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}", env_type, &uuid[..8])
}

// ---------------------------------------------------------------------------
// ResourceManager
// ---------------------------------------------------------------------------

pub struct ResourceManager {
    config: ResourceConfig,
    provisioners: ProvisionerRegistry,
    errors: Option<Arc<ErrorRecoveryManager>>,
    state: Mutex<PoolState>,
    workers: Mutex<Option<WorkerSet>>,
    repairs: Mutex<Vec<Worker>>,
}

impl ResourceManager {
    pub fn new(config: ResourceConfig, provisioners: ProvisionerRegistry) -> Self {
        ResourceManager {
            config,
            provisioners,
            errors: None,
            state: Mutex::new(PoolState::default()),
            workers: Mutex::new(None),
            repairs: Mutex::new(Vec::new()),
        }
    }

    /// Report environment failures to `errors`.
    pub fn with_error_reporter(mut self, errors: Arc<ErrorRecoveryManager>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    fn report(&self, report: ErrorReport) {
        if let Some(errors) = &self.errors {
            errors.report_error(report);
        }
    }

    // -- allocation ---------------------------------------------------------

    /// Allocate an environment satisfying `req` to `test_id`.
    ///
    /// With no match in the pool and capacity left, a new environment is
    /// provisioned synchronously (outside the pool lock) and allocation is
    /// retried once. `None` tells the caller to back off and try later.
    pub fn allocate_environment(&self, req: &HardwareRequirements, test_id: &str) -> Option<String> {
        let env_type = environment_type_for(req);
        let provisioner = self.provisioners.get(env_type);

        let (env_id, hardware) = {
            let mut state = self.state.lock();
            if let Some(id) = state.try_allocate(req, test_id, now_ms()) {
                info!(env_id = %id, test_id, "environment allocated");
                return Some(id);
            }
            let Some(provisioner) = &provisioner else {
                debug!(test_id, env_type = %env_type, "no provisioner for environment type");
                return None;
            };
            if !provisioner.can_provision_on_demand() {
                debug!(test_id, env_type = %env_type, "no matching environment; type is seed-only");
                return None;
            }
            if state.environments.len() >= self.config.max_environments {
                debug!(
                    test_id,
                    max_environments = self.config.max_environments,
                    "no matching environment; pool at capacity"
                );
                return None;
            }
            let env_id = new_environment_id(env_type);
            let hardware = hardware_config_for(req);
            state.environments.insert(
                env_id.clone(),
                ManagedEnvironment::provisioning(&env_id, env_type, hardware.clone(), now_ms()),
            );
            (env_id, hardware)
        };

        let provisioner = provisioner?;
        info!(env_id = %env_id, env_type = %env_type, test_id, "provisioning environment on demand");
        match provisioner.provision(&env_id, &hardware) {
            Ok(()) => {
                let mut state = self.state.lock();
                state.stats.provisioned += 1;
                state.mark_available(&env_id, now_ms());
                let allocated = state.try_allocate(req, test_id, now_ms());
                drop(state);
                if let Some(id) = &allocated {
                    info!(env_id = %id, test_id, "environment allocated");
                }
                allocated
            }
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.remove(&env_id);
                    state.stats.provision_failures += 1;
                }
                warn!(env_id = %env_id, error = %e, "on-demand provisioning failed");
                self.report(
                    ErrorReport::new(
                        ErrorCategory::EnvironmentFailure,
                        ErrorSeverity::Medium,
                        COMPONENT,
                        format!("provisioning failed: {}", e),
                    )
                    .test(test_id)
                    .detail("env_type", env_type),
                );
                None
            }
        }
    }

    /// Return an environment to the pool after running its cleanup.
    ///
    /// Releasing an environment that is not busy is a no-op. A failed cleanup
    /// moves the environment to the failed set instead of back into service.
    pub fn release_environment(self: &Arc<Self>, env_id: &str) -> Result<()> {
        let env_type = {
            let mut state = self.state.lock();
            let is_failed = state.failed.contains_key(env_id);
            let env = state
                .environments
                .get_mut(env_id)
                .ok_or_else(|| OrchestratorError::EnvironmentNotFound(env_id.to_string()))?;
            if is_failed {
                env.current_test_id = None;
                env.resource_usage = None;
                env.allocated_at_ms = None;
                drop(state);
                debug!(env_id, "released failed environment; scheduling repair");
                self.schedule_repair(env_id);
                return Ok(());
            }
            if env.status != EnvironmentStatus::Busy {
                debug!(env_id, status = ?env.status, "release of idle environment ignored");
                return Ok(());
            }
            env.status = EnvironmentStatus::Cleanup;
            env.env_type
        };

        let outcome = match self.provisioners.get(env_type) {
            Some(p) => p.cleanup(env_id),
            None => Err(OrchestratorError::Cleanup {
                env_id: env_id.to_string(),
                reason: format!("no provisioner for {}", env_type),
            }),
        };

        let now = now_ms();
        match outcome {
            Ok(()) => {
                let mut state = self.state.lock();
                state.mark_available(env_id, now);
                state.stats.releases += 1;
                drop(state);
                info!(env_id, "environment released");
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.fail(env_id, now);
                    if let Some(env) = state.environments.get_mut(env_id) {
                        env.current_test_id = None;
                        env.resource_usage = None;
                    }
                    state.stats.cleanup_failures += 1;
                }
                warn!(env_id, error = %e, "cleanup failed; environment removed from service");
                self.report(
                    ErrorReport::new(
                        ErrorCategory::EnvironmentFailure,
                        ErrorSeverity::High,
                        COMPONENT,
                        format!("cleanup failed: {}", e),
                    )
                    .environment(env_id),
                );
                Err(OrchestratorError::Cleanup {
                    env_id: env_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Pull an environment out of service, e.g. after it broke mid-test.
    /// An idle environment is scheduled for repair right away; a busy one
    /// when its test releases it.
    pub fn mark_environment_failed(self: &Arc<Self>, env_id: &str, reason: &str) -> Result<()> {
        let busy = self
            .state
            .lock()
            .fail(env_id, now_ms())
            .ok_or_else(|| OrchestratorError::EnvironmentNotFound(env_id.to_string()))?;
        warn!(env_id, reason, "environment marked failed");
        self.report(
            ErrorReport::new(
                ErrorCategory::EnvironmentFailure,
                ErrorSeverity::High,
                COMPONENT,
                reason.to_string(),
            )
            .environment(env_id),
        );
        if !busy {
            self.schedule_repair(env_id);
        }
        Ok(())
    }

    // -- health -------------------------------------------------------------

    pub fn run_health_checks(self: &Arc<Self>) -> Vec<HealthAssessment> {
        self.run_health_checks_at(now_ms())
    }

    /// Assess every in-service environment. Policy checks come first; only
    /// environments that pass them are probed.
    pub fn run_health_checks_at(self: &Arc<Self>, now: u64) -> Vec<HealthAssessment> {
        let candidates: Vec<ManagedEnvironment> = {
            let state = self.state.lock();
            state
                .environments
                .values()
                .filter(|e| matches!(e.status, EnvironmentStatus::Available | EnvironmentStatus::Busy))
                .filter(|e| !state.failed.contains_key(&e.id) && !state.repairing.contains(&e.id))
                .cloned()
                .collect()
        };

        let mut assessments = Vec::with_capacity(candidates.len());
        for env in candidates {
            let mut signals = policy_signals(&env, &self.config, now);
            if signals.is_empty() {
                match self.provisioners.get(env.env_type) {
                    Some(p) => signals.push(probe_signal(p.health_probe(&env.id), &env.id)),
                    None => continue,
                }
            }
            let assessment = assess(&env.id, &signals, &self.config, now);
            self.apply_assessment(&assessment);
            assessments.push(assessment);
        }
        assessments
    }

    fn apply_assessment(self: &Arc<Self>, assessment: &HealthAssessment) {
        let env_id = assessment.environment_id.as_str();
        let now = assessment.timestamp_ms;
        let pulled = {
            let mut state = self.state.lock();
            if state.failed.contains_key(env_id) {
                return;
            }
            let Some(env) = state.environments.get_mut(env_id) else {
                return;
            };
            if !matches!(env.status, EnvironmentStatus::Available | EnvironmentStatus::Busy) {
                return;
            }
            if env.health != assessment.overall {
                debug!(env_id, from = ?env.health, to = ?assessment.overall, "environment health changed");
            }
            env.health = assessment.overall;
            env.last_health_check_ms = Some(now);
            if assessment.overall == HealthState::Unhealthy {
                state.fail(env_id, now)
            } else {
                None
            }
        };

        let Some(busy) = pulled else {
            return;
        };
        warn!(env_id, reason = %assessment.reason, busy, "environment unhealthy; pulled from pool");
        self.report(
            ErrorReport::new(
                ErrorCategory::EnvironmentFailure,
                ErrorSeverity::High,
                COMPONENT,
                format!("health check failed: {}", assessment.reason),
            )
            .environment(env_id),
        );
        if !busy {
            self.schedule_repair(env_id);
        }
    }

    // -- repair -------------------------------------------------------------

    fn claim(&self, env_id: &str) -> Result<ClaimOutcome> {
        let mut state = self.state.lock();
        if !state.environments.contains_key(env_id) {
            return Ok(ClaimOutcome::Missing);
        }
        if !state.failed.contains_key(env_id) {
            return Ok(ClaimOutcome::NotFailed);
        }
        if state.repairing.contains(env_id) {
            return Err(OrchestratorError::Execution(format!(
                "repair of '{}' already in progress",
                env_id
            )));
        }
        let env = state
            .environments
            .get_mut(env_id)
            .ok_or_else(|| OrchestratorError::EnvironmentNotFound(env_id.to_string()))?;
        if let Some(test_id) = &env.current_test_id {
            return Err(OrchestratorError::Execution(format!(
                "environment '{}' is still assigned to test '{}'",
                env_id, test_id
            )));
        }
        env.status = EnvironmentStatus::Maintenance;
        let claim = Claim {
            env_id: env_id.to_string(),
            env_type: env.env_type,
            hardware_config: env.hardware_config.clone(),
            failure_count: env.failure_count,
        };
        state.repairing.insert(env_id.to_string());
        Ok(ClaimOutcome::Claimed(claim))
    }

    /// Recover or replace a failed environment on a worker thread.
    fn schedule_repair(self: &Arc<Self>, env_id: &str) {
        let claim = match self.claim(env_id) {
            Ok(ClaimOutcome::Claimed(claim)) => claim,
            Ok(_) => return,
            Err(e) => {
                debug!(env_id, error = %e, "repair not scheduled");
                return;
            }
        };
        let replace = claim.failure_count >= self.config.replace_after_failures
            && self
                .provisioners
                .get(claim.env_type)
                .map(|p| p.can_provision_on_demand())
                .unwrap_or(false);

        let manager = Arc::clone(self);
        let name = format!("env-repair-{}", env_id);
        let spawned = Worker::spawn(&name, move || {
            let id = claim.env_id.clone();
            let result = if replace {
                manager.replace_claimed(claim).map(|_| ())
            } else {
                manager.recover_claimed(claim)
            };
            if let Err(e) = result {
                warn!(env_id = %id, error = %e, "environment repair failed");
            }
        });
        match spawned {
            Ok(worker) => {
                let mut repairs = self.repairs.lock();
                repairs.retain(|w| !w.is_finished());
                repairs.push(worker);
            }
            Err(e) => {
                warn!(env_id, error = %e, "could not spawn repair worker");
                let mut state = self.state.lock();
                state.repairing.remove(env_id);
                if let Some(env) = state.environments.get_mut(env_id) {
                    env.status = EnvironmentStatus::Error;
                }
            }
        }
    }

    /// Cleanup and re-provision a failed environment in place.
    ///
    /// Environments that are not failed (or no longer exist) need nothing
    /// and return `Ok`. Fails if the environment is still assigned to a test
    /// or another repair holds it.
    pub fn recover_environment(&self, env_id: &str) -> Result<()> {
        match self.claim(env_id)? {
            ClaimOutcome::Claimed(claim) => self.recover_claimed(claim),
            ClaimOutcome::Missing | ClaimOutcome::NotFailed => Ok(()),
        }
    }

    fn recover_claimed(&self, claim: Claim) -> Result<()> {
        let env_id = claim.env_id.as_str();
        info!(env_id, failures = claim.failure_count, "recovering environment");
        let result = match self.provisioners.get(claim.env_type) {
            Some(p) => p
                .cleanup(env_id)
                .and_then(|_| p.provision(env_id, &claim.hardware_config)),
            None => Err(OrchestratorError::Provisioning {
                env_type: claim.env_type.to_string(),
                env_id: env_id.to_string(),
                reason: "no provisioner registered".into(),
            }),
        };

        let now = now_ms();
        let mut state = self.state.lock();
        state.repairing.remove(env_id);
        match result {
            Ok(()) => {
                state.mark_available(env_id, now);
                state.stats.recoveries += 1;
                drop(state);
                info!(env_id, "environment recovered");
                Ok(())
            }
            Err(e) => {
                if let Some(env) = state.environments.get_mut(env_id) {
                    env.status = EnvironmentStatus::Error;
                    env.failure_count += 1;
                }
                drop(state);
                Err(e)
            }
        }
    }

    /// Replace a failed environment with a fresh one of the same hardware.
    /// Returns the new environment's id.
    pub fn replace_environment(&self, env_id: &str) -> Result<String> {
        match self.claim(env_id)? {
            ClaimOutcome::Claimed(claim) => self.replace_claimed(claim),
            ClaimOutcome::Missing => Err(OrchestratorError::EnvironmentNotFound(env_id.to_string())),
            ClaimOutcome::NotFailed => Err(OrchestratorError::Execution(format!(
                "environment '{}' is not failed",
                env_id
            ))),
        }
    }

    fn replace_claimed(&self, claim: Claim) -> Result<String> {
        let old_id = claim.env_id.as_str();
        let Some(provisioner) = self.provisioners.get(claim.env_type) else {
            self.state.lock().repairing.remove(old_id);
            return Err(OrchestratorError::Provisioning {
                env_type: claim.env_type.to_string(),
                env_id: old_id.to_string(),
                reason: "no provisioner registered".into(),
            });
        };
        if !provisioner.can_provision_on_demand() {
            self.state.lock().repairing.remove(old_id);
            return Err(OrchestratorError::Provisioning {
                env_type: claim.env_type.to_string(),
                env_id: old_id.to_string(),
                reason: "environment type cannot be provisioned on demand".into(),
            });
        }

        if let Err(e) = provisioner.cleanup(old_id) {
            warn!(env_id = old_id, error = %e, "cleanup of replaced environment failed");
        }

        let new_id = new_environment_id(claim.env_type);
        {
            let mut state = self.state.lock();
            state.remove(old_id);
            state.stats.removed += 1;
            state.environments.insert(
                new_id.clone(),
                ManagedEnvironment::provisioning(
                    &new_id,
                    claim.env_type,
                    claim.hardware_config.clone(),
                    now_ms(),
                ),
            );
        }
        info!(old_env_id = old_id, new_env_id = %new_id, "replacing environment");

        match provisioner.provision(&new_id, &claim.hardware_config) {
            Ok(()) => {
                let mut state = self.state.lock();
                state.mark_available(&new_id, now_ms());
                state.stats.provisioned += 1;
                state.stats.replacements += 1;
                Ok(new_id)
            }
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.remove(&new_id);
                    state.stats.provision_failures += 1;
                }
                self.report(
                    ErrorReport::new(
                        ErrorCategory::EnvironmentFailure,
                        ErrorSeverity::High,
                        COMPONENT,
                        format!("replacement provisioning failed: {}", e),
                    )
                    .detail("replaced", old_id),
                );
                Err(e)
            }
        }
    }

    // -- cleanup ------------------------------------------------------------

    pub fn cleanup_idle_environments(&self) -> CleanupReport {
        self.cleanup_idle_environments_at(now_ms())
    }

    /// Drop environments failed longer than the retention period, then trim
    /// the longest-idle available environments down to the pool floor.
    /// Seed-only environment types are never trimmed.
    pub fn cleanup_idle_environments_at(&self, now: u64) -> CleanupReport {
        let mut report = CleanupReport::default();
        let trimmed: Vec<(String, EnvironmentType)> = {
            let mut state = self.state.lock();
            let expired: Vec<String> = state
                .failed
                .iter()
                .filter(|(id, at)| {
                    now.saturating_sub(**at) >= self.config.failed_retention_ms
                        && !state.repairing.contains(*id)
                        && state
                            .environments
                            .get(*id)
                            .map(|e| e.current_test_id.is_none())
                            .unwrap_or(true)
                })
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                state.remove(id);
                state.stats.removed += 1;
                info!(env_id = %id, "removed long-failed environment");
            }
            report.removed_failed = expired.len();

            let floor = self.config.pool_floor();
            let mut idle: Vec<(u64, String, EnvironmentType)> = state
                .available
                .iter()
                .filter_map(|id| state.environments.get(id))
                .filter(|e| now.saturating_sub(e.last_used_ms) >= self.config.idle_timeout_ms)
                .filter(|e| {
                    self.provisioners
                        .get(e.env_type)
                        .map(|p| p.can_provision_on_demand())
                        .unwrap_or(false)
                })
                .map(|e| (e.last_used_ms, e.id.clone(), e.env_type))
                .collect();
            idle.sort();

            let mut remaining = state.available.len();
            let mut trimmed = Vec::new();
            for (_, id, env_type) in idle {
                if remaining <= floor {
                    break;
                }
                state.remove(&id);
                state.stats.removed += 1;
                remaining -= 1;
                trimmed.push((id, env_type));
            }
            trimmed
        };

        report.trimmed_idle = trimmed.len();
        for (id, env_type) in trimmed {
            info!(env_id = %id, "trimmed idle environment");
            if let Some(p) = self.provisioners.get(env_type) {
                if let Err(e) = p.cleanup(&id) {
                    warn!(env_id = %id, error = %e, "cleanup of trimmed environment failed");
                }
            }
        }
        report
    }

    // -- pool seeding -------------------------------------------------------

    /// Provision the configured initial pool. Seed ids are `<type>-<NN>`,
    /// numbered per type across seeds; ids already in the pool are skipped.
    /// Returns how many environments became available.
    pub fn initialize_pool(&self) -> usize {
        let mut pending: Vec<(String, EnvironmentType, HardwareConfig)> = Vec::new();
        {
            let mut state = self.state.lock();
            let mut numbers: BTreeMap<EnvironmentType, usize> = BTreeMap::new();
            for seed in &self.config.initial_pool {
                for _ in 0..seed.count {
                    let n = numbers.entry(seed.env_type).or_insert(0);
                    *n += 1;
                    let id = format!("{}-{:02}", seed.env_type, n);
                    if state.environments.contains_key(&id) {
                        continue;
                    }
                    if state.environments.len() >= self.config.max_environments {
                        warn!(
                            max_environments = self.config.max_environments,
                            "initial pool exceeds capacity; remaining seeds skipped"
                        );
                        break;
                    }
                    state.environments.insert(
                        id.clone(),
                        ManagedEnvironment::provisioning(
                            &id,
                            seed.env_type,
                            seed.hardware_config.clone(),
                            now_ms(),
                        ),
                    );
                    pending.push((id, seed.env_type, seed.hardware_config.clone()));
                }
            }
        }

        let mut ready = 0;
        for (id, env_type, hardware) in pending {
            let result = match self.provisioners.get(env_type) {
                Some(p) => p.provision(&id, &hardware),
                None => Err(OrchestratorError::Provisioning {
                    env_type: env_type.to_string(),
                    env_id: id.clone(),
                    reason: "no provisioner registered".into(),
                }),
            };
            let mut state = self.state.lock();
            match result {
                Ok(()) => {
                    state.mark_available(&id, now_ms());
                    state.stats.provisioned += 1;
                    ready += 1;
                }
                Err(e) => {
                    state.remove(&id);
                    state.stats.provision_failures += 1;
                    drop(state);
                    warn!(env_id = %id, error = %e, "seed provisioning failed");
                    self.report(
                        ErrorReport::new(
                            ErrorCategory::EnvironmentFailure,
                            ErrorSeverity::Medium,
                            COMPONENT,
                            format!("seed provisioning failed: {}", e),
                        )
                        .detail("env_id", &id),
                    );
                }
            }
        }
        if ready > 0 {
            info!(ready, "environment pool initialized");
        }
        ready
    }

    // -- queries ------------------------------------------------------------

    pub fn get_environment(&self, env_id: &str) -> Option<ManagedEnvironment> {
        self.state.lock().environments.get(env_id).cloned()
    }

    pub fn list_environments(&self) -> Vec<ManagedEnvironment> {
        self.state.lock().environments.values().cloned().collect()
    }

    pub fn available_count(&self) -> usize {
        self.state.lock().available.len()
    }

    pub fn failed_count(&self) -> usize {
        self.state.lock().failed.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    pub fn get_resource_utilization(&self) -> ResourceUtilization {
        let state = self.state.lock();
        let mut u = ResourceUtilization {
            total_environments: state.environments.len(),
            available_environments: state.available.len(),
            busy_environments: 0,
            provisioning_environments: 0,
            failed_environments: state.failed.len(),
            max_environments: self.config.max_environments,
            pool_floor: self.config.pool_floor(),
            by_type: BTreeMap::new(),
            total_memory_mb: 0,
            allocated_memory_mb: 0,
            memory_utilization: 0.0,
            total_cpu_cores: 0,
            allocated_cpu_cores: 0,
            cpu_utilization: 0.0,
            stats: state.stats,
        };
        for env in state.environments.values() {
            *u.by_type.entry(env.env_type).or_insert(0) += 1;
            match env.status {
                EnvironmentStatus::Busy => u.busy_environments += 1,
                EnvironmentStatus::Provisioning => u.provisioning_environments += 1,
                _ => {}
            }
            if state.failed.contains_key(&env.id) {
                continue;
            }
            u.total_memory_mb += env.hardware_config.memory_mb;
            u.total_cpu_cores += env.hardware_config.cpu_cores as u64;
            if env.is_busy() {
                u.allocated_memory_mb += env.hardware_config.memory_mb;
                u.allocated_cpu_cores += env.hardware_config.cpu_cores as u64;
            }
        }
        if u.total_memory_mb > 0 {
            u.memory_utilization = u.allocated_memory_mb as f64 / u.total_memory_mb as f64;
        }
        if u.total_cpu_cores > 0 {
            u.cpu_utilization = u.allocated_cpu_cores as f64 / u.total_cpu_cores as f64;
        }
        u
    }

    // -- lifecycle ----------------------------------------------------------

    /// Seed the pool and start the health-check and cleanup loops.
    pub fn start(self: &Arc<Self>) -> std::io::Result<bool> {
        let mut workers = self.workers.lock();
        if workers.is_some() {
            return Ok(false);
        }
        self.initialize_pool();

        let mut set = WorkerSet::new();
        let weak: Weak<ResourceManager> = Arc::downgrade(self);
        set.push(Worker::spawn_periodic(
            "resource-health",
            set.shutdown(),
            Duration::from_millis(self.config.health_check_interval_ms),
            move || {
                if let Some(manager) = weak.upgrade() {
                    manager.run_health_checks();
                }
            },
        )?);
        let weak: Weak<ResourceManager> = Arc::downgrade(self);
        set.push(Worker::spawn_periodic(
            "resource-cleanup",
            set.shutdown(),
            Duration::from_millis(self.config.cleanup_interval_ms),
            move || {
                if let Some(manager) = weak.upgrade() {
                    manager.cleanup_idle_environments();
                }
            },
        )?);
        *workers = Some(set);
        info!("resource manager started");
        Ok(true)
    }

    /// Stop the loops and wait for in-flight repairs. Returns whether the
    /// manager was running.
    pub fn stop(&self, timeout: Duration) -> bool {
        let set = self.workers.lock().take();
        let was_running = set.is_some();
        if let Some(set) = set {
            set.stop(timeout);
        }
        let repairs: Vec<Worker> = std::mem::take(&mut *self.repairs.lock());
        join_all(repairs, timeout);
        if was_running {
            info!("resource manager stopped");
        }
        was_running
    }

    pub fn is_running(&self) -> bool {
        self.workers.lock().is_some()
    }

    pub fn health(&self) -> ComponentHealth {
        let running = self.is_running();
        let u = self.get_resource_utilization();
        let status = if !running {
            ServiceState::Stopped
        } else if u.failed_environments > 0 {
            ServiceState::Degraded
        } else {
            ServiceState::Healthy
        };
        ComponentHealth::new(status)
            .detail("total_environments", u.total_environments)
            .detail("available_environments", u.available_environments)
            .detail("busy_environments", u.busy_environments)
            .detail("failed_environments", u.failed_environments)
            .detail("max_environments", u.max_environments)
            .detail("memory_utilization", u.memory_utilization)
            .detail("cpu_utilization", u.cpu_utilization)
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("config", &self.config)
            .field("provisioners", &self.provisioners)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::SimulatedProvisioner;
    use crate::types::config::{ErrorRecoveryConfig, PoolSeed};
    use crate::types::Peripheral;
    use std::thread;

    const HOUR: u64 = 3_600_000;

    fn seeded(count: usize) -> ResourceConfig {
        ResourceConfig {
            initial_pool: vec![PoolSeed {
                env_type: EnvironmentType::Docker,
                count,
                hardware_config: HardwareConfig::default(),
            }],
            ..ResourceConfig::default()
        }
    }

    fn setup(config: ResourceConfig) -> (Arc<ResourceManager>, Arc<SimulatedProvisioner>) {
        let sim = Arc::new(SimulatedProvisioner::new(EnvironmentType::Docker));
        let mut registry = ProvisionerRegistry::new();
        registry.register(sim.clone());
        (Arc::new(ResourceManager::new(config, registry)), sim)
    }

    fn req() -> HardwareRequirements {
        HardwareRequirements::default()
    }

    #[test]
    fn release_then_reallocate_returns_same_environment() {
        let (m, _sim) = setup(seeded(1));
        assert_eq!(m.initialize_pool(), 1);
        let id = m.allocate_environment(&req(), "t1").unwrap();
        assert_eq!(id, "docker-01");
        let env = m.get_environment(&id).unwrap();
        assert_eq!(env.status, EnvironmentStatus::Busy);
        assert_eq!(env.current_test_id.as_deref(), Some("t1"));
        assert!(env.resource_usage.is_some());

        m.release_environment(&id).unwrap();
        let env = m.get_environment(&id).unwrap();
        assert_eq!(env.status, EnvironmentStatus::Available);
        assert!(env.current_test_id.is_none());
        assert!(env.resource_usage.is_none());

        assert_eq!(m.allocate_environment(&req(), "t2").unwrap(), id);
    }

    #[test]
    fn releasing_idle_environment_is_noop() {
        let (m, sim) = setup(seeded(1));
        m.initialize_pool();
        m.release_environment("docker-01").unwrap();
        assert!(!sim.ops().contains(&crate::infrastructure::ProvisionOp::Cleanup("docker-01".into())));
        assert!(matches!(
            m.release_environment("ghost"),
            Err(OrchestratorError::EnvironmentNotFound(_))
        ));
    }

    #[test]
    fn allocation_respects_requirements() {
        let mut config = seeded(1);
        config.initial_pool.push(PoolSeed {
            env_type: EnvironmentType::Docker,
            count: 1,
            hardware_config: HardwareConfig {
                memory_mb: 8192,
                peripherals: vec![Peripheral::new("gpu")],
                ..HardwareConfig::default()
            },
        });
        config.max_environments = 2;
        let (m, _sim) = setup(config);
        assert_eq!(m.initialize_pool(), 2);

        let gpu = HardwareRequirements {
            min_memory_mb: 4096,
            required_peripherals: vec!["gpu".into()],
            ..req()
        };
        let id = m.allocate_environment(&gpu, "t1").unwrap();
        assert_eq!(id, "docker-02");
        let env = m.get_environment(&id).unwrap();
        assert!(env.hardware_config.memory_mb >= gpu.min_memory_mb);
        assert!(env.hardware_config.peripheral_types().contains("gpu"));

        // Pool is full and nothing else has a gpu.
        assert!(m.allocate_environment(&gpu, "t2").is_none());
    }

    #[test]
    fn provisions_on_demand_up_to_capacity() {
        let config = ResourceConfig {
            max_environments: 1,
            ..ResourceConfig::default()
        };
        let (m, sim) = setup(config);
        let id = m.allocate_environment(&req(), "t1").unwrap();
        assert!(id.starts_with("docker-"));
        assert_eq!(sim.provision_count(), 1);
        assert_eq!(m.stats().provisioned, 1);
        assert!(m.allocate_environment(&req(), "t2").is_none());
        assert_eq!(sim.provision_count(), 1);
    }

    #[test]
    fn provisioning_failure_is_reported_and_rolled_back() {
        let errors = Arc::new(ErrorRecoveryManager::new(ErrorRecoveryConfig::default()));
        let sim = Arc::new(SimulatedProvisioner::new(EnvironmentType::Docker));
        let mut registry = ProvisionerRegistry::new();
        registry.register(sim.clone());
        let m = ResourceManager::new(ResourceConfig::default(), registry)
            .with_error_reporter(errors.clone());
        sim.set_fail_provision(true);
        assert!(m.allocate_environment(&req(), "t1").is_none());
        assert!(m.list_environments().is_empty());
        assert_eq!(errors.unresolved_count(), 1);
        assert_eq!(m.stats().provision_failures, 1);
    }

    #[test]
    fn physical_boards_come_only_from_seed() {
        let m = Arc::new(ResourceManager::new(
            ResourceConfig::default(),
            ProvisionerRegistry::simulated(),
        ));
        let board = HardwareRequirements {
            is_virtual: false,
            ..req()
        };
        assert!(m.allocate_environment(&board, "t1").is_none());
        assert!(m.list_environments().is_empty());
    }

    #[test]
    fn at_most_one_allocation_per_environment() {
        let mut config = seeded(3);
        config.max_environments = 3;
        let (m, _sim) = setup(config);
        m.initialize_pool();
        let held = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let m = Arc::clone(&m);
                let held = Arc::clone(&held);
                thread::spawn(move || {
                    for i in 0..50 {
                        let test_id = format!("t{}-{}", t, i);
                        if let Some(id) = m.allocate_environment(&req(), &test_id) {
                            assert!(held.lock().insert(id.clone()), "{} double-allocated", id);
                            thread::yield_now();
                            held.lock().remove(&id);
                            m.release_environment(&id).unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.available_count(), 3);
        assert_eq!(m.list_environments().len(), 3);
    }

    #[test]
    fn cleanup_failure_takes_environment_out_of_service() {
        let (m, sim) = setup(seeded(1));
        m.initialize_pool();
        let id = m.allocate_environment(&req(), "t1").unwrap();
        sim.set_fail_cleanup(&id, true);
        assert!(matches!(
            m.release_environment(&id),
            Err(OrchestratorError::Cleanup { .. })
        ));
        let env = m.get_environment(&id).unwrap();
        assert_eq!(env.status, EnvironmentStatus::Error);
        assert_eq!(env.failure_count, 1);
        assert_eq!(m.failed_count(), 1);
        assert!(m.allocate_environment(&req(), "t2").is_some_and(|other| other != id));

        sim.set_fail_cleanup(&id, false);
        m.recover_environment(&id).unwrap();
        assert_eq!(m.get_environment(&id).unwrap().status, EnvironmentStatus::Available);
        assert_eq!(m.failed_count(), 0);
        // Nothing left to do.
        m.recover_environment(&id).unwrap();
        assert_eq!(m.stats().recoveries, 1);
    }

    #[test]
    fn unhealthy_probe_pulls_and_recovers() {
        let (m, sim) = setup(seeded(2));
        m.initialize_pool();
        sim.set_probe("docker-01", HealthState::Unhealthy);

        let assessments = m.run_health_checks();
        assert_eq!(assessments.len(), 2);
        assert_eq!(m.get_environment("docker-01").unwrap().failure_count, 1);

        // Joins the repair worker.
        m.stop(Duration::from_secs(5));
        let env = m.get_environment("docker-01").unwrap();
        assert_eq!(env.status, EnvironmentStatus::Available);
        assert_eq!(env.health, HealthState::Healthy);
        assert_eq!(m.stats().recoveries, 1);
    }

    #[test]
    fn repeated_failures_trigger_replacement() {
        let mut config = seeded(1);
        config.replace_after_failures = 1;
        let (m, sim) = setup(config);
        m.initialize_pool();
        sim.set_probe("docker-01", HealthState::Unhealthy);
        m.run_health_checks();
        m.stop(Duration::from_secs(5));

        assert!(m.get_environment("docker-01").is_none());
        let envs = m.list_environments();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].status, EnvironmentStatus::Available);
        assert_eq!(envs[0].hardware_config, HardwareConfig::default());
        assert_eq!(m.stats().replacements, 1);
    }

    #[test]
    fn busy_environment_marked_failed_repairs_after_release() {
        let (m, _sim) = setup(seeded(1));
        m.initialize_pool();
        let id = m.allocate_environment(&req(), "t1").unwrap();
        m.mark_environment_failed(&id, "device disconnected").unwrap();
        assert_eq!(m.get_environment(&id).unwrap().status, EnvironmentStatus::Error);
        assert!(m.recover_environment(&id).is_err());

        m.release_environment(&id).unwrap();
        m.stop(Duration::from_secs(5));
        assert_eq!(m.get_environment(&id).unwrap().status, EnvironmentStatus::Available);
    }

    #[test]
    fn busy_too_long_degrades_without_pulling() {
        let (m, _sim) = setup(seeded(1));
        m.initialize_pool();
        let id = m.allocate_environment(&req(), "t1").unwrap();
        let later = now_ms() + 2 * HOUR;
        let a = m.run_health_checks_at(later);
        assert_eq!(a[0].overall, HealthState::Degraded);
        let env = m.get_environment(&id).unwrap();
        assert_eq!(env.health, HealthState::Degraded);
        assert_eq!(env.status, EnvironmentStatus::Busy);
    }

    #[test]
    fn cleanup_removes_stale_failed_and_trims_to_floor() {
        let mut config = seeded(5);
        config.min_pool_size = Some(2);
        let (m, sim) = setup(config);
        m.initialize_pool();
        let id = m.allocate_environment(&req(), "t1").unwrap();
        sim.set_fail_cleanup(&id, true);
        let _ = m.release_environment(&id);

        // Nothing is old enough yet.
        assert_eq!(m.cleanup_idle_environments(), CleanupReport::default());

        let report = m.cleanup_idle_environments_at(now_ms() + 2 * HOUR);
        assert_eq!(report.removed_failed, 1);
        assert_eq!(report.trimmed_idle, 2);
        assert_eq!(m.available_count(), 2);
        assert!(m.get_environment(&id).is_none());

        // Never below the floor.
        let again = m.cleanup_idle_environments_at(now_ms() + 4 * HOUR);
        assert_eq!(again.trimmed_idle, 0);
    }

    #[test]
    fn utilization_ratios() {
        let (m, _sim) = setup(seeded(4));
        m.initialize_pool();
        m.allocate_environment(&req(), "t1").unwrap();
        let u = m.get_resource_utilization();
        assert_eq!(u.total_environments, 4);
        assert_eq!(u.busy_environments, 1);
        assert_eq!(u.available_environments, 3);
        assert_eq!(u.by_type[&EnvironmentType::Docker], 4);
        assert!((u.memory_utilization - 0.25).abs() < 1e-9);
        assert!((u.cpu_utilization - 0.25).abs() < 1e-9);
        assert_eq!(u.stats.allocations, 1);
    }

    #[test]
    fn start_seeds_once_and_stop_is_bounded() {
        let (m, sim) = setup(seeded(2));
        assert_eq!(m.health().status, ServiceState::Stopped);
        assert!(m.start().unwrap());
        assert!(!m.start().unwrap());
        assert_eq!(sim.provision_count(), 2);
        assert_eq!(m.initialize_pool(), 0);
        assert_eq!(m.health().status, ServiceState::Healthy);
        assert_eq!(
            m.health().get("available_environments"),
            Some(&serde_json::json!(2))
        );
        assert!(m.stop(Duration::from_secs(5)));
        assert!(!m.stop(Duration::from_secs(1)));
    }
}
