//! Service-level health and metrics reports.
//!
//! Both are relays: every number comes from a component's own snapshot.
//! Top-level field names are the monitoring contract.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::queue::QueueStatus;
use crate::resource::ResourceUtilization;
use crate::status::TrackerMetrics;
use crate::types::{ComponentHealth, ServiceState};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceHealth {
    pub status: ServiceState,
    pub lifecycle: LifecycleState,
    pub degraded_mode: bool,
    pub uptime_ms: u64,
    pub active_tests: usize,
    pub queued_tests: usize,
    pub available_environments: usize,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl ServiceHealth {
    /// Roll component states up into one: stopped unless running, degraded
    /// if the error manager says so or any component is degraded.
    pub fn overall(
        lifecycle: LifecycleState,
        degraded_mode: bool,
        components: &BTreeMap<String, ComponentHealth>,
    ) -> ServiceState {
        if lifecycle != LifecycleState::Running {
            return ServiceState::Stopped;
        }
        let any_degraded = components
            .values()
            .any(|c| c.status == ServiceState::Degraded);
        if degraded_mode || any_degraded {
            ServiceState::Degraded
        } else {
            ServiceState::Healthy
        }
    }
}

/// Counters kept by the service itself.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceCounters {
    pub plans_started: u64,
    pub plans_finished: u64,
    pub tests_dispatched: u64,
    pub allocation_failures: u64,
    pub loop_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutMetrics {
    pub active_monitors: usize,
    pub timeouts_fired: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    pub timestamp_ms: u64,
    pub active_tests: usize,
    pub queued_tests: usize,
    pub queued_plans: usize,
    pub available_environments: usize,
    pub degraded_mode: bool,
    pub unresolved_errors: usize,
    pub service: ServiceCounters,
    pub status: TrackerMetrics,
    pub queue: QueueStatus,
    pub resources: ResourceUtilization,
    pub timeouts: TimeoutMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn components(states: &[ServiceState]) -> BTreeMap<String, ComponentHealth> {
        states
            .iter()
            .enumerate()
            .map(|(i, s)| (format!("c{}", i), ComponentHealth::new(*s)))
            .collect()
    }

    #[test]
    fn rollup() {
        let healthy = components(&[ServiceState::Healthy, ServiceState::Healthy]);
        let mixed = components(&[ServiceState::Healthy, ServiceState::Degraded]);
        assert_eq!(
            ServiceHealth::overall(LifecycleState::Running, false, &healthy),
            ServiceState::Healthy
        );
        assert_eq!(
            ServiceHealth::overall(LifecycleState::Running, true, &healthy),
            ServiceState::Degraded
        );
        assert_eq!(
            ServiceHealth::overall(LifecycleState::Running, false, &mixed),
            ServiceState::Degraded
        );
        assert_eq!(
            ServiceHealth::overall(LifecycleState::Stopping, true, &mixed),
            ServiceState::Stopped
        );
    }

    #[test]
    fn lifecycle_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&LifecycleState::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(LifecycleState::Stopping.to_string(), "stopping");
    }
}
