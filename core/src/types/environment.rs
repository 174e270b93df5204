use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentType {
    Docker,
    Qemu,
    Physical,
    Container,
}

impl fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentType::Docker => write!(f, "docker"),
            EnvironmentType::Qemu => write!(f, "qemu"),
            EnvironmentType::Physical => write!(f, "physical"),
            EnvironmentType::Container => write!(f, "container"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Available,
    Busy,
    Provisioning,
    Error,
    Maintenance,
    Cleanup,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthState {
    /// Severity rank used for "worst wins" combination. Unknown ranks with Healthy.
    pub fn rank(self) -> u8 {
        match self {
            HealthState::Healthy | HealthState::Unknown => 0,
            HealthState::Degraded => 1,
            HealthState::Unhealthy => 2,
        }
    }

    pub fn worst(self, other: HealthState) -> HealthState {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }
}

/// Degree of isolation a test needs from its host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    Process,
    #[default]
    Container,
    Vm,
    Hardware,
}

/// A device attached to an environment (serial console, CAN bus, GPU...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peripheral {
    pub peripheral_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Peripheral {
    pub fn new(peripheral_type: &str) -> Self {
        Peripheral {
            peripheral_type: peripheral_type.to_string(),
            model: None,
        }
    }
}

/// The hardware an environment provides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardwareConfig {
    pub architecture: String,
    #[serde(default)]
    pub cpu_model: String,
    #[serde(default = "default_cores")]
    pub cpu_cores: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub storage_type: String,
    #[serde(default)]
    pub peripherals: Vec<Peripheral>,
    #[serde(default = "default_true")]
    pub is_virtual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emulator: Option<String>,
}

fn default_cores() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl HardwareConfig {
    pub fn peripheral_types(&self) -> BTreeSet<&str> {
        self.peripherals
            .iter()
            .map(|p| p.peripheral_type.as_str())
            .collect()
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        HardwareConfig {
            architecture: "x86_64".into(),
            cpu_model: "generic".into(),
            cpu_cores: 2,
            memory_mb: 2048,
            storage_type: "ssd".into(),
            peripherals: Vec::new(),
            is_virtual: true,
            emulator: None,
        }
    }
}

/// What a test needs from an environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HardwareRequirements {
    pub architecture: String,
    pub min_memory_mb: u64,
    pub min_cpu_cores: u32,
    /// Peripheral types that must all be present.
    pub required_peripherals: Vec<String>,
    pub isolation_level: IsolationLevel,
    pub is_virtual: bool,
    /// Exact emulator match, when set.
    pub emulator: Option<String>,
    pub preferred_environment_type: Option<EnvironmentType>,
}

impl Default for HardwareRequirements {
    fn default() -> Self {
        HardwareRequirements {
            architecture: "x86_64".into(),
            min_memory_mb: 512,
            min_cpu_cores: 1,
            required_peripherals: Vec::new(),
            isolation_level: IsolationLevel::Container,
            is_virtual: true,
            emulator: None,
            preferred_environment_type: None,
        }
    }
}

/// Point-in-time resource consumption reported for a busy environment.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceUsage {
    pub cpu_cores: u32,
    pub memory_mb: u64,
}

/// An allocatable execution resource, owned by the resource manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedEnvironment {
    pub id: String,
    pub env_type: EnvironmentType,
    pub status: EnvironmentStatus,
    pub hardware_config: HardwareConfig,
    pub health: HealthState,
    pub current_test_id: Option<String>,
    pub failure_count: u32,
    pub total_tests_run: u64,
    pub resource_usage: Option<ResourceUsage>,
    pub created_at_ms: u64,
    pub last_used_ms: u64,
    pub last_health_check_ms: Option<u64>,
    pub allocated_at_ms: Option<u64>,
    pub failed_at_ms: Option<u64>,
}

impl ManagedEnvironment {
    /// A freshly created environment in the `provisioning` state.
    pub fn provisioning(
        id: &str,
        env_type: EnvironmentType,
        hardware_config: HardwareConfig,
        now_ms: u64,
    ) -> Self {
        ManagedEnvironment {
            id: id.to_string(),
            env_type,
            status: EnvironmentStatus::Provisioning,
            hardware_config,
            health: HealthState::Unknown,
            current_test_id: None,
            failure_count: 0,
            total_tests_run: 0,
            resource_usage: None,
            created_at_ms: now_ms,
            last_used_ms: now_ms,
            last_health_check_ms: None,
            allocated_at_ms: None,
            failed_at_ms: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.status == EnvironmentStatus::Busy
    }
}
