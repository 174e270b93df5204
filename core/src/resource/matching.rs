//! Matching hardware requirements against environment configurations.

use crate::types::{
    EnvironmentType, HardwareConfig, HardwareRequirements, IsolationLevel, ManagedEnvironment,
    Peripheral,
};

/// Whether `config` can host a test with `req`.
///
/// Architecture, virtualization and (when requested) emulator must match
/// exactly; memory and cores are minimums; peripherals must be a superset.
pub fn satisfies(config: &HardwareConfig, req: &HardwareRequirements) -> bool {
    if config.architecture != req.architecture
        || config.memory_mb < req.min_memory_mb
        || config.cpu_cores < req.min_cpu_cores
        || config.is_virtual != req.is_virtual
    {
        return false;
    }
    if let Some(emulator) = &req.emulator {
        if config.emulator.as_ref() != Some(emulator) {
            return false;
        }
    }
    let have = config.peripheral_types();
    req.required_peripherals
        .iter()
        .all(|p| have.contains(p.as_str()))
}

/// Pick the best satisfying environment: the preferred type first, then the
/// smallest memory surplus, then the lowest id.
pub fn best_fit<'a, I>(candidates: I, req: &HardwareRequirements) -> Option<&'a ManagedEnvironment>
where
    I: IntoIterator<Item = &'a ManagedEnvironment>,
{
    candidates
        .into_iter()
        .filter(|env| satisfies(&env.hardware_config, req))
        .min_by(|a, b| rank(a, req).cmp(&rank(b, req)).then_with(|| a.id.cmp(&b.id)))
}

fn rank(env: &ManagedEnvironment, req: &HardwareRequirements) -> (bool, u64) {
    let off_preference = req
        .preferred_environment_type
        .map(|t| t != env.env_type)
        .unwrap_or(false);
    let surplus = env.hardware_config.memory_mb - req.min_memory_mb;
    (off_preference, surplus)
}

/// The environment type to provision for a request with no matching
/// environment in the pool.
pub fn environment_type_for(req: &HardwareRequirements) -> EnvironmentType {
    if let Some(t) = req.preferred_environment_type {
        return t;
    }
    if !req.is_virtual {
        return EnvironmentType::Physical;
    }
    if req.emulator.is_some() {
        return EnvironmentType::Qemu;
    }
    match req.isolation_level {
        IsolationLevel::Vm => EnvironmentType::Qemu,
        IsolationLevel::Hardware => EnvironmentType::Physical,
        IsolationLevel::Process => EnvironmentType::Container,
        IsolationLevel::Container => EnvironmentType::Docker,
    }
}

/// The smallest hardware configuration that satisfies `req`.
pub fn hardware_config_for(req: &HardwareRequirements) -> HardwareConfig {
    HardwareConfig {
        architecture: req.architecture.clone(),
        cpu_model: "generic".into(),
        cpu_cores: req.min_cpu_cores.max(1),
        memory_mb: req.min_memory_mb,
        storage_type: "ssd".into(),
        peripherals: req
            .required_peripherals
            .iter()
            .map(|p| Peripheral::new(p))
            .collect(),
        is_virtual: req.is_virtual,
        emulator: req.emulator.clone(),
    }
}
