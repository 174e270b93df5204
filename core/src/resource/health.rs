//! Environment health assessment.
//!
//! Policy checks run first: held busy too long and repeated failures. Every
//! check that applies contributes a signal, and only an environment that
//! passes both is probed. The assessment takes the worst of the signals.

use crate::types::config::ResourceConfig;
use crate::types::health::{HealthAssessment, HealthSignal};
use crate::types::{HealthState, ManagedEnvironment};

/// The policy signals that apply to `env`. Empty means the environment
/// should be probed.
pub fn policy_signals(
    env: &ManagedEnvironment,
    config: &ResourceConfig,
    now_ms: u64,
) -> Vec<HealthSignal> {
    let mut signals = Vec::new();
    if env.is_busy() {
        let busy_ms = now_ms.saturating_sub(env.allocated_at_ms.unwrap_or(now_ms));
        if busy_ms > config.busy_degraded_after_ms {
            signals.push(HealthSignal::BusyTooLong { busy_ms });
        }
    }
    if env.failure_count >= config.degraded_failure_count {
        signals.push(HealthSignal::RepeatedFailures {
            count: env.failure_count,
        });
    }
    signals
}

/// Convert a provisioner probe result into a signal.
pub fn probe_signal(probe: HealthState, env_id: &str) -> HealthSignal {
    match probe {
        HealthState::Healthy | HealthState::Unknown => HealthSignal::ProbeHealthy,
        HealthState::Degraded => HealthSignal::ProbeDegraded,
        HealthState::Unhealthy => HealthSignal::ProbeUnhealthy {
            reason: format!("liveness probe failed for {}", env_id),
        },
    }
}

fn signal_state(signal: &HealthSignal, config: &ResourceConfig) -> HealthState {
    match signal {
        HealthSignal::ProbeHealthy => HealthState::Healthy,
        HealthSignal::ProbeDegraded | HealthSignal::BusyTooLong { .. } => HealthState::Degraded,
        HealthSignal::ProbeUnhealthy { .. } => HealthState::Unhealthy,
        HealthSignal::RepeatedFailures { count } => {
            if *count > config.unhealthy_failure_count {
                HealthState::Unhealthy
            } else {
                HealthState::Degraded
            }
        }
    }
}

fn describe(signal: &HealthSignal, config: &ResourceConfig) -> String {
    match signal {
        HealthSignal::ProbeHealthy => "probe healthy".to_string(),
        HealthSignal::ProbeDegraded => "probe reported degraded".to_string(),
        HealthSignal::ProbeUnhealthy { reason } => reason.clone(),
        HealthSignal::BusyTooLong { busy_ms } => format!(
            "busy for {}ms (limit {}ms)",
            busy_ms, config.busy_degraded_after_ms
        ),
        HealthSignal::RepeatedFailures { count } => format!("{} recorded failures", count),
    }
}

/// Combine signals, worst wins. No signals yields `Unknown`.
pub fn assess(
    env_id: &str,
    signals: &[HealthSignal],
    config: &ResourceConfig,
    now_ms: u64,
) -> HealthAssessment {
    let mut overall = if signals.is_empty() {
        HealthState::Unknown
    } else {
        HealthState::Healthy
    };
    let mut reason = String::new();
    for signal in signals {
        let state = signal_state(signal, config);
        if state.rank() > overall.rank() || reason.is_empty() {
            reason = describe(signal, config);
        }
        overall = overall.worst(state);
    }
    if reason.is_empty() {
        reason = "no signals available".to_string();
    }
    HealthAssessment {
        environment_id: env_id.to_string(),
        overall,
        signals: signals.to_vec(),
        reason,
        timestamp_ms: now_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EnvironmentStatus, EnvironmentType, HardwareConfig};

    fn env(failures: u32) -> ManagedEnvironment {
        let mut e =
            ManagedEnvironment::provisioning("d1", EnvironmentType::Docker, HardwareConfig::default(), 0);
        e.status = EnvironmentStatus::Available;
        e.failure_count = failures;
        e
    }

    #[test]
    fn busy_too_long_is_degraded() {
        let config = ResourceConfig::default();
        let mut e = env(0);
        e.status = EnvironmentStatus::Busy;
        e.allocated_at_ms = Some(0);
        assert!(policy_signals(&e, &config, 3_600_000).is_empty());
        let sigs = policy_signals(&e, &config, 3_600_001);
        let a = assess("d1", &sigs, &config, 3_600_001);
        assert_eq!(a.overall, HealthState::Degraded);
        assert!(a.reason.contains("busy"));
    }

    #[test]
    fn failure_count_thresholds() {
        let config = ResourceConfig::default();
        assert!(policy_signals(&env(1), &config, 0).is_empty());
        for (count, expected) in [
            (2, HealthState::Degraded),
            (3, HealthState::Degraded),
            (4, HealthState::Unhealthy),
        ] {
            let sigs = policy_signals(&env(count), &config, 0);
            assert_eq!(assess("d1", &sigs, &config, 0).overall, expected, "count {}", count);
        }
    }

    #[test]
    fn busy_and_failing_is_unhealthy() {
        let config = ResourceConfig::default();
        let mut e = env(4);
        e.status = EnvironmentStatus::Busy;
        e.allocated_at_ms = Some(0);
        let sigs = policy_signals(&e, &config, 3_600_001);
        assert_eq!(sigs.len(), 2);
        let a = assess("d1", &sigs, &config, 3_600_001);
        assert_eq!(a.overall, HealthState::Unhealthy);
        assert!(a.reason.contains("failures"));
    }

    #[test]
    fn probe_results_map_to_states() {
        let config = ResourceConfig::default();
        let a = assess(
            "d1",
            &[probe_signal(HealthState::Unhealthy, "d1")],
            &config,
            5,
        );
        assert_eq!(a.overall, HealthState::Unhealthy);
        assert!(a.reason.contains("d1"));
        let a = assess("d1", &[probe_signal(HealthState::Unknown, "d1")], &config, 5);
        assert_eq!(a.overall, HealthState::Healthy);
    }

    #[test]
    fn worst_signal_wins() {
        let config = ResourceConfig::default();
        let a = assess(
            "d1",
            &[
                HealthSignal::ProbeDegraded,
                HealthSignal::ProbeUnhealthy {
                    reason: "gone".into(),
                },
                HealthSignal::ProbeHealthy,
            ],
            &config,
            0,
        );
        assert_eq!(a.overall, HealthState::Unhealthy);
        assert_eq!(a.reason, "gone");
        assert_eq!(assess("d1", &[], &config, 0).overall, HealthState::Unknown);
    }
}
