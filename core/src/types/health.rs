use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::environment::HealthState;

/// An observation feeding an environment health assessment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthSignal {
    ProbeHealthy,
    ProbeDegraded,
    ProbeUnhealthy { reason: String },
    BusyTooLong { busy_ms: u64 },
    RepeatedFailures { count: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthAssessment {
    pub environment_id: String,
    pub overall: HealthState,
    pub signals: Vec<HealthSignal>,
    pub reason: String,
    pub timestamp_ms: u64,
}

/// Coarse state reported by every component and by the service itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Healthy,
    Degraded,
    Stopped,
}

/// A component's health sub-report. Field names inside `details` are part
/// of the monitoring contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentHealth {
    pub status: ServiceState,
    #[serde(flatten)]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl ComponentHealth {
    pub fn new(status: ServiceState) -> Self {
        ComponentHealth {
            status,
            details: BTreeMap::new(),
        }
    }

    pub fn detail(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.details.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.details.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_signal_tagged() {
        let sig = HealthSignal::BusyTooLong { busy_ms: 4_000_000 };
        let json = serde_json::to_string(&sig).unwrap();
        assert!(json.contains("\"type\":\"busy_too_long\""));
        let back: HealthSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sig);
    }

    #[test]
    fn component_health_flattens_details() {
        let h = ComponentHealth::new(ServiceState::Degraded)
            .detail("active_tests", 3)
            .detail("degraded_reasons", vec!["critical errors: 1"]);
        let json = serde_json::to_value(&h).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["active_tests"], 3);
        assert_eq!(json["degraded_reasons"][0], "critical errors: 1");
        assert_eq!(h.get("active_tests"), Some(&serde_json::json!(3)));
    }
}
