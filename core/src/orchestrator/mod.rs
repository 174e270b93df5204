//! The orchestrator service and its service-level reports.

pub mod health;
pub mod service;

pub use health::{LifecycleState, ServiceCounters, ServiceHealth, SystemMetrics, TimeoutMetrics};
pub use service::OrchestratorService;
