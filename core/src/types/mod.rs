//! Domain records shared by every orchestrator component.

pub mod config;
pub mod environment;
pub mod error_event;
pub mod health;
pub mod plan;
pub mod test;

pub use environment::{
    EnvironmentStatus, EnvironmentType, HardwareConfig, HardwareRequirements, HealthState,
    IsolationLevel, ManagedEnvironment, Peripheral, ResourceUsage,
};
pub use error_event::{ErrorCategory, ErrorEvent, ErrorReport, ErrorSeverity};
pub use health::{ComponentHealth, ServiceState};
pub use plan::{ExecutionPlan, PlanStatus, PlanSubmission, DEFAULT_PRIORITY};
pub use test::{TestExecutionStatus, TestStatus, TestUpdate};
