pub mod monitor;
pub mod source;

pub use monitor::{QueueMonitor, QueueStatus, QueuedPlanSummary};
pub use source::{DirectoryPlanSource, InMemoryPlanSource, PlanSource};
