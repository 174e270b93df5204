pub mod tracker;

pub use tracker::{Drift, PlanExecutionStatus, StatusTracker, TrackerMetrics, TrackerStats};
