//! TestPilot core. Schedules submitted test plans onto a pool of execution
//! environments, tracks every test's status, enforces timeouts, recovers
//! from component errors and resumes in-flight work after a restart.
//!
//! Everything is driven through [`orchestrator::OrchestratorService`]; the
//! component modules are public so they can be used and tested on their own.

pub mod clock;
pub mod error;
pub mod execution;
pub mod infrastructure;
pub mod orchestrator;
pub mod queue;
pub mod recovery;
pub mod resource;
pub mod status;
pub mod timeout;
pub mod types;
pub mod worker;

pub use error::{OrchestratorError, Result};
pub use orchestrator::OrchestratorService;
