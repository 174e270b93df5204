//! Error recovery and crash recovery.
//!
//! `ErrorRecoveryManager` owns the error-event log and runs recovery actions
//! against it. `ServiceRecoveryManager` owns the on-disk snapshot of in-flight
//! work and replays it after a restart.

pub mod actions;
pub mod errors;
pub mod lock;
pub mod retry;
pub mod service;
pub mod state;

pub use actions::{default_actions, RecoveryAction, RecoveryHandler};
pub use errors::{ErrorRecoveryManager, ErrorSummary, ExhaustionHandler, RecoveryCycle};
pub use lock::StateDirLock;
pub use retry::{AttemptTracker, RetryPolicy};
pub use service::{
    validate_state_file, CountMismatch, RecoveryResult, RepairReport, ServiceRecoveryManager,
    StateIntegrityReport,
};
pub use state::{
    load_state, PersistedPlanState, PersistedState, PersistedTestState, StateSource,
    StateStatistics,
};
