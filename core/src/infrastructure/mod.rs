//! Backends the orchestrator drives: environment provisioners and the shell
//! runner they (and the command test runner) execute through.

pub mod provisioner;
pub mod runner;
pub mod simulated;

pub use provisioner::{CommandProvisioner, Provisioner, ProvisionerRegistry};
pub use runner::{CommandRunner, MockRunner, ShellRunner};
pub use simulated::{ProvisionOp, SimulatedProvisioner};
