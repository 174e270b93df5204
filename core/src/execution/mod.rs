//! Test execution backends driven by the orchestrator.

pub mod runner;

pub use runner::{
    runner_from_config, CommandTestRunner, ScriptedOutcome, SimulatedTestRunner, TestRequest,
    TestResult, TestRunner,
};
