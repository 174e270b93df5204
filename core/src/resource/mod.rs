//! Execution environment pool.

pub mod health;
pub mod manager;
pub mod matching;

pub use manager::{CleanupReport, PoolStats, ResourceManager, ResourceUtilization};
