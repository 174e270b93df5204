pub mod manager;

pub use manager::{TimeoutCallback, TimeoutEvent, TimeoutManager, TimeoutReason};
