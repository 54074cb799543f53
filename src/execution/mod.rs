//! Execution Module
//!
//! Runs the user's control program and enforces the heartbeat dead-man's
//! switch.

mod supervisor;

pub use supervisor::ExecutionSupervisor;
