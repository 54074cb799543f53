//! robot-link Shared Protocol Types
//!
//! This crate provides the wire framing and command types shared by the
//! BLE and WebSocket transports of the on-device control plane.

pub mod command;
pub mod frame;

pub use command::{Command, CommandParseError, CommandResult, Response};
pub use frame::{Reassembler, CHUNK_SIZE};

/// Timing parameters for the control plane
pub mod timing {
    /// Heartbeat timeout - the running user program is killed past this
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 2500;

    /// How often the watchdog checks the heartbeat
    pub const WATCHDOG_INTERVAL_MS: u64 = 1000;

    /// Reassembly buffers idle longer than this are discarded
    pub const FRAGMENT_STALENESS_MS: u64 = 5000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_ordering() {
        // The watchdog has to poll more often than the heartbeat window,
        // otherwise a kill could land a full window late.
        assert!(timing::WATCHDOG_INTERVAL_MS < timing::HEARTBEAT_TIMEOUT_MS);
    }
}
