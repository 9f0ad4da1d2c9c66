//! Error types shared by the sensor, telemetry and actuator layers.
//!
//! Scheduled work reports these through `anyhow` at the dispatch boundary;
//! manual triggers hand [`TriggerError`] straight back to the caller.

use std::path::PathBuf;

use thiserror::Error;

use crate::actuator::Actuator;
use crate::hardware::RelayChannel;

/// A bus or transport failure while sampling one sensor.
#[derive(Debug, Clone, Error)]
pub enum SensorReadError {
    #[error("sensor bus error at 0x{address:02x}: {detail}")]
    Bus { address: u16, detail: String },

    #[error("unexpected chip id 0x{found:02x} at 0x{address:02x} (expected 0x{expected:02x})")]
    ChipId {
        address: u16,
        expected: u8,
        found: u8,
    },

    #[error("no sensor configured at 0x{0:02x}")]
    UnknownAddress(u16),

    #[error("sensor bus lock poisoned")]
    Poisoned,
}

/// Failure to durably append rows to the telemetry log.
#[derive(Debug, Error)]
pub enum LogWriteError {
    #[error("telemetry log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("telemetry log lock poisoned")]
    Poisoned,
}

/// Failure to drive one relay channel.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("relay {channel} is not wired")]
    NotWired { channel: RelayChannel },

    #[error("relay {channel} write failed: {detail}")]
    Write {
        channel: RelayChannel,
        detail: String,
    },

    #[error("relay bank lock poisoned")]
    Poisoned,
}

/// Synchronous rejection of a start/trigger request. No relay has been
/// touched when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("invalid duration '{input}': {reason}")]
    InvalidDuration { input: String, reason: String },

    #[error("{0} is already running")]
    Busy(Actuator),

    #[error("controller is shutting down")]
    ShuttingDown,
}
