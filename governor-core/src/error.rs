//! Core error types.

use std::fmt;
use thiserror::Error;

/// Errors from configuration compilation and the runtime engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration:\n{}", errors.join("\n"))]
    ConfigInvalid { errors: Vec<String> },

    #[error("unknown machine: {machine}")]
    MachineNotFound { machine: String },

    #[error("unknown device: {device}")]
    DeviceNotFound { device: String },

    #[error("unknown state: {state}")]
    StateNotFound { state: String },

    #[error("unknown target '{target}' on device '{device}'")]
    TargetNotFound { device: String, target: String },

    #[error("no window for device '{device}' in state '{state}'")]
    WindowNotFound { state: String, device: String },

    #[error("invalid window [{low}, {high}]: must satisfy low <= 0 <= high")]
    InvalidWindow { low: f64, high: f64 },

    #[error("command rejected: {reason}")]
    CommandRejected { reason: String },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a device failed to complete a commanded move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveFault {
    /// An underlying channel dropped.
    Disconnected,
    /// The motor controller reports the axis unhomed.
    NotHomed,
    /// The idle timer exceeded the device's configured timeout.
    Timeout,
    /// Motion finished outside the target window, or the setpoint is
    /// beyond the controller's soft limits.
    MissedTarget,
    /// The abort flag was raised while settling.
    Aborted,
}

impl fmt::Display for MoveFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MoveFault::Disconnected => "DISCONNECTED",
            MoveFault::NotHomed => "NOT_HOMED",
            MoveFault::Timeout => "TIMEOUT",
            MoveFault::MissedTarget => "MISSED_TARGET",
            MoveFault::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// One device's failure inside a transition stage.
#[derive(Debug, Clone)]
pub struct DeviceFailure {
    pub device: String,
    pub fault: MoveFault,
}

impl fmt::Display for DeviceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.device, self.fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        assert_eq!(MoveFault::Timeout.to_string(), "TIMEOUT");
        assert_eq!(MoveFault::NotHomed.to_string(), "NOT_HOMED");
        let failure = DeviceFailure {
            device: "bs".to_string(),
            fault: MoveFault::Timeout,
        };
        assert_eq!(failure.to_string(), "bs(TIMEOUT)");
    }

    #[test]
    fn test_config_invalid_enumerates() {
        let err = CoreError::ConfigInvalid {
            errors: vec!["first problem".to_string(), "second problem".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("first problem"));
        assert!(msg.contains("second problem"));
    }
}
