//! Error handling for GrblBridge
//!
//! Provides error types for the layers that can fail outright:
//! - Controller errors (operations refused in the current machine state)
//! - Connection errors (serial transport)
//! - Firmware errors (flashing tool invocation)
//!
//! Protocol-level problems (undecodable lines, unmapped instructions) are
//! logged and skipped instead of being raised.

use thiserror::Error;

/// Controller error type
///
/// Returned when an operation is not allowed in the controller's current state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// Controller is not connected
    #[error("Controller not connected")]
    NotConnected,

    /// A job is currently streaming
    #[error("A job is active")]
    JobActive,

    /// A firmware upload is already running
    #[error("Firmware upload already in progress")]
    FirmwareUploadInProgress,
}

/// Connection error type
///
/// Represents errors related to the serial link to the device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Port not found
    #[error("Port not found: {port}")]
    PortNotFound {
        /// The name of the port that was not found.
        port: String,
    },

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// Write attempted on a closed transport
    #[error("Port is not open")]
    NotOpen,

    /// Serial port error
    #[error("Serial port error: {reason}")]
    SerialError {
        /// The reason for the serial port error.
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {reason}")]
    IoError {
        /// The reason for the I/O error.
        reason: String,
    },
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::IoError {
            reason: err.to_string(),
        }
    }
}

/// Firmware error type
///
/// Represents failures of the external flashing tool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FirmwareError {
    /// Flashing is not supported on this operating system
    #[error("Firmware update not supported on current platform ({platform})")]
    UnsupportedPlatform {
        /// The operating system name.
        platform: String,
    },

    /// The flashing process could not be started
    #[error("Failed to spawn flash process {program}: {reason}")]
    SpawnFailed {
        /// The executable that was spawned.
        program: String,
        /// The reason the spawn failed.
        reason: String,
    },

    /// I/O with the flashing process failed
    #[error("Flash process I/O error: {reason}")]
    Io {
        /// The reason for the I/O error.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = FirmwareError::UnsupportedPlatform {
            platform: "linux".into(),
        };
        assert_eq!(
            err.to_string(),
            "Firmware update not supported on current platform (linux)"
        );
        assert_eq!(
            ControllerError::NotConnected.to_string(),
            "Controller not connected"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let conn: ConnectionError = io.into();
        assert!(matches!(conn, ConnectionError::IoError { .. }));
        assert_eq!(conn.to_string(), "I/O error: pipe");
    }
}
