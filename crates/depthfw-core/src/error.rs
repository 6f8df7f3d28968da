//! Error taxonomy shared by device backends and the update engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a failure, used to pick the user-facing message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Structured error raised by the device layer
    DeviceProtocol,
    /// Generic runtime failure (I/O, timeouts, rejected images)
    Runtime,
    /// Anything else, including panics inside a workflow
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::DeviceProtocol => write!(f, "device protocol error"),
            ErrorKind::Runtime => write!(f, "runtime error"),
            ErrorKind::Unknown => write!(f, "unknown error"),
        }
    }
}

/// Error reported by a device backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// A device call failed; carries the failing operation and its arguments
    #[error("{function}({args}):\n{message}")]
    Protocol {
        function: String,
        args: String,
        message: String,
    },
    #[error("{0} is not supported by this device")]
    NotSupported(String),
    #[error("Device disconnected: {0}")]
    Disconnected(String),
    #[error("{0}")]
    Backend(String),
}

impl DeviceError {
    /// Build a structured protocol error
    pub fn protocol(
        function: impl Into<String>,
        args: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Protocol {
            function: function.into(),
            args: args.into(),
            message: message.into(),
        }
    }

    /// Only protocol errors carry operation context; the rest are generic
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Protocol { .. } => ErrorKind::DeviceProtocol,
            _ => ErrorKind::Runtime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_carries_operation_context() {
        let err = DeviceError::protocol("rs2_enter_update_state", "device:0x1", "Permission denied");
        assert_eq!(
            err.to_string(),
            "rs2_enter_update_state(device:0x1):\nPermission denied"
        );
        assert_eq!(err.kind(), ErrorKind::DeviceProtocol);
    }

    #[test]
    fn test_not_supported_display() {
        let err = DeviceError::NotSupported("FirmwareUpdateId".to_string());
        assert_eq!(err.to_string(), "FirmwareUpdateId is not supported by this device");
        assert_eq!(err.kind(), ErrorKind::Runtime);
    }

    #[test]
    fn test_context_free_errors_are_runtime() {
        assert_eq!(
            DeviceError::Disconnected("SN-1".to_string()).kind(),
            ErrorKind::Runtime
        );
        assert_eq!(
            DeviceError::Backend("enumeration failed".to_string()).kind(),
            ErrorKind::Runtime
        );
    }
}
