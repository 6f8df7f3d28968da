//! Errors raised while running an update task

use depthfw_core::{DeviceError, ErrorKind, FirmwareError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Runtime(String),
    #[error("{0}")]
    Unknown(String),
    #[error("Update task was cancelled")]
    Cancelled,
    #[error("Update task already started")]
    AlreadyStarted,
    #[error("Update task is still running")]
    Busy,
    #[error("No tokio runtime available to run the update task")]
    NoRuntime,
}

impl UpdateError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    /// Classify this error for the task's failure record
    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Device(e) => e.kind(),
            UpdateError::Unknown(_) => ErrorKind::Unknown,
            _ => ErrorKind::Runtime,
        }
    }
}
