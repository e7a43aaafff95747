use std::{io, time::Duration};

use thiserror::Error;

use crate::DeviceId;

#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device did not come back online, or stopped answering its command interface.
    #[error("device {device} is unresponsive: {reason}")]
    Unresponsive { device: DeviceId, reason: String },
    #[error("`{command}` failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("could not parse adb output: {0}")]
    Parse(String),
}

impl DeviceError {
    pub fn unresponsive(device: &DeviceId, reason: impl Into<String>) -> Self {
        Self::Unresponsive {
            device: device.clone(),
            reason: reason.into(),
        }
    }

    pub fn is_unresponsive(&self) -> bool {
        matches!(self, DeviceError::Unresponsive { .. })
    }
}
