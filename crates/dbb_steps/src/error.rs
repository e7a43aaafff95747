use std::io;

use dbb_devices::{reboot::RebootError, DeviceError};
use dbb_utils::{error::LocatedError, exit::ExitCode};
use thiserror::Error;

use crate::options::OptionsError;

#[derive(Debug, Error)]
pub enum StepError {
    /// A command run with [crate::command::RunPolicy::halt_on_failure] exited non-zero.
    #[error("`{command}` exited with {code}, halting")]
    Halted { command: String, code: ExitCode },
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Reboot(#[from] RebootError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    InvalidOptions(#[from] OptionsError),
    /// Writing the step output failed.
    #[error("failed to write step output: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Internal(#[from] LocatedError),
}

impl StepError {
    pub fn is_halt(&self) -> bool {
        matches!(self, StepError::Halted { .. })
    }
}
