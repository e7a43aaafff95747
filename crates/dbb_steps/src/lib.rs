//! The device step driver: provisioning, installs, test suites, coverage, and the log
//! collection that always follows them, announced as buildbot steps.

pub mod command;
pub mod error;
pub mod options;
pub mod steps;
pub mod suites;

pub use command::{CommandRunner, ProcessRunner, RunPolicy, StepCommand};
pub use error::StepError;
pub use options::{BuildTarget, DeviceStepsOptions, OptionsError, StepArgs, TestStep};
pub use steps::DeviceSteps;
