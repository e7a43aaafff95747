use std::{io, path::PathBuf};

use dbb_devices::DeviceError;
use thiserror::Error;

/// Failures of the instrumentation collaborators. A Java test that fails is a result, not one
/// of these.
#[derive(Debug, Error)]
pub enum InstrumentationError {
    #[error("{0}")]
    Device(#[from] DeviceError),
    #[error("failed to read test listing {}: {source}", .path.display())]
    ReadListing { path: PathBuf, source: io::Error },
    #[error("malformed test listing {}: {source}", .path.display())]
    MalformedListing {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid test filter {filter:?}: {source}")]
    InvalidFilter {
        filter: String,
        source: regex::Error,
    },
    #[error("invalid instrumentation options: {0}")]
    InvalidOptions(String),
}

#[derive(Debug, Error)]
pub enum HostDrivenError {
    #[error("{type_name} has no test method named {test_name:?}")]
    UnknownTestMethod {
        type_name: &'static str,
        test_name: String,
    },
    #[error("test case has not been set up")]
    NotSetUp,
    #[error("test case has already run")]
    AlreadyRan,
    #[error("host-driven test requires instrumentation options")]
    MissingInstrumentationOptions,
    /// A filter resolved to no tests. This is a configuration error, not a test outcome.
    #[error("Java test filter \"{filter}\" returned no tests.")]
    NoTestsMatched { filter: String },
    #[error("{0}")]
    Device(#[from] DeviceError),
    #[error("{0}")]
    Instrumentation(#[from] InstrumentationError),
    #[error("test method failed: {0:#}")]
    TestMethod(anyhow::Error),
}

impl HostDrivenError {
    /// Recovers a [HostDrivenError] that a test method propagated through [anyhow], so that
    /// e.g. [HostDrivenError::NoTestsMatched] keeps its identity.
    pub(crate) fn from_test_method(error: anyhow::Error) -> Self {
        match error.downcast::<HostDrivenError>() {
            Ok(error) => error,
            Err(error) => HostDrivenError::TestMethod(error),
        }
    }
}
