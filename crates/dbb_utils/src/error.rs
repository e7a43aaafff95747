use anyhow::{anyhow, Error, Result};

/// Opaque thread-safe error.
/// Only use this when the error is unrecoverable and is headed for a sink,
/// like the tracing logs or the final exit message of a step run.
pub type AnyError = Error;

#[derive(Debug)]
pub struct Location {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

/// An error with the source location that raised it.
#[derive(Debug)]
pub struct LocatedError {
    pub error: AnyError,
    pub location: &'static Location,
}

impl std::error::Error for LocatedError {}

impl std::fmt::Display for LocatedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let Self {
            error,
            location: Location { file, line, column },
        } = self;
        write!(f, "{error} at {file}@{line}:{column}")
    }
}

pub type OpaqueResult<T> = Result<T, LocatedError>;

pub trait ResultLocation<T> {
    fn located(self, location: &'static Location) -> OpaqueResult<T>;
}

impl<T, E: Into<Box<dyn std::error::Error + Send + Sync>>> ResultLocation<T> for Result<T, E> {
    #[inline]
    fn located(self, location: &'static Location) -> OpaqueResult<T> {
        self.map_err(|error| error.located(location))
    }
}

pub trait ErrorLocation {
    fn located(self, location: &'static Location) -> LocatedError;
}

impl<E: Into<Box<dyn std::error::Error + Send + Sync>>> ErrorLocation for E {
    #[inline]
    fn located(self, location: &'static Location) -> LocatedError {
        let boxed: Box<dyn std::error::Error + Send + Sync> = self.into();
        let error: anyhow::Error = anyhow!(boxed);
        LocatedError { error, location }
    }
}

pub use crate::here;

#[macro_export]
macro_rules! here {
    () => {
        &$crate::error::Location {
            file: file!(),
            line: line!(),
            column: column!(),
        }
    };
}

pub use crate::log_located_error;

/// Logs a [LocatedError] at error level, splitting its location into fields.
#[macro_export]
macro_rules! log_located_error {
    ($err:expr, $($field:tt)*) => {{
        let $crate::error::LocatedError {
            error,
            location: $crate::error::Location { file, line, column },
        } = $err;
        tracing::error!(file, line, column, $($field)*, "{error}");
    }};
}
