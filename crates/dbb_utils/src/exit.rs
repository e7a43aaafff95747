/// Exit code to issue if dbb itself fails, rather than a step it ran.
pub const CODE_ERROR: i32 = 101;

/// Exit code a step command uses to ask for a warning rather than a failure.
pub const CODE_WARNING: i32 = 88;

#[derive(PartialEq, Eq, Debug, Clone, Copy, PartialOrd, Ord)]
pub struct ExitCode(i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);
    pub const WARNING: ExitCode = ExitCode(CODE_WARNING);
    pub const DBB_ERROR: ExitCode = ExitCode(CODE_ERROR);

    pub const fn get(&self) -> i32 {
        self.0
    }

    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    pub const fn is_success(&self) -> bool {
        self.0 == 0
    }
}

impl From<std::process::ExitStatus> for ExitCode {
    fn from(es: std::process::ExitStatus) -> Self {
        // Killed by a signal.
        let code = es.code().unwrap_or(CODE_ERROR);
        Self::new(code)
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
