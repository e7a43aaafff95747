//! Commands the steps shell out to, and the policy applied when one fails.

use std::{
    fmt,
    fs::File,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use dbb_reporting::quote::command_to_string;
use dbb_utils::exit::{ExitCode, CODE_WARNING};
use tokio::process;

/// A command line, run from the source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCommand {
    program: String,
    args: Vec<String>,
    stdout: Option<PathBuf>,
}

impl StepCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout: None,
        }
    }

    /// A program given as a path, e.g. a script resolved against the source root.
    pub fn from_path(program: &Path) -> Self {
        Self::new(program.display().to_string())
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_if(self, cond: bool, arg: impl Into<String>) -> Self {
        if cond {
            self.arg(arg)
        } else {
            self
        }
    }

    /// Redirects stdout to a file, truncating it.
    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn stdout(&self) -> Option<&Path> {
        self.stdout.as_deref()
    }

    pub fn argv(&self) -> Vec<&str> {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect()
    }
}

impl fmt::Display for StepCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&command_to_string(&self.argv()))
    }
}

/// What a failing command does to its step, and to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPolicy {
    /// Mark the step failed, rather than warned, on a non-zero exit.
    pub flunk_on_failure: bool,
    /// Stop the run on a non-zero exit.
    pub halt_on_failure: bool,
    /// Exit code that only ever warns.
    pub warning_code: i32,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            flunk_on_failure: true,
            halt_on_failure: false,
            warning_code: CODE_WARNING,
        }
    }
}

impl RunPolicy {
    pub fn halting() -> Self {
        Self {
            halt_on_failure: true,
            ..Self::default()
        }
    }
}

/// Runs step commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a command to completion, with output going to the step log unless redirected.
    async fn run(&self, cmd: &StepCommand) -> io::Result<ExitCode>;

    /// Starts a command and leaves it running in the background.
    fn spawn(&self, cmd: &StepCommand) -> io::Result<()>;

    /// Runs a command to completion and captures its stdout.
    async fn output(&self, cmd: &StepCommand) -> io::Result<String>;
}

/// Runs commands as child processes of dbb.
///
/// In a dry run commands are never started: [CommandRunner::run] succeeds and
/// [CommandRunner::output] yields nothing.
pub struct ProcessRunner {
    cwd: PathBuf,
    dry_run: bool,
}

impl ProcessRunner {
    pub fn new(cwd: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            cwd: cwd.into(),
            dry_run,
        }
    }

    fn command(&self, cmd: &StepCommand) -> io::Result<process::Command> {
        let mut child = process::Command::new(&cmd.program);
        child.args(&cmd.args);
        child.current_dir(&self.cwd);
        child.stdin(Stdio::null());
        child.stderr(Stdio::inherit());
        match &cmd.stdout {
            Some(path) => child.stdout(File::create(path)?),
            None => child.stdout(Stdio::inherit()),
        };
        Ok(child)
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cmd: &StepCommand) -> io::Result<ExitCode> {
        if self.dry_run {
            tracing::debug!(%cmd, "dry run, not running");
            return Ok(ExitCode::SUCCESS);
        }
        tracing::debug!(%cmd, cwd = %self.cwd.display(), "running");
        let status = self.command(cmd)?.status().await?;
        Ok(status.into())
    }

    fn spawn(&self, cmd: &StepCommand) -> io::Result<()> {
        if self.dry_run {
            tracing::debug!(%cmd, "dry run, not spawning");
            return Ok(());
        }
        tracing::debug!(%cmd, "spawning in the background");
        // Dropping the handle leaves the child running.
        let _child = self.command(cmd)?.spawn()?;
        Ok(())
    }

    async fn output(&self, cmd: &StepCommand) -> io::Result<String> {
        if self.dry_run {
            return Ok(String::new());
        }
        tracing::debug!(%cmd, "capturing output");
        let mut child = self.command(cmd)?;
        child.stdout(Stdio::piped());
        let output = child.output().await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
