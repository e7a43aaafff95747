//! The buildbot annotation protocol: `@@@...@@@` lines on stdout that the buildbot UI turns
//! into steps, step colors, and links.

use std::{fmt, io};

use termcolor::WriteColor;

use crate::writer::{green_spec, red_bold_spec, with_color_spec, yellow_bold_spec};

/// Writes annotations and plain progress lines to the step output.
///
/// Every write is flushed, since child processes share the same output stream.
pub struct Annotator<W> {
    writer: W,
}

impl<W: WriteColor> Annotator<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Starts a new named step. Everything printed afterwards belongs to it.
    pub fn build_step(&mut self, name: &str) -> io::Result<()> {
        writeln!(self.writer)?;
        self.annotate(format_args!("BUILD_STEP {name}"))
    }

    /// Marks the current step as having warnings.
    pub fn step_warnings(&mut self) -> io::Result<()> {
        self.annotate(format_args!("STEP_WARNINGS"))
    }

    /// Marks the current step as failed.
    pub fn step_failure(&mut self) -> io::Result<()> {
        self.annotate(format_args!("STEP_FAILURE"))
    }

    pub fn step_link(&mut self, label: &str, url: &str) -> io::Result<()> {
        self.annotate(format_args!("STEP_LINK@{label}@{url}"))
    }

    pub fn line(&mut self, msg: impl fmt::Display) -> io::Result<()> {
        writeln!(self.writer, "{msg}")?;
        self.writer.flush()
    }

    pub fn success_line(&mut self, msg: impl fmt::Display) -> io::Result<()> {
        self.colored_line(&green_spec(), msg)
    }

    pub fn warning_line(&mut self, msg: impl fmt::Display) -> io::Result<()> {
        self.colored_line(&yellow_bold_spec(), msg)
    }

    pub fn error_line(&mut self, msg: impl fmt::Display) -> io::Result<()> {
        self.colored_line(&red_bold_spec(), msg)
    }

    fn colored_line(
        &mut self,
        spec: &termcolor::ColorSpec,
        msg: impl fmt::Display,
    ) -> io::Result<()> {
        with_color_spec(&mut self.writer, spec, |w| write!(w, "{msg}"))?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn annotate(&mut self, body: fmt::Arguments<'_>) -> io::Result<()> {
        writeln!(self.writer, "@@@{body}@@@")?;
        self.writer.flush()
    }
}
