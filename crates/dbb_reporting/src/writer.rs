use std::io;

use termcolor::{Color, ColorSpec, WriteColor};

#[inline]
pub(crate) fn red_bold_spec() -> ColorSpec {
    let mut spec = ColorSpec::new();
    spec.set_fg(Some(Color::Red)).set_bold(true);
    spec
}

#[inline]
pub(crate) fn green_spec() -> ColorSpec {
    let mut spec = ColorSpec::new();
    spec.set_fg(Some(Color::Green));
    spec
}

#[inline]
pub(crate) fn yellow_bold_spec() -> ColorSpec {
    let mut spec = ColorSpec::new();
    spec.set_fg(Some(Color::Yellow)).set_bold(true);
    spec
}

#[inline]
pub(crate) fn with_color_spec<W>(
    writer: &mut W,
    color_spec: &ColorSpec,
    f: impl FnOnce(&mut W) -> io::Result<()>,
) -> io::Result<()>
where
    W: WriteColor,
{
    writer.set_color(color_spec)?;
    f(writer)?;
    writer.reset()
}

/// A writer that renders color changes as inline tags like `<red-bold>` and `<reset>`, so
/// colored output can be asserted on.
#[derive(Debug, Default)]
pub struct TestColorWriter<W: io::Write>(W);

impl<W: io::Write> TestColorWriter<W> {
    pub fn new(w: W) -> Self {
        Self(w)
    }

    pub fn get(self) -> W {
        self.0
    }
}

impl TestColorWriter<Vec<u8>> {
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl<W: io::Write> io::Write for TestColorWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: io::Write> WriteColor for TestColorWriter<W> {
    fn supports_color(&self) -> bool {
        true
    }

    fn set_color(&mut self, spec: &ColorSpec) -> io::Result<()> {
        use termcolor::Color::*;

        let mut spec_parts = vec![];
        if let Some(color) = spec.fg() {
            spec_parts.push(match color {
                Red => "red",
                Green => "green",
                Yellow => "yellow",
                _ => "other",
            });
        }
        if spec.bold() {
            spec_parts.push("bold")
        }

        write!(&mut self.0, "<{}>", spec_parts.join("-"))
    }

    fn reset(&mut self) -> io::Result<()> {
        write!(&mut self.0, "<reset>")
    }
}
