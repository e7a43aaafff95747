//! Output of the step driver: buildbot annotations interleaved with plain progress lines.

pub mod annotations;
pub mod quote;
pub mod writer;

pub use annotations::Annotator;
