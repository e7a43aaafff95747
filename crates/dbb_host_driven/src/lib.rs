//! Host-driven tests: test logic that runs on the host, drives a device, and delegates the
//! on-device part to Java instrumentation tests.

pub mod am_instrument;
pub mod backend;
pub mod error;
pub mod options;
pub mod package;
pub mod runner;
pub mod test_case;

pub use backend::{AdbInstrumentationBackend, InstrumentationBackend};
pub use error::{HostDrivenError, InstrumentationError};
pub use options::InstrumentationOptions;
pub use package::{ListedTestPackage, TestPackage};
pub use runner::JavaTestRunner;
pub use test_case::{
    HostDrivenContext, HostDrivenTest, HostDrivenTestCase, LifecycleState, TestEnvironment,
    TestMethod, TestRegistry,
};
