use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::InstrumentationError;

pub const DEFAULT_INSTRUMENTATION_RUNNER: &str = "android.test.InstrumentationTestRunner";
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(60 * 5);

/// What a host-driven test needs to find and run Java instrumentation tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentationOptions {
    pub test_apk_path: PathBuf,
    pub test_apk_jar_path: PathBuf,
    /// Package of the instrumentation, e.g. `org.chromium.content_shell_apk.tests`.
    pub test_package: String,
    pub instrumentation_runner: String,
    /// Deadline for a single Java test.
    pub test_timeout: Duration,
}

impl InstrumentationOptions {
    pub fn new(
        test_apk_path: impl Into<PathBuf>,
        test_apk_jar_path: impl Into<PathBuf>,
        test_package: impl Into<String>,
    ) -> Result<Self, InstrumentationError> {
        let test_package = test_package.into();
        if !is_java_package(&test_package) {
            return Err(InstrumentationError::InvalidOptions(format!(
                "{test_package:?} is not a Java package name"
            )));
        }

        Ok(Self {
            test_apk_path: test_apk_path.into(),
            test_apk_jar_path: test_apk_jar_path.into(),
            test_package,
            instrumentation_runner: DEFAULT_INSTRUMENTATION_RUNNER.to_owned(),
            test_timeout: DEFAULT_TEST_TIMEOUT,
        })
    }

    /// The test listing generated next to the test JAR at build time.
    pub fn test_listing_path(&self) -> PathBuf {
        listing_path_for_jar(&self.test_apk_jar_path)
    }

    /// `<package>/<runner>`, as `am instrument` expects it.
    pub fn instrumentation_component(&self) -> String {
        format!("{}/{}", self.test_package, self.instrumentation_runner)
    }
}

pub fn listing_path_for_jar(jar: &Path) -> PathBuf {
    jar.with_extension("tests.json")
}

fn is_java_package(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
