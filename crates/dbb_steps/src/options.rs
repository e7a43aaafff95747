use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use thiserror::Error;

use crate::suites::{instrumentation_suite, InstrumentationSuite};

/// Buildbot build or factory properties, as handed over on the command line.
pub type Properties = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("Unknown tests {0:?}")]
    UnknownTests(Vec<String>),
    #[error("Unknown install target {0:?}")]
    UnknownInstallTarget(String),
    #[error("Unknown build target {0:?}, expected Debug or Release")]
    UnknownBuildTarget(String),
    #[error("Invalid source root {path:?}: {reason}")]
    InvalidSourceRoot { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildTarget {
    #[default]
    Debug,
    Release,
}

impl BuildTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildTarget::Debug => "Debug",
            BuildTarget::Release => "Release",
        }
    }

    pub fn is_release(&self) -> bool {
        matches!(self, BuildTarget::Release)
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildTarget {
    type Err = OptionsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Debug" => Ok(BuildTarget::Debug),
            "Release" => Ok(BuildTarget::Release),
            other => Err(OptionsError::UnknownBuildTarget(other.to_owned())),
        }
    }
}

/// A group of tests selectable with `--test-filter`. Declaration order is the order the
/// groups run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TestStep {
    Chromedriver,
    Unit,
    Ui,
    Webkit,
    WebkitLayout,
    Webrtc,
}

impl TestStep {
    pub const ALL: [TestStep; 6] = [
        TestStep::Chromedriver,
        TestStep::Unit,
        TestStep::Ui,
        TestStep::Webkit,
        TestStep::WebkitLayout,
        TestStep::Webrtc,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TestStep::Chromedriver => "chromedriver",
            TestStep::Unit => "unit",
            TestStep::Ui => "ui",
            TestStep::Webkit => "webkit",
            TestStep::WebkitLayout => "webkit_layout",
            TestStep::Webrtc => "webrtc",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|step| step.name() == name)
    }
}

impl fmt::Display for TestStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Options as given on the command line, before validation.
#[derive(Debug, Default, Clone)]
pub struct StepArgs {
    pub source_root: PathBuf,
    pub build_properties: Properties,
    pub factory_properties: Properties,
    pub experimental: bool,
    pub test_filters: Vec<String>,
    pub asan: bool,
    pub install: Option<String>,
    pub reboot: bool,
    pub coverage_bucket: Option<String>,
    pub flakiness_server: Option<String>,
    pub auto_reconnect: bool,
    pub logcat_dump_output: Option<PathBuf>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coverage {
    pub bucket: String,
    /// Where instrumented runs leave their coverage data, `<src>/out/<target>/coverage`.
    pub dir: PathBuf,
}

/// Validated options of a device step run.
#[derive(Debug, Clone)]
pub struct DeviceStepsOptions {
    pub source_root: PathBuf,
    pub target: BuildTarget,
    pub build_properties: Properties,
    pub factory_properties: Properties,
    pub experimental: bool,
    pub test_steps: BTreeSet<TestStep>,
    pub asan: bool,
    pub install: Option<&'static InstrumentationSuite>,
    pub reboot: bool,
    pub coverage: Option<Coverage>,
    pub flakiness_server: Option<String>,
    pub auto_reconnect: bool,
    pub logcat_dump_output: Option<PathBuf>,
    pub dry_run: bool,
}

impl DeviceStepsOptions {
    pub fn from_args(args: StepArgs) -> Result<Self, OptionsError> {
        let StepArgs {
            source_root,
            build_properties,
            factory_properties,
            experimental,
            test_filters,
            asan,
            install,
            reboot,
            coverage_bucket,
            flakiness_server,
            auto_reconnect,
            logcat_dump_output,
            dry_run,
        } = args;

        // Commands run from the source root and also name paths under it.
        let source_root =
            std::path::absolute(&source_root).map_err(|e| OptionsError::InvalidSourceRoot {
                path: source_root.clone(),
                reason: e.to_string(),
            })?;

        let mut unknown_tests = BTreeSet::new();
        let mut test_steps = BTreeSet::new();
        for filter in test_filters {
            match TestStep::from_name(&filter) {
                Some(step) => {
                    test_steps.insert(step);
                }
                None => {
                    unknown_tests.insert(filter);
                }
            }
        }
        if !unknown_tests.is_empty() {
            return Err(OptionsError::UnknownTests(unknown_tests.into_iter().collect()));
        }

        let install = install
            .map(|name| instrumentation_suite(&name).ok_or(OptionsError::UnknownInstallTarget(name)))
            .transpose()?;

        let target = match factory_properties.get("target") {
            None => BuildTarget::default(),
            Some(serde_json::Value::String(target)) => target.parse()?,
            Some(other) => return Err(OptionsError::UnknownBuildTarget(other.to_string())),
        };

        let coverage = coverage_bucket.map(|bucket| Coverage {
            bucket,
            dir: out_dir(&source_root, target).join("coverage"),
        });

        Ok(Self {
            source_root,
            target,
            build_properties,
            factory_properties,
            experimental,
            test_steps,
            asan,
            install,
            reboot,
            coverage,
            flakiness_server,
            auto_reconnect,
            logcat_dump_output,
            dry_run,
        })
    }

    /// `<src>/out/<target>`
    pub fn out_dir(&self) -> PathBuf {
        out_dir(&self.source_root, self.target)
    }

    /// Where the logcat monitor collects device logs.
    pub fn logcat_dir(&self) -> PathBuf {
        self.source_root.join("out").join("logcat")
    }

    /// A build property rendered as a string; numbers are common (e.g. `buildnumber`).
    pub fn build_property(&self, key: &str) -> Option<String> {
        property_string(&self.build_properties, key)
    }

    pub fn factory_property(&self, key: &str) -> Option<String> {
        property_string(&self.factory_properties, key)
    }
}

fn out_dir(source_root: &Path, target: BuildTarget) -> PathBuf {
    source_root.join("out").join(target.as_str())
}

fn property_string(properties: &Properties, key: &str) -> Option<String> {
    match properties.get(key)? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
