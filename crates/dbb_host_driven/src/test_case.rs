//! The host-driven test case: one named test method of a fixture, run against one device.
//!
//! A fixture type implements [HostDrivenTest] and lists its test methods in a
//! [TestRegistry]. [HostDrivenTestCase::new] binds a fixture to one of those methods, failing
//! up front if the name is not registered. The case then moves through
//! [LifecycleState::SetUp], [LifecycleState::Running] and [LifecycleState::TornDown]; callers
//! tear down on every exit path, which [HostDrivenTestCase::run_to_completion] packages.
//!
//! Test methods usually delegate the on-device part of the test to Java instrumentation tests
//! via [HostDrivenContext::run_java_test_filters].

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use dbb_devices::{DeviceCommands, DeviceConnector, DeviceId};
use dbb_utils::{
    log_assert,
    results::{ResultType, TestResult, TestRunResults},
    time::EpochMillis,
};
use futures::future::BoxFuture;
use tracing::instrument;

use crate::{
    backend::InstrumentationBackend, HostDrivenError, InstrumentationError,
    InstrumentationOptions,
};

/// Prefix of the name host-driven results are reported under.
pub const HOST_DRIVEN_TAG: &str = "HostDriven";

/// A test method of fixture `T`.
pub type TestMethod<T> = for<'a> fn(
    &'a mut T,
    &'a mut HostDrivenContext,
) -> BoxFuture<'a, anyhow::Result<TestRunResults>>;

/// The test methods a fixture type exposes, by name.
pub struct TestRegistry<T> {
    methods: Vec<(&'static str, TestMethod<T>)>,
}

impl<T> TestRegistry<T> {
    pub fn new() -> Self {
        Self {
            methods: Vec::new(),
        }
    }

    pub fn with(mut self, name: &'static str, method: TestMethod<T>) -> Self {
        log_assert!(
            self.get(name).is_none(),
            method = name,
            "test method registered more than once"
        );
        self.methods.push((name, method));
        self
    }

    pub fn get(&self, name: &str) -> Option<TestMethod<T>> {
        self.methods
            .iter()
            .find(|(registered, _)| *registered == name)
            .map(|(_, method)| *method)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.iter().map(|(name, _)| *name)
    }
}

impl<T> Default for TestRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A fixture whose test methods run on the host and drive a device.
#[async_trait]
pub trait HostDrivenTest: Send + Sized + 'static {
    /// Name test names are qualified with, conventionally the fixture's type name.
    const TYPE_NAME: &'static str;

    fn test_methods() -> TestRegistry<Self>;

    async fn set_up(&mut self, _ctx: &mut HostDrivenContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn tear_down(&mut self, _ctx: &mut HostDrivenContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    SetUp,
    Running,
    TornDown,
}

/// Where host-driven tests run, and what they run Java tests with.
#[derive(Clone)]
pub struct TestEnvironment {
    pub connector: Arc<dyn DeviceConnector>,
    pub instrumentation: Arc<dyn InstrumentationBackend>,
    /// Build output directory, `<source root>/out/<build type>`.
    pub out_dir: PathBuf,
}

impl TestEnvironment {
    pub fn new(
        connector: Arc<dyn DeviceConnector>,
        instrumentation: Arc<dyn InstrumentationBackend>,
        source_root: &Path,
        build_type: &str,
    ) -> Self {
        Self {
            connector,
            instrumentation,
            out_dir: source_root.join("out").join(build_type),
        }
    }
}

/// The device a test case was set up against.
pub struct DeviceBinding {
    pub device: DeviceId,
    pub shard_index: usize,
    pub push_deps: bool,
    pub cleanup_test_files: bool,
    pub commands: Arc<dyn DeviceCommands>,
    instrumentation: Arc<dyn InstrumentationBackend>,
    out_dir: PathBuf,
}

/// What a test method sees of its test case.
pub struct HostDrivenContext {
    tagged_name: String,
    instrumentation_options: Option<InstrumentationOptions>,
    ports_to_forward: Vec<u16>,
    binding: Option<DeviceBinding>,
}

impl HostDrivenContext {
    fn new(tagged_name: String, instrumentation_options: Option<InstrumentationOptions>) -> Self {
        Self {
            tagged_name,
            instrumentation_options,
            ports_to_forward: Vec::new(),
            binding: None,
        }
    }

    pub fn tagged_name(&self) -> &str {
        &self.tagged_name
    }

    pub fn instrumentation_options(&self) -> Option<&InstrumentationOptions> {
        self.instrumentation_options.as_ref()
    }

    pub fn binding(&self) -> Result<&DeviceBinding, HostDrivenError> {
        self.binding.as_ref().ok_or(HostDrivenError::NotSetUp)
    }

    pub fn device(&self) -> Result<&DeviceId, HostDrivenError> {
        Ok(&self.binding()?.device)
    }

    pub fn device_commands(&self) -> Result<&Arc<dyn DeviceCommands>, HostDrivenError> {
        Ok(&self.binding()?.commands)
    }

    pub fn out_dir(&self) -> Result<&Path, HostDrivenError> {
        Ok(&self.binding()?.out_dir)
    }

    /// Host ports forwarded to the device while each Java test runs.
    pub fn ports_to_forward(&self) -> &[u16] {
        &self.ports_to_forward
    }

    pub fn forward_port(&mut self, port: u16) {
        if !self.ports_to_forward.contains(&port) {
            self.ports_to_forward.push(port);
        }
    }

    /// Runs the Java tests each filter resolves to, in order, and folds them into a single
    /// result named after this test case.
    ///
    /// Stops at the first test that does not pass: the result takes that test's type and log,
    /// and no later test or filter is resolved or run. A filter matching no tests is an error.
    pub async fn run_java_test_filters(
        &self,
        filters: &[&str],
    ) -> Result<TestRunResults, HostDrivenError> {
        let options = self
            .instrumentation_options
            .as_ref()
            .ok_or(HostDrivenError::MissingInstrumentationOptions)?;
        let binding = self.binding()?;
        let mut package = binding.instrumentation.test_package(options);

        let start_time = EpochMillis::now();
        let mut result_type = ResultType::Pass;
        let mut log = String::new();

        'filters: for &filter in filters {
            let tests = package.matching_tests(None, None, Some(filter)).await?;
            if tests.is_empty() {
                return Err(HostDrivenError::NoTestsMatched {
                    filter: filter.to_owned(),
                });
            }

            for test_id in &tests {
                let results =
                    run_java_test(binding, options, &self.ports_to_forward, test_id).await?;
                if let Some(failed) = results.not_pass().next() {
                    tracing::info!(
                        test = %self.tagged_name,
                        java_test = %failed.name,
                        result = %failed.result_type,
                        "java test did not pass"
                    );
                    result_type = failed.result_type;
                    log = failed.log.clone();
                    break 'filters;
                };
            }
        }

        let duration_ms = start_time.millis_until(EpochMillis::now());
        Ok(TestRunResults::single(
            TestResult::new(&self.tagged_name, result_type, start_time, duration_ms)
                .with_log(log),
        ))
    }
}

/// Runs one Java test through a fresh runner, tearing the runner down whatever happens. An
/// error running the test wins over an error tearing down.
#[instrument(
    level = "debug",
    skip(binding, options, ports_to_forward),
    fields(device = %binding.device)
)]
async fn run_java_test(
    binding: &DeviceBinding,
    options: &InstrumentationOptions,
    ports_to_forward: &[u16],
    test_id: &str,
) -> Result<TestRunResults, InstrumentationError> {
    let mut runner = binding.instrumentation.test_runner(
        options,
        &binding.device,
        binding.shard_index,
        ports_to_forward,
    );

    let ran = match runner.set_up().await {
        Ok(()) => runner.run_test(test_id).await,
        Err(e) => Err(e),
    };
    let torn_down = runner.tear_down().await;

    let results = ran?;
    torn_down?;

    log_assert!(
        results.len() == 1,
        test_id,
        num_results = results.len(),
        "a single java test should produce exactly one result"
    );
    Ok(results)
}

/// One test method of fixture `T`, bound to one device and shard.
pub struct HostDrivenTestCase<T: HostDrivenTest> {
    fixture: T,
    test_name: String,
    qualified_name: String,
    method: TestMethod<T>,
    context: HostDrivenContext,
    state: LifecycleState,
}

impl<T: HostDrivenTest> HostDrivenTestCase<T> {
    pub fn new(
        fixture: T,
        test_name: impl Into<String>,
        instrumentation_options: Option<InstrumentationOptions>,
    ) -> Result<Self, HostDrivenError> {
        let test_name = test_name.into();
        let method = T::test_methods().get(&test_name).ok_or_else(|| {
            HostDrivenError::UnknownTestMethod {
                type_name: T::TYPE_NAME,
                test_name: test_name.clone(),
            }
        })?;

        let qualified_name = format!("{}.{}", T::TYPE_NAME, test_name);
        let tagged_name = format!("{HOST_DRIVEN_TAG}_{qualified_name}");

        Ok(Self {
            fixture,
            test_name,
            qualified_name,
            method,
            context: HostDrivenContext::new(tagged_name, instrumentation_options),
            state: LifecycleState::Created,
        })
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// `<TypeName>.<test name>`
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// The name results are reported under: `HostDriven_<TypeName>.<test name>`.
    pub fn tagged_name(&self) -> &str {
        self.context.tagged_name()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn fixture(&self) -> &T {
        &self.fixture
    }

    pub fn context(&self) -> &HostDrivenContext {
        &self.context
    }

    pub fn out_dir(&self) -> Result<&Path, HostDrivenError> {
        self.context.out_dir()
    }

    /// Binds the case to a device. Only fails if the device cannot be connected to, or the
    /// fixture's own set-up fails.
    pub async fn set_up(
        &mut self,
        device: DeviceId,
        shard_index: usize,
        push_deps: bool,
        cleanup_test_files: bool,
        env: &TestEnvironment,
    ) -> Result<(), HostDrivenError> {
        let commands = env.connector.connect(&device)?;
        self.context.binding = Some(DeviceBinding {
            device,
            shard_index,
            push_deps,
            cleanup_test_files,
            commands,
            instrumentation: Arc::clone(&env.instrumentation),
            out_dir: env.out_dir.clone(),
        });
        self.state = LifecycleState::SetUp;

        self.fixture
            .set_up(&mut self.context)
            .await
            .map_err(HostDrivenError::from_test_method)
    }

    pub async fn run(&mut self) -> Result<TestRunResults, HostDrivenError> {
        match self.state {
            LifecycleState::SetUp => {}
            LifecycleState::Created | LifecycleState::TornDown => {
                return Err(HostDrivenError::NotSetUp)
            }
            LifecycleState::Running => return Err(HostDrivenError::AlreadyRan),
        }
        self.state = LifecycleState::Running;

        tracing::info!(test = %self.tagged_name(), "Running host-driven test");
        (self.method)(&mut self.fixture, &mut self.context)
            .await
            .map_err(HostDrivenError::from_test_method)
    }

    /// Runs the fixture's tear-down, if the case was set up, and releases the device.
    pub async fn tear_down(&mut self) -> Result<(), HostDrivenError> {
        if self.state == LifecycleState::TornDown {
            return Ok(());
        }

        let hooked = if self.context.binding.is_some() {
            self.fixture.tear_down(&mut self.context).await
        } else {
            Ok(())
        };
        self.context.binding = None;
        self.state = LifecycleState::TornDown;

        hooked.map_err(HostDrivenError::from_test_method)
    }

    /// Sets up, runs, and always tears down. A set-up or run error wins over a tear-down
    /// error.
    pub async fn run_to_completion(
        mut self,
        device: DeviceId,
        shard_index: usize,
        push_deps: bool,
        cleanup_test_files: bool,
        env: &TestEnvironment,
    ) -> Result<TestRunResults, HostDrivenError> {
        let ran = match self
            .set_up(device, shard_index, push_deps, cleanup_test_files, env)
            .await
        {
            Ok(()) => self.run().await,
            Err(e) => Err(e),
        };
        let torn_down = self.tear_down().await;

        let results = ran?;
        torn_down?;
        Ok(results)
    }
}

impl<T: HostDrivenTest> fmt::Display for HostDrivenTestCase<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tagged_name())
    }
}

impl<T: HostDrivenTest> fmt::Debug for HostDrivenTestCase<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tagged_name())
    }
}
