//! The device steps, each announced as its own buildbot step.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use dbb_devices::{reboot::RebootCoordinator, DeviceDiscovery, DeviceId};
use dbb_reporting::Annotator;
use dbb_utils::{
    error::{here, ErrorLocation, ResultLocation},
    exit::ExitCode,
};
use termcolor::WriteColor;

use crate::{
    command::{CommandRunner, RunPolicy, StepCommand},
    error::StepError,
    options::{Coverage, DeviceStepsOptions, TestStep},
    suites::{
        gtest_retries, InstrumentationSuite, CHROME_BETA_PACKAGE, CHROME_STABLE_PACKAGE,
        CHROMIUM_TEST_SHELL_PACKAGE, EXPERIMENTAL_TEST_SUITES, INSTRUMENTATION_SUITES,
        STABLE_TEST_SUITES, WEBRTC_TEST_SUITES,
    },
};

pub const DEFAULT_GSUTIL_PATH: &str = "/b/build/third_party/gsutil/gsutil";

const RUN_WEBKIT_TESTS: &str = "webkit/tools/layout_tests/run_webkit_tests.py";
const TEST_RUNNER: &str = "build/android/test_runner.py";
const INSTALL_APK: &str = "build/android/adb_install_apk.py";

/// Factory properties passed through to the layout test runner as `--<name-with-dashes>`.
const WEBKIT_PASSTHROUGH_PROPERTIES: [&str; 3] =
    ["test_results_server", "driver_name", "additional_drt_flag"];

const HOST_HEARTBEAT: &str = "host_heartbeat";

/// Runs device steps against the bot's devices, writing annotations to `out`.
pub struct DeviceSteps<W> {
    options: DeviceStepsOptions,
    out: Annotator<W>,
    runner: Arc<dyn CommandRunner>,
    reboots: RebootCoordinator,
    discovery: Arc<dyn DeviceDiscovery>,
    gsutil_path: PathBuf,
}

impl<W: WriteColor> DeviceSteps<W> {
    pub fn new(
        options: DeviceStepsOptions,
        out: Annotator<W>,
        runner: Arc<dyn CommandRunner>,
        reboots: RebootCoordinator,
        discovery: Arc<dyn DeviceDiscovery>,
    ) -> Self {
        Self {
            options,
            out,
            runner,
            reboots,
            discovery,
            gsutil_path: PathBuf::from(DEFAULT_GSUTIL_PATH),
        }
    }

    pub fn with_gsutil_path(mut self, gsutil_path: impl Into<PathBuf>) -> Self {
        self.gsutil_path = gsutil_path.into();
        self
    }

    pub fn options(&self) -> &DeviceStepsOptions {
        &self.options
    }

    pub fn annotator(&self) -> &Annotator<W> {
        &self.out
    }

    fn src(&self, relative: &str) -> PathBuf {
        self.options.source_root.join(relative)
    }

    fn build_step(&mut self, name: &str) -> Result<(), StepError> {
        tracing::debug!(step = name, "starting step");
        self.out.build_step(name)?;
        Ok(())
    }

    /// Runs a command, echoing it around the run, and annotates the current step if it fails.
    ///
    /// A non-zero exit fails the step under `flunk_on_failure`, and only warns otherwise or
    /// when the command exits with the policy's warning code. A halting policy turns any other
    /// non-zero exit into [StepError::Halted].
    pub async fn run_cmd(
        &mut self,
        cmd: StepCommand,
        policy: RunPolicy,
    ) -> Result<ExitCode, StepError> {
        let command = cmd.to_string();
        self.out.line(format_args!("> {command}"))?;
        let code = self
            .runner
            .run(&cmd)
            .await
            .map_err(|source| StepError::Spawn {
                command: command.clone(),
                source,
            })?;
        self.out.line(format_args!("< {command}"))?;

        if code.is_success() {
            return Ok(code);
        }

        self.out
            .error_line(format_args!("ERROR: process exited with code {code}"))?;
        let is_warning = code.get() == policy.warning_code;
        if !is_warning && policy.flunk_on_failure {
            self.out.step_failure()?;
        } else {
            self.out.step_warnings()?;
        }

        if !is_warning && policy.halt_on_failure {
            tracing::error!(%command, %code, "halting after failed command");
            self.out
                .error_line(format_args!("FATAL {code} != {}", policy.warning_code))?;
            return Err(StepError::Halted { command, code });
        }
        Ok(code)
    }

    async fn run_default(&mut self, cmd: StepCommand) -> Result<ExitCode, StepError> {
        self.run_cmd(cmd, RunPolicy::default()).await
    }

    /// Starts the logcat monitor in the background, after clearing out logs of earlier runs.
    pub async fn spawn_logcat_monitor(&mut self) -> Result<(), StepError> {
        let logcat_dir = self.options.logcat_dir();
        if let Err(error) = tokio::fs::remove_dir_all(&logcat_dir).await {
            tracing::debug!(?error, dir = %logcat_dir.display(), "no logcat directory to clear");
        }

        let cmd = StepCommand::from_path(&self.src("build/android/adb_logcat_monitor.py"))
            .arg(logcat_dir.display().to_string());
        let command = cmd.to_string();
        self.out.line(format_args!("> {command}"))?;
        self.runner
            .spawn(&cmd)
            .map_err(|source| StepError::Spawn { command, source })?;

        // Give the monitor time to pull the existing logcat.
        self.run_default(StepCommand::new("sleep").arg("5")).await?;
        Ok(())
    }

    pub async fn provision_devices(&mut self) -> Result<(), StepError> {
        self.build_step("provision_devices")?;

        if !self.options.dry_run {
            // A fresh adb server, then a moment for USB discovery.
            self.discovery.restart_command_server().await?;
            self.run_default(StepCommand::new("sleep").arg("1")).await?;
        }

        if self.options.reboot {
            self.reboot_devices().await?;
        }

        let cmd = StepCommand::new("build/android/provision_devices.py")
            .args(["-t", self.options.target.as_str()])
            .arg_if(self.options.auto_reconnect, "--auto-reconnect");
        self.run_default(cmd).await?;
        Ok(())
    }

    /// Reboots every attached device, reporting those that never came back as warnings.
    pub async fn reboot_devices(&mut self) -> Result<(), StepError> {
        if self.options.dry_run {
            return Ok(());
        }

        let devices = self.reboots.attached_devices().await?;
        self.out
            .line(format_args!("Rebooting: {}", device_list(&devices)))?;
        if devices.is_empty() {
            return Ok(());
        }

        let report = self.reboots.reboot_devices(&devices).await?;
        for device in report.failed_devices() {
            tracing::warn!(%device, "device failed to come back after reboot");
            self.out
                .warning_line(format_args!("{device} failed to startup."))?;
        }

        if report.all_healthy() {
            self.out.success_line("Reboots complete.")?;
        } else {
            self.out.step_warnings()?;
        }
        Ok(())
    }

    pub async fn device_status_check(&mut self) -> Result<(), StepError> {
        self.build_step("device_status_check")?;
        self.run_cmd(
            StepCommand::new("build/android/buildbot/bb_device_status_check.py"),
            RunPolicy::halting(),
        )
        .await?;
        Ok(())
    }

    /// Installs a suite's test APK, then the APK under test. Either failing halts the run.
    pub async fn install_apk(
        &mut self,
        suite: &InstrumentationSuite,
        print_step: bool,
    ) -> Result<(), StepError> {
        if print_step {
            self.build_step(&format!("install_{}", suite.name.to_lowercase()))?;
        }
        let release = self.options.target.is_release();

        // The test APK goes first so it is never older than the APK it tests.
        let test_apk = StepCommand::new(INSTALL_APK)
            .args(["--apk".to_owned(), format!("{}.apk", suite.test_apk)])
            .arg_if(release, "--release");
        self.run_cmd(test_apk, RunPolicy::halting()).await?;

        let apk = StepCommand::new(INSTALL_APK)
            .args(["--apk", suite.apk, "--apk_package", suite.apk_package])
            .arg_if(release, "--release");
        self.run_cmd(apk, RunPolicy::halting()).await?;
        Ok(())
    }

    /// Runs each gtest suite as its own step.
    pub async fn run_test_suites(&mut self, suites: &[&str]) -> Result<(), StepError> {
        for &suite in suites {
            self.build_step(suite)?;
            let mut cmd = StepCommand::new(TEST_RUNNER)
                .args(["gtest", "-s", suite, "--verbose"])
                .arg_if(self.options.target.is_release(), "--release")
                .arg_if(self.options.asan, "--tool=asan");
            if let Some(retries) = gtest_retries(suite) {
                cmd = cmd.arg(format!("--num_retries={retries}"));
            }
            self.run_default(cmd).await?;
        }
        Ok(())
    }

    pub async fn run_chromedriver_tests(&mut self) -> Result<(), StepError> {
        self.build_step("chromedriver_annotation")?;
        let cmd = StepCommand::new("chrome/test/chromedriver/run_buildbot_steps.py").arg(format!(
            "--android-packages={CHROMIUM_TEST_SHELL_PACKAGE},{CHROME_STABLE_PACKAGE},{CHROME_BETA_PACKAGE}"
        ));
        self.run_default(cmd).await?;
        Ok(())
    }

    pub async fn run_instrumentation_suite(
        &mut self,
        suite: &InstrumentationSuite,
        flunk_on_failure: bool,
    ) -> Result<(), StepError> {
        self.build_step(&format!(
            "{}_instrumentation_tests",
            suite.name.to_lowercase()
        ))?;
        self.install_apk(suite, false).await?;

        let options = &self.options;
        let mut cmd = StepCommand::new(TEST_RUNNER)
            .args([
                "instrumentation",
                "--test-apk",
                suite.test_apk,
                "--test_data",
                suite.test_data,
                "--verbose",
            ])
            .arg_if(options.target.is_release(), "--release")
            .arg_if(options.asan, "--tool=asan");
        if let Some(server) = &options.flakiness_server {
            cmd = cmd.arg(format!("--flakiness-dashboard-server={server}"));
        }
        if let Some(coverage) = &options.coverage {
            cmd = cmd.arg(format!("--coverage-dir={}", coverage.dir.display()));
        }
        if let Some(root) = suite.host_driven_root {
            cmd = cmd.arg(format!(
                "--host-driven-root={}",
                options.source_root.join(root).display()
            ));
        }
        if let Some(annotation) = suite.annotation {
            cmd = cmd.args(["-A", annotation]);
        }
        if let Some(annotation) = suite.exclude_annotation {
            cmd = cmd.args(["-E", annotation]);
        }
        cmd = cmd.args(suite.extra_flags.iter().copied());

        self.run_cmd(
            cmd,
            RunPolicy {
                flunk_on_failure,
                ..RunPolicy::default()
            },
        )
        .await?;
        Ok(())
    }

    /// Lints the layout test expectation files.
    pub async fn run_webkit_lint(&mut self) -> Result<(), StepError> {
        self.build_step("webkit_lint")?;
        let cmd = StepCommand::new(RUN_WEBKIT_TESTS).args([
            "--lint-test-files",
            "--chromium",
            "--target",
            self.options.target.as_str(),
        ]);
        self.run_default(cmd).await?;
        Ok(())
    }

    /// Runs layout tests on an actual device.
    pub async fn run_webkit_layout_tests(&mut self) -> Result<(), StepError> {
        self.build_step("webkit_tests")?;

        let options = &self.options;
        let builder_name = options.build_property("buildername").unwrap_or_default();
        let mut cmd = StepCommand::new(RUN_WEBKIT_TESTS)
            .args([
                "--no-show-results",
                "--no-new-test-results",
                "--full-results-html",
                "--clobber-old-results",
                "--exit-after-n-failures",
                "5000",
                "--exit-after-n-crashes-or-timeouts",
                "100",
                "--debug-rwt-logging",
                "--results-directory",
                "..layout-test-results",
                "--target",
                options.target.as_str(),
            ])
            .args(["--builder-name".to_owned(), builder_name.clone()])
            .args([
                "--build-number".to_owned(),
                options.build_property("buildnumber").unwrap_or_default(),
            ])
            .args([
                "--master-name".to_owned(),
                options.build_property("mastername").unwrap_or_default(),
            ])
            .args(["--build-name".to_owned(), builder_name])
            .arg("--platform=android");

        for property in WEBKIT_PASSTHROUGH_PROPERTIES {
            if let Some(value) = options.factory_property(property) {
                cmd = cmd.args([format!("--{}", property.replace('_', "-")), value]);
            }
        }

        for key in ["additional_expectations", "additional_expectations_files"] {
            for path in self.expectation_paths(key) {
                cmd = cmd.arg(format!("--additional-expectations={}", path.display()));
            }
        }

        self.run_default(cmd).await?;
        Ok(())
    }

    /// Expectation files listed in a factory property, each as a list of path components
    /// relative to the source root.
    fn expectation_paths(&self, key: &str) -> Vec<PathBuf> {
        let Some(entries) = self.options.factory_properties.get(key) else {
            return vec![];
        };
        let Some(entries) = entries.as_array() else {
            tracing::warn!(key, "expected a list of expectation paths, ignoring");
            return vec![];
        };

        entries
            .iter()
            .filter_map(|entry| {
                let components = entry.as_array()?;
                let mut path = self.options.source_root.clone();
                for component in components {
                    path.push(component.as_str()?);
                }
                Some(path)
            })
            .collect()
    }

    pub async fn run_unit_tests(&mut self) -> Result<(), StepError> {
        self.run_test_suites(STABLE_TEST_SUITES).await
    }

    pub async fn run_instrumentation_tests(&mut self) -> Result<(), StepError> {
        for suite in INSTRUMENTATION_SUITES {
            self.run_instrumentation_suite(suite, true).await?;
        }
        Ok(())
    }

    pub async fn run_webkit_tests(&mut self) -> Result<(), StepError> {
        self.run_test_suites(&["webkit_unit_tests"]).await?;
        self.run_webkit_lint().await
    }

    pub async fn run_webrtc_tests(&mut self) -> Result<(), StepError> {
        self.run_test_suites(WEBRTC_TEST_SUITES).await
    }

    pub async fn run_test_step(&mut self, step: TestStep) -> Result<(), StepError> {
        match step {
            TestStep::Chromedriver => self.run_chromedriver_tests().await,
            TestStep::Unit => self.run_unit_tests().await,
            TestStep::Ui => self.run_instrumentation_tests().await,
            TestStep::Webkit => self.run_webkit_tests().await,
            TestStep::WebkitLayout => self.run_webkit_layout_tests().await,
            TestStep::Webrtc => self.run_webrtc_tests().await,
        }
    }

    /// Runs the requested test steps in their canonical order.
    pub async fn run_steps(&mut self) -> Result<(), StepError> {
        let steps: Vec<_> = self.options.test_steps.iter().copied().collect();
        for step in steps {
            self.run_test_step(step).await?;
        }
        Ok(())
    }

    /// Uploads the directory at `path` to cloud storage under a fresh, unguessable path, and
    /// links the report from the current step.
    pub async fn upload_coverage_data(
        &mut self,
        coverage: &Coverage,
        path: &Path,
        coverage_type: &str,
    ) -> Result<(), StepError> {
        let options = &self.options;
        let revision = options
            .build_property("got_revision")
            .filter(|rev| !rev.is_empty())
            .or_else(|| options.build_property("revision"))
            .unwrap_or_else(|| "testing".to_owned());
        let bot_id = options
            .build_property("buildername")
            .unwrap_or_else(|| "testing".to_owned());
        let gs_path = format!(
            "{}/{coverage_type}/{bot_id}/{revision}/{}",
            coverage.bucket,
            random_hash()
        );

        let cmd = StepCommand::from_path(&self.gsutil_path).args([
            "cp".to_owned(),
            "-R".to_owned(),
            path.display().to_string(),
            format!("gs://{gs_path}"),
        ]);
        self.run_default(cmd).await?;

        self.out.step_link(
            "Coverage report",
            &format!("https://storage.googleapis.com/{gs_path}/index.html"),
        )?;
        Ok(())
    }

    /// Generates an HTML coverage report of the Java code and uploads it.
    pub async fn generate_java_coverage_report(
        &mut self,
        coverage: &Coverage,
    ) -> Result<(), StepError> {
        self.build_step("java_coverage_report")?;

        let coverage_html = coverage.dir.join("coverage_html");
        let cmd = StepCommand::new("build/android/generate_emma_html.py").args([
            "--coverage-dir".to_owned(),
            coverage.dir.display().to_string(),
            "--metadata-dir".to_owned(),
            self.options.out_dir().display().to_string(),
            "--cleanup".to_owned(),
            "--output".to_owned(),
            coverage_html.join("index.html").display().to_string(),
        ]);
        self.run_default(cmd).await?;

        self.upload_coverage_data(coverage, &coverage_html, "java")
            .await
    }

    /// Prints the logcat collected by the monitor, copying it to `logcat_dump_output` if asked.
    pub async fn logcat_dump(&mut self) -> Result<(), StepError> {
        self.build_step("logcat_dump")?;

        let logcat_file = self.options.out_dir().join("full_log");
        let printer = StepCommand::from_path(&self.src("build/android/adb_logcat_printer.py"))
            .arg(self.options.logcat_dir().display().to_string())
            .stdout_to(&logcat_file);
        self.run_default(printer).await?;
        self.run_default(StepCommand::new("cat").arg(logcat_file.display().to_string()))
            .await?;

        if let Some(dest) = self.options.logcat_dump_output.clone() {
            if self.options.dry_run {
                tracing::debug!(dest = %dest.display(), "dry run, not copying logcat");
            } else {
                tokio::fs::copy(&logcat_file, &dest)
                    .await
                    .located(here!())?;
            }
        }
        Ok(())
    }

    /// Prints, then deletes, every test log left in `<out>/test_logs`.
    pub async fn generate_test_report(&mut self) -> Result<(), StepError> {
        self.build_step("test_report")?;

        let logs_dir = self.options.out_dir().join("test_logs");
        for report in test_logs(&logs_dir).await? {
            self.run_default(StepCommand::new("cat").arg(report.display().to_string()))
                .await?;
            tokio::fs::remove_file(&report).await.located(here!())?;
        }
        Ok(())
    }

    /// Kills any host heartbeat left running by device provisioning.
    pub async fn kill_host_heartbeat(&mut self) -> Result<(), StepError> {
        let ps = StepCommand::new("ps").arg("aux");
        let processes = self
            .runner
            .output(&ps)
            .await
            .map_err(|source| StepError::Spawn {
                command: ps.to_string(),
                source,
            })?;

        for pid in heartbeat_pids(&processes) {
            self.out
                .line("An instance of host heart beat running... will kill")?;
            let kill = StepCommand::new("kill").arg(pid.to_string());
            let code = self
                .runner
                .run(&kill)
                .await
                .map_err(|source| StepError::Spawn {
                    command: kill.to_string(),
                    source,
                })?;
            if !code.is_success() {
                tracing::warn!(pid, %code, "failed to kill host heartbeat");
            }
        }
        Ok(())
    }

    async fn main_steps(&mut self) -> Result<(), StepError> {
        self.spawn_logcat_monitor().await?;

        self.provision_devices().await?;
        self.device_status_check().await?;

        if let Some(suite) = self.options.install {
            self.install_apk(suite, true).await?;
        }

        self.run_steps().await?;

        if let Some(coverage) = self.options.coverage.clone() {
            self.generate_java_coverage_report(&coverage).await?;
        }

        if self.options.experimental {
            self.run_test_suites(EXPERIMENTAL_TEST_SUITES).await?;
        }
        Ok(())
    }

    /// Runs device setup, installs, the requested tests, coverage and experimental suites.
    /// Whatever happens, then dumps logcat, prints the test report and kills the host
    /// heartbeat. The first error encountered is the one returned.
    pub async fn main_test_wrapper(&mut self) -> Result<(), StepError> {
        let main = self.main_steps().await;
        if let Err(error) = &main {
            tracing::error!(%error, "device steps stopped early");
        }

        let dumped = self.logcat_dump().await;
        let reported = self.generate_test_report().await;
        let killed = self.kill_host_heartbeat().await;

        main?;
        dumped?;
        reported?;
        killed?;
        Ok(())
    }
}

/// Devices rendered the way the bots have always printed them, e.g. `['a', 'b']`.
fn device_list(devices: &[DeviceId]) -> String {
    let quoted: Vec<_> = devices.iter().map(|d| format!("'{d}'")).collect();
    format!("[{}]", quoted.join(", "))
}

fn random_hash() -> String {
    let seed: f64 = rand::random();
    blake3::hash(seed.to_string().as_bytes()).to_hex().to_string()
}

/// `*.log` files directly under `dir`, sorted. A missing directory has none.
async fn test_logs(dir: &Path) -> Result<Vec<PathBuf>, StepError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.located(here!()).into()),
    };

    let mut logs = vec![];
    while let Some(entry) = entries.next_entry().await.located(here!())? {
        let path = entry.path();
        let is_file = entry.file_type().await.located(here!())?.is_file();
        if is_file && path.extension().map_or(false, |ext| ext == "log") {
            logs.push(path);
        }
    }
    logs.sort();
    Ok(logs)
}

/// PIDs of host heartbeat processes in `ps aux` output: the first numeric column of each
/// matching line. The header line is never a match.
fn heartbeat_pids(ps_output: &str) -> Vec<u32> {
    ps_output
        .lines()
        .skip(1)
        .filter(|line| line.contains(HOST_HEARTBEAT))
        .filter_map(|line| line.split_whitespace().find_map(|col| col.parse().ok()))
        .collect()
}

#[cfg(test)]
mod test {
    use dbb_devices::DeviceId;

    use super::{device_list, heartbeat_pids, random_hash};

    #[test]
    fn device_lists_print_like_lists() {
        assert_eq!(device_list(&[]), "[]");
        assert_eq!(
            device_list(&[DeviceId::from("0123abcd"), DeviceId::from("4567ef")]),
            "['0123abcd', '4567ef']"
        );
    }

    #[test]
    fn finds_heartbeat_pids() {
        let ps = indoc::indoc! {"
            USER       PID %CPU %MEM    VSZ   RSS TTY      STAT START   TIME COMMAND
            chrome-bot  1042  0.0  0.1  41232  9012 ?        S    10:02   0:00 python build/android/host_heartbeat.py
            chrome-bot  1043  0.0  0.1  41232  9012 ?        S    10:02   0:00 python build/android/adb_logcat_monitor.py
            chrome-bot  2211  0.0  0.1  41232  9012 ?        S    10:03   0:00 /usr/bin/host_heartbeat
        "};
        assert_eq!(heartbeat_pids(ps), [1042, 2211]);
        assert!(heartbeat_pids("").is_empty());
    }

    #[test]
    fn random_hashes_differ() {
        let a = random_hash();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, random_hash());
    }
}
