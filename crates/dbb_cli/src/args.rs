use std::path::PathBuf;

use clap::Parser;
use dbb_steps::{options::Properties, StepArgs};

fn parse_properties(s: &str) -> Result<Properties, String> {
    match serde_json::from_str(s) {
        Ok(serde_json::Value::Object(properties)) => Ok(properties),
        Ok(_) => Err("properties must be a JSON object".to_owned()),
        Err(e) => Err(e.to_string()),
    }
}

/// Device buildbot steps
///
/// Provisions the devices attached to an Android tester, runs the requested test steps on
/// them, and always collects device logs afterwards. Progress is printed as buildbot
/// annotations.
#[derive(Parser, Debug)]
#[clap(version = dbb_utils::VERSION)]
pub struct Cli {
    /// Root of the source checkout. Commands run from here.
    #[clap(long, env = "CHROME_SRC")]
    pub source_root: PathBuf,

    /// Build properties, as a JSON object.
    #[clap(long, default_value = "{}", value_parser = parse_properties)]
    pub build_properties: Properties,

    /// Factory properties, as a JSON object. `target` picks the build type.
    #[clap(long, default_value = "{}", value_parser = parse_properties)]
    pub factory_properties: Properties,

    /// Run experimental tests.
    #[clap(long)]
    pub experimental: bool,

    /// Run a test step: chromedriver, unit, ui, webkit, webkit_layout or webrtc.
    #[clap(short = 'f', long = "test-filter", value_name = "FILTER")]
    pub test_filters: Vec<String>,

    /// Run tests with asan.
    #[clap(long)]
    pub asan: bool,

    /// Install an apk by suite name.
    #[clap(long, value_name = "APK_NAME")]
    pub install: Option<String>,

    /// Reboot devices before running tests.
    #[clap(long)]
    pub reboot: bool,

    /// Bucket to store coverage results in. Coverage is only collected if this is set.
    #[clap(long)]
    pub coverage_bucket: Option<String>,

    /// The flakiness dashboard server to upload results to.
    #[clap(long)]
    pub flakiness_server: Option<String>,

    /// Push a script to devices that restarts adbd on disconnections.
    #[clap(long)]
    pub auto_reconnect: bool,

    /// Also write the logcat dump to this file.
    #[clap(long)]
    pub logcat_dump_output: Option<PathBuf>,

    /// Print commands instead of running them, and leave devices alone.
    #[clap(long, env = "DBB_DRY_RUN")]
    pub dry_run: bool,

    /// Config file to use instead of `~/.dbb/config.toml`.
    #[clap(long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn step_args(&self) -> StepArgs {
        StepArgs {
            source_root: self.source_root.clone(),
            build_properties: self.build_properties.clone(),
            factory_properties: self.factory_properties.clone(),
            experimental: self.experimental,
            test_filters: self.test_filters.clone(),
            asan: self.asan,
            install: self.install.clone(),
            reboot: self.reboot,
            coverage_bucket: self.coverage_bucket.clone(),
            flakiness_server: self.flakiness_server.clone(),
            auto_reconnect: self.auto_reconnect,
            logcat_dump_output: self.logcat_dump_output.clone(),
            dry_run: self.dry_run,
        }
    }
}
