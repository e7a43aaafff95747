mod args;
mod config;

use std::sync::Arc;

use clap::Parser;
use dbb_devices::{adb::AdbClient, reboot::RebootCoordinator};
use dbb_reporting::Annotator;
use dbb_steps::{DeviceSteps, DeviceStepsOptions, ProcessRunner, StepError};
use dbb_utils::{exit::ExitCode, log_located_error};
use termcolor::{ColorChoice, StandardStream};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use args::Cli;
use config::{dbb_config_filepath, read_dbb_config, DbbConfig};

/// Filter directives for dbb's own logs, e.g. `DBB_LOG=dbb_devices=debug`.
const DBB_LOG: &str = "DBB_LOG";
/// Set to `1` to log JSON lines.
const DBB_LOG_JSON: &str = "DBB_LOG_JSON";

fn setup_tracing() {
    let filter = EnvFilter::try_from_env(DBB_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var(DBB_LOG_JSON).map_or(false, |v| v == "1");

    // Annotations own stdout.
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() {
    setup_tracing();

    let cli = Cli::parse();
    let exit_code = run(cli);

    std::process::exit(exit_code.get());
}

fn run(cli: Cli) -> ExitCode {
    let config_path = match &cli.config {
        Some(path) => Ok(path.clone()),
        None => dbb_config_filepath(),
    };
    let config = match read_dbb_config(config_path) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(?error, "failed to load config");
            eprintln!("error: {error:#}");
            return ExitCode::DBB_ERROR;
        }
    };

    let options = match DeviceStepsOptions::from_args(cli.step_args()) {
        Ok(options) => options,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("error: failed to start the runtime: {error}");
            return ExitCode::DBB_ERROR;
        }
    };

    runtime.block_on(run_device_steps(options, &config))
}

async fn run_device_steps(options: DeviceStepsOptions, config: &DbbConfig) -> ExitCode {
    let adb = Arc::new(AdbClient::new(config.adb_config()));
    let reboots = RebootCoordinator::new(
        config.reboot_config(options.dry_run),
        adb.clone(),
        adb.clone(),
    );
    let runner = Arc::new(ProcessRunner::new(&options.source_root, options.dry_run));
    let out = Annotator::new(StandardStream::stdout(ColorChoice::Auto));

    let mut steps = DeviceSteps::new(options, out, runner, reboots, adb)
        .with_gsutil_path(config.gsutil_path.clone());

    match steps.main_test_wrapper().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => exit_code_for(error),
    }
}

fn exit_code_for(error: StepError) -> ExitCode {
    match error {
        StepError::Halted { .. } => ExitCode::FAILURE,
        StepError::Internal(located) => {
            eprintln!("error: {located}");
            log_located_error!(located, phase = "device steps");
            ExitCode::DBB_ERROR
        }
        StepError::Io(error) => {
            eprintln!("error: {error}");
            ExitCode::DBB_ERROR
        }
        error @ (StepError::Spawn { .. }
        | StepError::Reboot(_)
        | StepError::Device(_)
        | StepError::InvalidOptions(_)) => {
            tracing::error!(%error, "device steps failed");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
