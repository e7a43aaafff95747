use std::time::Duration;

use async_trait::async_trait;
use dbb_devices::{adb::AdbClient, DeviceError, DeviceId};
use dbb_utils::{
    results::{ResultType, TestResult, TestRunResults},
    retry::async_retry_n_if,
    time::EpochMillis,
};

use crate::{am_instrument, InstrumentationError, InstrumentationOptions};

const FORWARD_ATTEMPTS: usize = 3;
const FORWARD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Runs Java instrumentation tests on one device.
///
/// Callers pair every [JavaTestRunner::set_up] with a [JavaTestRunner::tear_down], whether or
/// not the tests in between succeeded.
#[async_trait]
pub trait JavaTestRunner: Send {
    async fn set_up(&mut self) -> Result<(), InstrumentationError>;

    /// Runs one test, named `package.Class#method`. A failing test is reported in the
    /// returned results, not as an error.
    async fn run_test(&mut self, test_id: &str) -> Result<TestRunResults, InstrumentationError>;

    async fn tear_down(&mut self) -> Result<(), InstrumentationError>;
}

/// A [JavaTestRunner] driving `am instrument` over adb.
pub struct AmInstrumentRunner {
    client: AdbClient,
    device: DeviceId,
    options: InstrumentationOptions,
    shard_index: usize,
    ports_to_forward: Vec<u16>,
    forwarded: Vec<u16>,
}

impl AmInstrumentRunner {
    pub fn new(
        client: AdbClient,
        device: DeviceId,
        options: InstrumentationOptions,
        shard_index: usize,
        ports_to_forward: Vec<u16>,
    ) -> Self {
        Self {
            client,
            device,
            options,
            shard_index,
            ports_to_forward,
            forwarded: Vec::new(),
        }
    }

    pub fn instrument_args<'a>(&'a self, test_id: &'a str, component: &'a str) -> Vec<&'a str> {
        vec![
            "-s",
            self.device.as_str(),
            "shell",
            "am",
            "instrument",
            "-r",
            "-w",
            "-e",
            "class",
            test_id,
            component,
        ]
    }

    async fn forward_port(&self, port: u16) -> Result<(), DeviceError> {
        let spec = format!("tcp:{port}");
        let args = ["-s", self.device.as_str(), "forward", &spec, &spec];
        let (client, args) = (&self.client, &args[..]);
        async_retry_n_if(
            FORWARD_ATTEMPTS,
            FORWARD_RETRY_DELAY,
            move |_| client.execute(args),
            |e| !matches!(e, DeviceError::Io(_)),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl JavaTestRunner for AmInstrumentRunner {
    async fn set_up(&mut self) -> Result<(), InstrumentationError> {
        tracing::debug!(
            device = %self.device,
            shard = self.shard_index,
            ports = ?self.ports_to_forward,
            "setting up instrumentation runner"
        );

        for port in self.ports_to_forward.clone() {
            self.forward_port(port).await?;
            self.forwarded.push(port);
        }
        Ok(())
    }

    async fn run_test(&mut self, test_id: &str) -> Result<TestRunResults, InstrumentationError> {
        let component = self.options.instrumentation_component();
        let args = self.instrument_args(test_id, &component);

        let start = EpochMillis::now();
        let output = self
            .client
            .try_execute_with_timeout(&args, self.options.test_timeout)
            .await;
        let duration_ms = start.millis_until(EpochMillis::now());

        let result = match output {
            Ok(output) => {
                let parsed = am_instrument::parse(&output.stdout);
                am_instrument::single_test_result(test_id, &parsed, start, duration_ms)
            }
            Err(DeviceError::Timeout { timeout, .. }) => {
                tracing::warn!(test_id, ?timeout, device = %self.device, "java test timed out");
                TestResult::new(test_id, ResultType::Timeout, start, duration_ms)
                    .with_log(format!("test did not finish within {timeout:?}"))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(TestRunResults::single(result))
    }

    async fn tear_down(&mut self) -> Result<(), InstrumentationError> {
        let mut first_error = None;
        for port in std::mem::take(&mut self.forwarded) {
            let spec = format!("tcp:{port}");
            let removed = self
                .client
                .execute(&["-s", self.device.as_str(), "forward", "--remove", &spec])
                .await;
            if let Err(e) = removed {
                tracing::warn!(
                    port,
                    device = %self.device,
                    error = %e,
                    "failed to remove port forward"
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
