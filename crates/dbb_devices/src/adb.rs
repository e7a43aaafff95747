//! adb-backed implementations of the device interfaces.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dbb_utils::timeout_future::TimeoutFuture;
use tokio::process::Command;

use crate::{DeviceCommands, DeviceConnector, DeviceDiscovery, DeviceError, DeviceId};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_BOOT_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct AdbConfig {
    pub adb_path: PathBuf,
    /// Deadline for any single adb invocation.
    pub command_timeout: Duration,
    /// How long a rebooting device has to report `sys.boot_completed`.
    pub boot_timeout: Duration,
    pub boot_poll_interval: Duration,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            boot_timeout: DEFAULT_BOOT_TIMEOUT,
            boot_poll_interval: DEFAULT_BOOT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug)]
pub struct AdbOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

fn describe(args: &[&str]) -> String {
    format!("adb {}", args.join(" "))
}

#[derive(Debug, Clone)]
pub struct AdbClient {
    config: Arc<AdbConfig>,
}

impl AdbClient {
    pub fn new(config: AdbConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn adb_path(&self) -> &Path {
        &self.config.adb_path
    }

    pub fn config(&self) -> &AdbConfig {
        &self.config
    }

    /// Runs adb, returning its output whether or not it exited successfully.
    pub async fn try_execute(&self, args: &[&str]) -> Result<AdbOutput, DeviceError> {
        self.try_execute_with_timeout(args, self.config.command_timeout)
            .await
    }

    pub async fn try_execute_with_timeout(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> Result<AdbOutput, DeviceError> {
        tracing::debug!(command = %describe(args), "running adb");

        let mut cmd = Command::new(&self.config.adb_path);
        cmd.args(args).kill_on_drop(true);

        let output = TimeoutFuture::new(cmd.output(), timeout)
            .wait()
            .await
            .ok_or_else(|| DeviceError::Timeout {
                command: describe(args),
                timeout,
            })??;

        Ok(AdbOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Runs adb, failing if it exits unsuccessfully. Returns stdout.
    pub async fn execute(&self, args: &[&str]) -> Result<String, DeviceError> {
        let output = self.try_execute(args).await?;
        if !output.success {
            return Err(DeviceError::CommandFailed {
                command: describe(args),
                stderr: output.stderr.trim().to_owned(),
            });
        }
        Ok(output.stdout)
    }

    pub async fn shell(&self, device: &DeviceId, cmd: &[&str]) -> Result<String, DeviceError> {
        let mut args = vec!["-s", device.as_str(), "shell"];
        args.extend_from_slice(cmd);
        self.execute(&args).await
    }

    pub async fn restart_server(&self) -> Result<(), DeviceError> {
        self.execute(&["kill-server"]).await?;
        self.execute(&["start-server"]).await?;
        Ok(())
    }

    pub fn device(&self, device: DeviceId) -> AdbDevice {
        AdbDevice {
            client: self.clone(),
            device,
        }
    }
}

/// Parses the output of `adb devices`, keeping only devices that are online.
pub fn parse_devices_output(output: &str, include_emulators: bool) -> Vec<DeviceId> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty() && !line.starts_with('*') && !line.starts_with("List of devices")
        })
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            (state == "device").then(|| DeviceId::new(serial))
        })
        .filter(|device| include_emulators || !device.is_emulator())
        .collect()
}

#[async_trait]
impl DeviceDiscovery for AdbClient {
    async fn list_attached_devices(
        &self,
        include_emulators: bool,
    ) -> Result<Vec<DeviceId>, DeviceError> {
        let output = self.execute(&["devices"]).await?;
        Ok(parse_devices_output(&output, include_emulators))
    }

    async fn restart_command_server(&self) -> Result<(), DeviceError> {
        self.restart_server().await
    }
}

impl DeviceConnector for AdbClient {
    fn connect(&self, device: &DeviceId) -> Result<Arc<dyn DeviceCommands>, DeviceError> {
        Ok(Arc::new(self.device(device.clone())))
    }
}

/// One device reached through adb.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    client: AdbClient,
    device: DeviceId,
}

impl AdbDevice {
    pub fn client(&self) -> &AdbClient {
        &self.client
    }

    /// A device adb cannot reach anymore is unresponsive, not broken.
    fn classify_unreachable(&self, error: DeviceError) -> DeviceError {
        match error {
            DeviceError::Timeout { command, timeout } => DeviceError::unresponsive(
                &self.device,
                format!("`{command}` timed out after {timeout:?}"),
            ),
            DeviceError::CommandFailed { stderr, .. }
                if stderr.contains("offline") || stderr.contains("not found") =>
            {
                DeviceError::unresponsive(&self.device, stderr)
            }
            other => other,
        }
    }

    async fn wait_for_boot(&self) -> Result<(), DeviceError> {
        let serial = self.device.as_str();
        let config = self.client.config();

        let waited = self
            .client
            .try_execute_with_timeout(&["-s", serial, "wait-for-device"], config.boot_timeout)
            .await
            .map_err(|e| self.classify_unreachable(e))?;
        if !waited.success {
            return Err(DeviceError::unresponsive(
                &self.device,
                waited.stderr.trim(),
            ));
        }

        loop {
            let probe = self
                .client
                .try_execute(&["-s", serial, "shell", "getprop", "sys.boot_completed"])
                .await;
            match probe {
                Ok(out) if out.success && out.stdout.trim() == "1" => return Ok(()),
                Ok(_) | Err(DeviceError::Timeout { .. }) => {}
                Err(e) => return Err(e),
            }
            tokio::time::sleep(config.boot_poll_interval).await;
        }
    }
}

#[async_trait]
impl DeviceCommands for AdbDevice {
    fn device(&self) -> &DeviceId {
        &self.device
    }

    async fn reboot(&self, block_until_ready: bool) -> Result<(), DeviceError> {
        tracing::debug!(device = %self.device, block_until_ready, "rebooting");

        self.client
            .execute(&["-s", self.device.as_str(), "reboot"])
            .await
            .map_err(|e| self.classify_unreachable(e))?;

        if !block_until_ready {
            return Ok(());
        }

        let boot_timeout = self.client.config().boot_timeout;
        match TimeoutFuture::new(self.wait_for_boot(), boot_timeout)
            .wait()
            .await
        {
            Some(result) => result,
            None => Err(DeviceError::unresponsive(
                &self.device,
                format!("did not finish booting within {boot_timeout:?}"),
            )),
        }
    }

    async fn restart_command_server(&self) -> Result<(), DeviceError> {
        self.client.restart_server().await
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use indoc::indoc;

    use super::{parse_devices_output, AdbClient, AdbConfig};
    use crate::{DeviceError, DeviceId};

    const DEVICES: &str = indoc! {"
        * daemon not running; starting now at tcp:5037
        * daemon started successfully
        List of devices attached
        0123456789ABCDEF\tdevice
        emulator-5554\tdevice
        HT9CTP820001\toffline
        FA7AB1A00002\tunauthorized
        ZX1G22KHQK\tdevice

    "};

    #[test]
    fn parses_online_physical_devices_in_order() {
        let devices = parse_devices_output(DEVICES, false);
        assert_eq!(
            devices,
            vec![
                DeviceId::from("0123456789ABCDEF"),
                DeviceId::from("ZX1G22KHQK")
            ]
        );
    }

    #[test]
    fn includes_emulators_on_request() {
        let devices = parse_devices_output(DEVICES, true);
        assert_eq!(devices.len(), 3);
        assert!(devices[1].is_emulator());
    }

    #[test]
    fn no_devices() {
        assert!(parse_devices_output("List of devices attached\n\n", true).is_empty());
    }

    #[tokio::test]
    async fn missing_adb_binary_is_an_io_error() {
        let client = AdbClient::new(AdbConfig {
            adb_path: PathBuf::from("/__dbb_no_such_dir__/adb"),
            ..Default::default()
        });

        let err = client.try_execute(&["devices"]).await.unwrap_err();
        assert!(matches!(err, DeviceError::Io(_)), "{err:?}");
    }

    #[test]
    fn timeouts_while_rebooting_mean_unresponsive() {
        let device = AdbClient::new(AdbConfig::default()).device(DeviceId::from("serial1"));
        let err = device.classify_unreachable(DeviceError::Timeout {
            command: "adb -s serial1 wait-for-device".to_owned(),
            timeout: std::time::Duration::from_secs(1),
        });
        assert!(err.is_unresponsive());

        let err = device.classify_unreachable(DeviceError::CommandFailed {
            command: "adb -s serial1 reboot".to_owned(),
            stderr: "error: device offline".to_owned(),
        });
        assert!(err.is_unresponsive());

        let err = device.classify_unreachable(DeviceError::CommandFailed {
            command: "adb -s serial1 reboot".to_owned(),
            stderr: "error: protocol fault".to_owned(),
        });
        assert!(!err.is_unresponsive());
    }
}
