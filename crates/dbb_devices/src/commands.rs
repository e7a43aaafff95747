use std::sync::Arc;

use async_trait::async_trait;

use crate::{DeviceError, DeviceId};

/// Commands issued against one device.
#[async_trait]
pub trait DeviceCommands: Send + Sync {
    fn device(&self) -> &DeviceId;

    /// Reboots the device. With `block_until_ready`, resolves only once the device's command
    /// interface answers again, failing with [DeviceError::Unresponsive] if it never does.
    async fn reboot(&self, block_until_ready: bool) -> Result<(), DeviceError>;

    /// Restarts the host-side server the device is reached through.
    async fn restart_command_server(&self) -> Result<(), DeviceError>;
}

/// Builds a [DeviceCommands] handle for a device.
pub trait DeviceConnector: Send + Sync {
    fn connect(&self, device: &DeviceId) -> Result<Arc<dyn DeviceCommands>, DeviceError>;
}

/// Host-side view of the attached devices.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    /// Lists online devices in the order the host reports them.
    async fn list_attached_devices(
        &self,
        include_emulators: bool,
    ) -> Result<Vec<DeviceId>, DeviceError>;

    async fn restart_command_server(&self) -> Result<(), DeviceError>;
}
