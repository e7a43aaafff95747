//! Devices attached to a bot, and the operations the step driver performs on all of them.

pub mod adb;
pub mod commands;
pub mod device;
pub mod error;
pub mod reboot;

pub use commands::{DeviceCommands, DeviceConnector, DeviceDiscovery};
pub use device::DeviceId;
pub use error::DeviceError;
