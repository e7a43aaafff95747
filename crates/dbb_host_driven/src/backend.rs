use dbb_devices::{adb::AdbClient, DeviceId};

use crate::{
    package::ListedTestPackage, runner::AmInstrumentRunner, InstrumentationOptions,
    JavaTestRunner, TestPackage,
};

/// Builds the instrumentation collaborators a host-driven test delegates to.
pub trait InstrumentationBackend: Send + Sync {
    fn test_package(&self, options: &InstrumentationOptions) -> Box<dyn TestPackage>;

    fn test_runner(
        &self,
        options: &InstrumentationOptions,
        device: &DeviceId,
        shard_index: usize,
        ports_to_forward: &[u16],
    ) -> Box<dyn JavaTestRunner>;
}

#[derive(Debug, Clone)]
pub struct AdbInstrumentationBackend {
    client: AdbClient,
}

impl AdbInstrumentationBackend {
    pub fn new(client: AdbClient) -> Self {
        Self { client }
    }
}

impl InstrumentationBackend for AdbInstrumentationBackend {
    fn test_package(&self, options: &InstrumentationOptions) -> Box<dyn TestPackage> {
        Box::new(ListedTestPackage::new(options.test_listing_path()))
    }

    fn test_runner(
        &self,
        options: &InstrumentationOptions,
        device: &DeviceId,
        shard_index: usize,
        ports_to_forward: &[u16],
    ) -> Box<dyn JavaTestRunner> {
        Box::new(AmInstrumentRunner::new(
            self.client.clone(),
            device.clone(),
            options.clone(),
            shard_index,
            ports_to_forward.to_vec(),
        ))
    }
}
