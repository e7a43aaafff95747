use std::fmt;

/// Serial prefix adb gives to emulator instances.
const EMULATOR_PREFIX: &str = "emulator-";

/// Opaque name of a physical or virtual device, as adb reports it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_emulator(&self) -> bool {
        self.0.starts_with(EMULATOR_PREFIX)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
