use serde_derive::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the unix epoch, as recorded on test results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EpochMillis(u64);

impl EpochMillis {
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(since_epoch.as_millis() as u64)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Milliseconds from `self` until `later`, saturating at zero if the clock went backwards.
    pub fn millis_until(self, later: EpochMillis) -> u64 {
        later.0.saturating_sub(self.0)
    }
}
