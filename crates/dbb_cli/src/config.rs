use std::{fs, io, num::NonZeroUsize, path::PathBuf, time::Duration};

use anyhow::Context;
use dbb_devices::{
    adb::{AdbConfig, DEFAULT_COMMAND_TIMEOUT},
    reboot::{RebootConfig, DEFAULT_MAX_REBOOT_WORKERS, DEFAULT_REBOOT_TIMEOUT},
};
use dbb_steps::steps::DEFAULT_GSUTIL_PATH;
use etcetera::{app_strategy, AppStrategy, AppStrategyArgs};
use serde_derive::Deserialize;

/// Per-bot settings that rarely change between runs.
#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DbbConfig {
    pub adb_path: PathBuf,
    pub adb_command_timeout_secs: u64,
    pub reboot_timeout_secs: u64,
    pub max_reboot_workers: NonZeroUsize,
    pub boot_poll_interval_ms: u64,
    pub boot_timeout_secs: u64,
    pub gsutil_path: PathBuf,
}

impl Default for DbbConfig {
    fn default() -> Self {
        let adb = AdbConfig::default();
        Self {
            adb_path: adb.adb_path,
            adb_command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
            reboot_timeout_secs: DEFAULT_REBOOT_TIMEOUT.as_secs(),
            max_reboot_workers: NonZeroUsize::new(DEFAULT_MAX_REBOOT_WORKERS)
                .unwrap_or(NonZeroUsize::MIN),
            boot_poll_interval_ms: adb.boot_poll_interval.as_millis() as u64,
            boot_timeout_secs: adb.boot_timeout.as_secs(),
            gsutil_path: PathBuf::from(DEFAULT_GSUTIL_PATH),
        }
    }
}

impl DbbConfig {
    pub fn adb_config(&self) -> AdbConfig {
        AdbConfig {
            adb_path: self.adb_path.clone(),
            command_timeout: Duration::from_secs(self.adb_command_timeout_secs),
            boot_timeout: Duration::from_secs(self.boot_timeout_secs),
            boot_poll_interval: Duration::from_millis(self.boot_poll_interval_ms),
        }
    }

    pub fn reboot_config(&self, dry_run: bool) -> RebootConfig {
        RebootConfig {
            max_workers: self.max_reboot_workers,
            timeout: Duration::from_secs(self.reboot_timeout_secs),
            dry_run,
        }
    }
}

/// `~/.dbb/config.toml`
pub fn dbb_config_filepath() -> anyhow::Result<PathBuf> {
    let strategy = app_strategy::Unix::new(AppStrategyArgs {
        top_level_domain: "org".to_string(),
        author: "chromium".to_string(),
        app_name: "dbb".to_string(),
    })?;
    Ok(strategy.config_dir().join("config.toml"))
}

/// Reads the config at `path`. A missing file means the defaults.
pub fn read_dbb_config(path: anyhow::Result<PathBuf>) -> anyhow::Result<DbbConfig> {
    let path = path?;
    let toml_str = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(DbbConfig::default());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let config = toml::from_str(&toml_str)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}
