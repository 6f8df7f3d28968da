//! Configuration loading for update timings and backup output

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Interval between two inventory polls while waiting for a device
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Directory receiving flash backups (platform app-data dir when unset)
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    #[serde(default)]
    pub firmware: FirmwareTimingConfig,
    #[serde(default)]
    pub safety_mcu: SafetyMcuTimingConfig,
    #[serde(default)]
    pub recommended: RecommendedFirmwareConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            backup_dir: None,
            firmware: FirmwareTimingConfig::default(),
            safety_mcu: SafetyMcuTimingConfig::default(),
            recommended: RecommendedFirmwareConfig::default(),
        }
    }
}

impl UpdateConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Resolved backup directory
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(crate::backup::default_backup_dir)
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}

/// Timings of the primary firmware update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareTimingConfig {
    /// How long to wait for the DFU device to enumerate
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
    /// Post-flash delay while the device commits the image
    #[serde(default = "default_firmware_settle")]
    pub settle_secs: u64,
    /// How long to wait for the original device to come back
    #[serde(default = "default_firmware_reconnect_timeout")]
    pub reconnect_timeout_secs: u64,
}

impl Default for FirmwareTimingConfig {
    fn default() -> Self {
        Self {
            recovery_timeout_secs: default_recovery_timeout(),
            settle_secs: default_firmware_settle(),
            reconnect_timeout_secs: default_firmware_reconnect_timeout(),
        }
    }
}

/// Timings of the safety co-processor update; its internal commit is slower
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyMcuTimingConfig {
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: u64,
    #[serde(default = "default_safety_mcu_settle")]
    pub settle_secs: u64,
    #[serde(default = "default_safety_mcu_reconnect_timeout")]
    pub reconnect_timeout_secs: u64,
}

impl Default for SafetyMcuTimingConfig {
    fn default() -> Self {
        Self {
            recovery_timeout_secs: default_recovery_timeout(),
            settle_secs: default_safety_mcu_settle(),
            reconnect_timeout_secs: default_safety_mcu_reconnect_timeout(),
        }
    }
}

/// Firmware images shipped with the application, per product line
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecommendedFirmwareConfig {
    /// Release-candidate firmware is in use; bundled images are not offered
    #[serde(default)]
    pub allow_rc_firmware: bool,
    #[serde(default)]
    pub d400: Option<BundledFirmwareConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundledFirmwareConfig {
    pub version: String,
    pub image: PathBuf,
}

fn default_recovery_timeout() -> u64 {
    60
}

fn default_firmware_settle() -> u64 {
    3
}

fn default_firmware_reconnect_timeout() -> u64 {
    60
}

fn default_safety_mcu_settle() -> u64 {
    60
}

fn default_safety_mcu_reconnect_timeout() -> u64 {
    120
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<UpdateConfig> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: UpdateConfig = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(UpdateConfig::default())
    }
}
