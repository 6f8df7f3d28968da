//! Flash backup persistence
//!
//! A backup is the raw flash dump of the device, written before anything is
//! flashed, as `<identity>.<YYYYMMDD_HHMMSS>.bin` in the application data
//! directory. No header, no compression.

use chrono::{DateTime, Local};
use depthfw_core::{sha256_hex, DeviceIdentity};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Folder created under the platform data directory
const APP_DIR_NAME: &str = "depthfw";

/// Platform application data directory used when no backup dir is configured
pub fn default_backup_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

/// File name of a backup taken at `timestamp`
pub fn backup_file_name(identity: &DeviceIdentity, timestamp: DateTime<Local>) -> String {
    format!("{}.{}.bin", identity, timestamp.format("%Y%m%d_%H%M%S"))
}

/// Write a flash dump to `dir`, returning the created file path
pub async fn save_flash_backup(
    dir: &Path,
    identity: &DeviceIdentity,
    flash: &[u8],
) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;

    let path = dir.join(backup_file_name(identity, Local::now()));
    tokio::fs::write(&path, flash).await?;

    debug!(
        path = %path.display(),
        size = flash.len(),
        sha256 = %sha256_hex(flash),
        "Flash backup written"
    );
    Ok(path)
}
