//! Bundled firmware lookup by product line

use depthfw_core::{
    is_upgradeable, Device, FirmwareError, FirmwareImage, FirmwareTarget, InfoKey, ProductLine,
};
use tracing::{debug, info};

use crate::config::{BundledFirmwareConfig, RecommendedFirmwareConfig};
use crate::error::UpdateError;

/// Firmware images shipped with the application
#[derive(Debug, Clone, Default)]
pub struct FirmwareCatalog {
    allow_rc_firmware: bool,
    d400: Option<BundledFirmwareConfig>,
}

impl FirmwareCatalog {
    pub fn new(config: &RecommendedFirmwareConfig) -> Self {
        Self {
            allow_rc_firmware: config.allow_rc_firmware,
            d400: config.d400.clone(),
        }
    }

    fn bundle(&self, product_line: &str) -> Option<&BundledFirmwareConfig> {
        let bundle = match product_line.parse::<ProductLine>() {
            Ok(ProductLine::D400) => self.d400.as_ref(),
            Err(_) => None,
        }?;
        (!bundle.version.is_empty()).then_some(bundle)
    }

    /// Version of the image bundled for `product_line`
    pub fn available_version(&self, product_line: &str) -> Option<&str> {
        self.bundle(product_line).map(|bundle| bundle.version.as_str())
    }

    pub fn is_recommended_available(&self, product_line: &str) -> bool {
        self.available_version(product_line).is_some()
    }

    /// Signed image bundled for `product_line`
    ///
    /// Withheld while release-candidate firmware is allowed, so a newer RC
    /// is never replaced by the bundled release.
    pub fn default_image(&self, product_line: &str) -> Result<Option<FirmwareImage>, FirmwareError> {
        if self.allow_rc_firmware {
            return Ok(None);
        }
        let Some(bundle) = self.bundle(product_line) else {
            return Ok(None);
        };
        FirmwareImage::from_file(&bundle.image, true, FirmwareTarget::Main).map(Some)
    }

    /// Bundled image for `device`, only when it is newer than what the
    /// device runs
    pub fn recommended_update(
        &self,
        device: &dyn Device,
    ) -> Result<Option<FirmwareImage>, UpdateError> {
        if !device.supports(InfoKey::ProductLine) {
            return Ok(None);
        }
        let product_line = device.get_info(InfoKey::ProductLine)?;
        let Some(available) = self.available_version(&product_line) else {
            debug!(product_line = %product_line, "No bundled firmware for product line");
            return Ok(None);
        };

        let current = if device.supports(InfoKey::FirmwareVersion) {
            device.get_info(InfoKey::FirmwareVersion)?
        } else {
            String::new()
        };
        if !is_upgradeable(&current, available) {
            info!(current = %current, available = %available, "Device firmware is up to date");
            return Ok(None);
        }

        info!(
            current = %current,
            available = %available,
            "Recommended firmware update available"
        );
        Ok(self.default_image(&product_line)?)
    }
}
