//! Primary device firmware update
//!
//! Signed images go through the device's recovery (DFU) mode: back up the
//! flash, reboot into DFU, flash through the recovery device, then wait for
//! the original device to come back. Unsigned images are written in place.
//! Signed images for the MIPI-attached product go straight to its DFU node.

use async_trait::async_trait;
use depthfw_core::{Device, DeviceInventory, FirmwareImage};
use std::sync::Arc;
use std::time::Duration;

use crate::config::UpdateConfig;
use crate::error::UpdateError;
use crate::task::{TaskContext, Workflow};
use crate::workflow::{
    CleanupHook, DeviceUpdateWorkflow, RecoveryEntry, RecoveryMatch, RecoveryPolicy, UpdatePlan,
};

pub const PROCESS_NAME: &str = "Firmware Update";

/// Product id of the MIPI-attached camera
pub const MIPI_PRODUCT_ID: &str = "ABCD";

pub struct FirmwareUpdateWorkflow {
    inner: DeviceUpdateWorkflow,
}

impl FirmwareUpdateWorkflow {
    pub fn new(
        inventory: Arc<dyn DeviceInventory>,
        device: Arc<dyn Device>,
        image: FirmwareImage,
        config: &UpdateConfig,
    ) -> Self {
        Self {
            inner: DeviceUpdateWorkflow::new(Self::plan(config), inventory, device, image),
        }
    }

    /// Phase descriptor of the primary firmware update
    pub fn plan(config: &UpdateConfig) -> UpdatePlan {
        let timing = &config.firmware;
        UpdatePlan {
            process_name: PROCESS_NAME,
            image_label: "Firmware",
            backup: true,
            check_compatibility: true,
            recovery_entry: RecoveryEntry::MainFirmware,
            recovery_match: RecoveryMatch::SameIdentity,
            recovery_policy: RecoveryPolicy::SignedOnly,
            recovery_timeout: Duration::from_secs(timing.recovery_timeout_secs),
            connected_notice: "Recovery device connected, starting update..\n\
                               Internal write is in progress\n\
                               Please DO NOT DISCONNECT the camera",
            settle_notice: "",
            settle: Duration::from_secs(timing.settle_secs),
            reconnect_timeout: Duration::from_secs(timing.reconnect_timeout_secs),
            backup_dir: config.backup_dir(),
            mipi_product_id: Some(MIPI_PRODUCT_ID),
        }
    }

    /// Callback run once if the update fails
    pub fn with_cleanup(mut self, hook: CleanupHook) -> Self {
        self.inner = self.inner.with_cleanup(hook);
        self
    }
}

#[async_trait]
impl Workflow for FirmwareUpdateWorkflow {
    fn process_name(&self) -> &str {
        PROCESS_NAME
    }

    fn cleanup(&self, ctx: &TaskContext) {
        self.inner.cleanup(ctx);
    }

    async fn process_flow(&self, ctx: &TaskContext) -> Result<(), UpdateError> {
        self.inner.run(ctx).await
    }
}
