//! Safety co-processor firmware update
//!
//! Same shape as the primary update without the backup. The device always
//! goes through DFU mode, and its recovery device does not report an update
//! id yet, so any update-capable device in the inventory is accepted. The
//! co-processor commits its image slowly, hence the long settle delay and
//! reconnect deadline.

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

pub const PROCESS_NAME: &str = "Safety MCU Update";

pub struct SafetyMcuUpdateWorkflow {
    inner: DeviceUpdateWorkflow,
}

impl SafetyMcuUpdateWorkflow {
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

    pub fn plan(config: &UpdateConfig) -> UpdatePlan {
        let timing = &config.safety_mcu;
        UpdatePlan {
            process_name: PROCESS_NAME,
            image_label: "Safety MCU",
            backup: false,
            check_compatibility: false,
            recovery_entry: RecoveryEntry::SafetyMcu,
            // TODO: match on the update id once the co-processor DFU device reports it
            recovery_match: RecoveryMatch::AnyUpdateDevice,
            recovery_policy: RecoveryPolicy::Always,
            recovery_timeout: Duration::from_secs(timing.recovery_timeout_secs),
            connected_notice: "Recovery device connected, starting update",
            settle_notice: "\nInternal write is in progress\n\
                            Please DO NOT DISCONNECT the camera (might take a few minutes)",
            settle: Duration::from_secs(timing.settle_secs),
            reconnect_timeout: Duration::from_secs(timing.reconnect_timeout_secs),
            backup_dir: config.backup_dir(),
            mipi_product_id: None,
        }
    }

    pub fn with_cleanup(mut self, hook: CleanupHook) -> Self {
        self.inner = self.inner.with_cleanup(hook);
        self
    }
}

#[async_trait]
impl Workflow for SafetyMcuUpdateWorkflow {
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
