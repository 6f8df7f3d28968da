//! Generic device update sequence
//!
//! Both update flavours walk the same phases:
//!
//! ```text
//! INITIAL -> BACKING_UP -> [REQUEST_RECOVERY -> WAIT_RECOVERY_DEVICE]
//!         -> FLASHING -> settle -> WAIT_RECONNECT -> DONE
//! ```
//!
//! What differs between them (backup, which recovery entry point, how the
//! recovery device is recognised, timings) is captured by an [`UpdatePlan`].
//!
//! A signed image for a MIPI-attached product skips all of that: the device
//! is told to listen on its DFU node and the image is written to that node
//! directly.

use depthfw_core::{
    Device, DeviceError, DeviceIdentity, DeviceInventory, FirmwareImage, InfoKey, PhaseBoundary,
    UpdateDevice, Updatable,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::backup::save_flash_backup;
use crate::error::UpdateError;
use crate::task::TaskContext;
use crate::waiter::check_for;

pub const RECOVERY_TIMEOUT_MESSAGE: &str = "Recovery device did not connect in time!";
pub const RECONNECT_TIMEOUT_MESSAGE: &str = "Original device did not reconnect in time!";
pub const BACKUP_FAILED_MESSAGE: &str = "WARNING: backup failed; continuing without it...";
pub const MIPI_INCOMPATIBLE_MESSAGE: &str =
    "Firmware Update failed - fw version must be newer than version 5.13.1.1";
pub const MIPI_WRITE_FAILED_MESSAGE: &str =
    "Firmware Update failed - wrong path or permissions missing";

/// Debug command switching a MIPI device to DFU mode
const MIPI_DFU_OPCODE: u32 = 0x1e;
/// Progress once a MIPI device is listening on its DFU node
const MIPI_DFU_PROGRESS: f32 = 30.0;

/// Progress once the flow is running
const INITIAL_PROGRESS: f32 = 5.0;
/// Flash range start when the device was already in recovery mode
const FLASH_START: f32 = 10.0;
/// Flash range start once the backup/recovery branch ran
const FLASH_START_AFTER_RECOVERY: f32 = 40.0;
const FLASH_END: f32 = 90.0;

const BACKUP_PHASE: PhaseBoundary = PhaseBoundary::new(5.0, 30.0);
const BACKUP_GRANULARITY: f32 = 0.2;
const FLASH_GRANULARITY: f32 = 0.1;

/// Entry point used to reboot the device into DFU mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryEntry {
    MainFirmware,
    SafetyMcu,
}

/// How the recovery-mode device is recognised in the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryMatch {
    /// Device-level update id equals the original identity
    SameIdentity,
    /// Any update-capable device; used when the DFU device exposes no id
    AnyUpdateDevice,
}

/// When a running device is sent into recovery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Only signed images go through DFU; unsigned ones are written in place
    SignedOnly,
    Always,
}

impl RecoveryPolicy {
    pub fn applies(self, signed: bool) -> bool {
        match self {
            RecoveryPolicy::SignedOnly => signed,
            RecoveryPolicy::Always => true,
        }
    }
}

/// Declarative description of one update sequence
#[derive(Debug, Clone)]
pub struct UpdatePlan {
    pub process_name: &'static str,
    /// Prefix of the flash narration ("Firmware", "Safety MCU")
    pub image_label: &'static str,
    pub backup: bool,
    /// Ask the device whether it accepts a signed image before touching it
    pub check_compatibility: bool,
    pub recovery_entry: RecoveryEntry,
    pub recovery_match: RecoveryMatch,
    pub recovery_policy: RecoveryPolicy,
    pub recovery_timeout: Duration,
    /// Logged when flashing through the recovery device starts
    pub connected_notice: &'static str,
    /// Appended to the download-completed line before the settle delay
    pub settle_notice: &'static str,
    pub settle: Duration,
    pub reconnect_timeout: Duration,
    pub backup_dir: PathBuf,
    /// Product id whose signed images are written to the DFU device node
    pub mipi_product_id: Option<&'static str>,
}

/// Callback run once when the update fails
pub type CleanupHook = Arc<dyn Fn() + Send + Sync>;

/// One update run of `image` onto `device`, following `plan`
pub struct DeviceUpdateWorkflow {
    plan: UpdatePlan,
    inventory: Arc<dyn DeviceInventory>,
    device: Arc<dyn Device>,
    image: FirmwareImage,
    cleanup_hook: Option<CleanupHook>,
}

impl DeviceUpdateWorkflow {
    pub fn new(
        plan: UpdatePlan,
        inventory: Arc<dyn DeviceInventory>,
        device: Arc<dyn Device>,
        image: FirmwareImage,
    ) -> Self {
        Self {
            plan,
            inventory,
            device,
            image,
            cleanup_hook: None,
        }
    }

    pub fn with_cleanup(mut self, hook: CleanupHook) -> Self {
        self.cleanup_hook = Some(hook);
        self
    }

    pub fn cleanup(&self, ctx: &TaskContext) {
        debug!(task = %ctx.id(), "Running update cleanup");
        if let Some(hook) = &self.cleanup_hook {
            hook();
        }
    }

    pub async fn run(&self, ctx: &TaskContext) -> Result<(), UpdateError> {
        if self.is_mipi_signed_update()? {
            return self.run_mipi(ctx).await;
        }

        let plan = &self.plan;
        let identity = DeviceIdentity::resolve(self.device.as_ref())?;
        ctx.set_target_identity(&identity);
        info!(
            task = %ctx.id(),
            serial = %identity,
            target = %self.image.target(),
            signed = self.image.is_signed(),
            size = self.image.len(),
            "Starting device update"
        );

        ctx.set_progress(INITIAL_PROGRESS);
        let mut flash_start = FLASH_START;
        let mut dfu: Option<Arc<dyn UpdateDevice>> = None;

        if let Some(updatable) = self.device.as_updatable() {
            if plan.check_compatibility && self.image.is_signed() {
                self.check_compatibility(updatable.as_ref()).await?;
            }

            if plan.backup {
                ctx.ensure_active()?;
                self.backup_flash(ctx, updatable.as_ref(), &identity).await;
            }

            flash_start = FLASH_START_AFTER_RECOVERY;

            if plan.recovery_policy.applies(self.image.is_signed()) {
                ctx.ensure_active()?;
                dfu = Some(self.enter_recovery(ctx, updatable.as_ref(), &identity).await?);
            }
        } else if let Some(update_device) = self.device.as_update_device() {
            debug!(task = %ctx.id(), serial = %identity, "Device already in recovery mode");
            dfu = Some(update_device);
        }

        ctx.ensure_active()?;
        let flash_phase = PhaseBoundary::new(flash_start, FLASH_END);
        let on_progress = |fraction: f32| ctx.set_progress(flash_phase.map(fraction, FLASH_GRANULARITY));

        match dfu {
            Some(dfu) => {
                ctx.set_progress(flash_start);
                ctx.log(plan.connected_notice);

                dfu.update(self.image.bytes(), &on_progress).await?;

                ctx.log(format!(
                    "{} Download completed, await DFU transition event{}",
                    plan.image_label, plan.settle_notice
                ));
                ctx.sleep(plan.settle).await?;
            }
            None => {
                let updatable = self.device.as_updatable().ok_or_else(|| {
                    UpdateError::runtime(format!(
                        "{} does not accept firmware updates",
                        self.device_name()
                    ))
                })?;
                updatable
                    .update_unsigned(self.image.bytes(), &on_progress)
                    .await?;
            }
        }
        ctx.log(format!(
            "{} Update completed, waiting for device to reconnect",
            plan.image_label
        ));

        ctx.ensure_active()?;
        let inventory = self.inventory.as_ref();
        let reconnected = check_for(
            ctx,
            || find_original_device(inventory, &identity, ctx),
            || self.cleanup(ctx),
            plan.reconnect_timeout,
        )
        .await?;
        if reconnected.is_none() {
            return Err(UpdateError::runtime(RECONNECT_TIMEOUT_MESSAGE));
        }

        ctx.log("Device reconnected successfully!");
        ctx.complete();
        Ok(())
    }

    fn is_mipi_signed_update(&self) -> Result<bool, DeviceError> {
        let Some(product_id) = self.plan.mipi_product_id else {
            return Ok(false);
        };
        if !self.image.is_signed() || !self.device.supports(InfoKey::ProductId) {
            return Ok(false);
        }
        Ok(self.device.get_info(InfoKey::ProductId)? == product_id)
    }

    /// Signed update of a MIPI-attached device; the device never leaves the
    /// bus, so there is no recovery or reconnect wait
    async fn run_mipi(&self, ctx: &TaskContext) -> Result<(), UpdateError> {
        let compatible = match self.device.as_updatable() {
            Some(updatable) => {
                updatable
                    .check_firmware_compatibility(self.image.bytes())
                    .await?
            }
            None => false,
        };
        if !compatible {
            return Err(UpdateError::runtime(MIPI_INCOMPATIBLE_MESSAGE));
        }

        ctx.log("Burning Signed Firmware on MIPI device");

        let debug = self
            .device
            .as_debug_protocol()
            .ok_or_else(|| DeviceError::NotSupported("Debug protocol".to_string()))?;
        debug.send_command(MIPI_DFU_OPCODE, 1).await?;
        ctx.set_progress(MIPI_DFU_PROGRESS);

        let node = self.device.get_info(InfoKey::DfuDevicePath)?;
        ctx.ensure_active()?;
        if let Err(e) = tokio::fs::write(&node, self.image.bytes()).await {
            warn!(task = %ctx.id(), node = %node, error = %e, "Cannot write firmware to DFU node");
            return Err(UpdateError::runtime(MIPI_WRITE_FAILED_MESSAGE));
        }

        info!(task = %ctx.id(), node = %node, "Firmware Update for MIPI device done.");
        ctx.complete();
        Ok(())
    }

    async fn check_compatibility(&self, updatable: &dyn Updatable) -> Result<(), UpdateError> {
        if updatable
            .check_firmware_compatibility(self.image.bytes())
            .await?
        {
            return Ok(());
        }
        Err(UpdateError::runtime(format!(
            "The firmware version is not compatible with {}",
            self.device_name()
        )))
    }

    /// Dump the flash before it is overwritten; never fails the run
    async fn backup_flash(
        &self,
        ctx: &TaskContext,
        updatable: &dyn Updatable,
        identity: &DeviceIdentity,
    ) {
        ctx.log("Trying to back-up camera flash memory");

        let on_progress =
            |fraction: f32| ctx.set_progress(BACKUP_PHASE.map(fraction, BACKUP_GRANULARITY));

        let status = match updatable.create_flash_backup(&on_progress).await {
            Ok(flash) if flash.is_empty() => "Backup flash is not supported".to_string(),
            Ok(flash) => match save_flash_backup(&self.plan.backup_dir, identity, &flash).await {
                Ok(path) => format!("Backup completed and saved as '{}'", path.display()),
                Err(e) => {
                    warn!(task = %ctx.id(), error = %e, "Failed to write flash backup");
                    BACKUP_FAILED_MESSAGE.to_string()
                }
            },
            Err(e) => {
                warn!(task = %ctx.id(), error = %e, "Flash backup failed");
                BACKUP_FAILED_MESSAGE.to_string()
            }
        };
        ctx.log(status);
    }

    /// Reboot into DFU mode and wait for the recovery device to enumerate
    async fn enter_recovery(
        &self,
        ctx: &TaskContext,
        updatable: &dyn Updatable,
        identity: &DeviceIdentity,
    ) -> Result<Arc<dyn UpdateDevice>, UpdateError> {
        ctx.log("Requesting to switch to recovery mode");
        match self.plan.recovery_entry {
            RecoveryEntry::MainFirmware => updatable.enter_update_state().await?,
            RecoveryEntry::SafetyMcu => updatable.enter_update_safety_mcu_state().await?,
        }

        let inventory = self.inventory.as_ref();
        let matching = self.plan.recovery_match;
        let found = check_for(
            ctx,
            || find_recovery_device(inventory, identity, matching, ctx),
            || self.cleanup(ctx),
            self.plan.recovery_timeout,
        )
        .await?;

        found.ok_or_else(|| UpdateError::runtime(RECOVERY_TIMEOUT_MESSAGE))
    }

    fn device_name(&self) -> String {
        if self.device.supports(InfoKey::Name) {
            if let Ok(name) = self.device.get_info(InfoKey::Name) {
                return name;
            }
        }
        "the device".to_string()
    }
}

/// One inventory scan for the recovery-mode device
///
/// A device failing mid-transition is skipped; only a failing inventory
/// query aborts the wait.
async fn find_recovery_device(
    inventory: &dyn DeviceInventory,
    identity: &DeviceIdentity,
    matching: RecoveryMatch,
    ctx: &TaskContext,
) -> Result<Option<Arc<dyn UpdateDevice>>, UpdateError> {
    let devices = inventory.query_devices().await?;

    for device in devices {
        let Some(update_device) = device.as_update_device() else {
            continue;
        };
        match recovery_matches(device.as_ref(), identity, matching) {
            Ok(true) => {
                match matching {
                    RecoveryMatch::SameIdentity => {
                        ctx.log(format!("DFU device '{}' found", identity))
                    }
                    RecoveryMatch::AnyUpdateDevice => ctx.log("DFU device found"),
                }
                return Ok(Some(update_device));
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    task = %ctx.id(),
                    error = %e,
                    "Error while scanning for the recovery device; Retrying..."
                );
            }
        }
    }
    Ok(None)
}

fn recovery_matches(
    device: &dyn Device,
    identity: &DeviceIdentity,
    matching: RecoveryMatch,
) -> Result<bool, DeviceError> {
    match matching {
        RecoveryMatch::AnyUpdateDevice => Ok(true),
        RecoveryMatch::SameIdentity => {
            Ok(DeviceIdentity::of_device(device)?.as_ref() == Some(identity))
        }
    }
}

/// One inventory scan for the original device, matched on its first
/// sensor's update id
async fn find_original_device(
    inventory: &dyn DeviceInventory,
    identity: &DeviceIdentity,
    ctx: &TaskContext,
) -> Result<Option<()>, UpdateError> {
    let devices = inventory.query_devices().await?;

    for device in devices {
        match DeviceIdentity::of_first_sensor(device.as_ref()) {
            Ok(Some(found)) if &found == identity => {
                ctx.log("Discovered connection of the original device");
                return Ok(Some(()));
            }
            Ok(_) => {}
            Err(e) => trace!(task = %ctx.id(), error = %e, "Skipping device during reconnect scan"),
        }
    }
    Ok(None)
}
