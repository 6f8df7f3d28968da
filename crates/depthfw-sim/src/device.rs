//! Simulated depth camera
//!
//! A [`SimDevice`] moves through the same bus states as real hardware:
//!
//! ```text
//! Normal --enter_update_state--> Offline --dfu_delay--> Dfu
//! Dfu --update--> Offline --reboot_delay--> Normal
//! ```
//!
//! A handle returned by [`SimDevice::handle`] belongs to one enumeration:
//! once the device has moved to another bus state, every call on it fails
//! with [`DeviceError::Disconnected`].
//!
//! Timing uses `tokio::time`, so tests running on a paused clock see the
//! transitions instantly and deterministically.

use async_trait::async_trait;
use depthfw_core::{
    DebugProtocol, Device, DeviceError, FirmwareTarget, InfoKey, InfoSource, ProgressCallback,
    Sensor, UpdateDevice, Updatable,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const BACKUP_STEPS: u32 = 5;
const FLASH_STEPS: u32 = 10;

/// Outcome of a flash backup request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupBehavior {
    #[default]
    Dump,
    /// Device returns an empty dump
    Unsupported,
    Fail,
}

/// Injected failures
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    /// Compatibility check rejects every image
    pub incompatible: bool,
    pub backup: BackupBehavior,
    /// Firmware write fails half way through
    pub flash_error: bool,
    /// Firmware write panics half way through
    pub panic_on_flash: bool,
    /// Device drops off the bus but never shows up in DFU mode
    pub never_enters_dfu: bool,
    /// Device never comes back after flashing
    pub never_reconnects: bool,
    /// Number of update-id lookups on the DFU device that fail before it
    /// answers
    pub dfu_info_failures: u32,
}

/// Static description of a simulated device
#[derive(Debug, Clone)]
pub struct SimDeviceSpec {
    pub identity: String,
    pub name: String,
    pub firmware_version: String,
    pub product_id: String,
    pub product_line: String,
    /// DFU node of a MIPI-attached device
    pub dfu_device_path: Option<PathBuf>,
    /// Flash contents returned by a backup
    pub flash: Vec<u8>,
    /// Normal-mode device reports its update id at device level
    pub expose_device_id: bool,
    /// DFU-mode device reports its update id
    pub dfu_exposes_id: bool,
    /// Device enumerates in DFU mode from the start
    pub start_in_dfu: bool,
    pub dfu_delay: Duration,
    pub reboot_delay: Duration,
    /// Delay between two progress reports of a backup or flash
    pub io_step: Duration,
    pub faults: SimFaults,
}

impl SimDeviceSpec {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            name: "Depth Camera D455".to_string(),
            firmware_version: "5.13.0.50".to_string(),
            product_id: "0B5C".to_string(),
            product_line: "D400".to_string(),
            dfu_device_path: None,
            flash: vec![0x5A; 4096],
            expose_device_id: true,
            dfu_exposes_id: true,
            start_in_dfu: false,
            dfu_delay: Duration::from_secs(2),
            reboot_delay: Duration::from_secs(5),
            io_step: Duration::from_millis(200),
            faults: SimFaults::default(),
        }
    }
}

/// Calls observed by a simulated device, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    CompatibilityChecked,
    BackupRead,
    EnterUpdateState,
    EnterSafetyMcuState,
    DfuUpdate {
        target: FirmwareTarget,
        size: usize,
    },
    UnsignedUpdate {
        size: usize,
    },
    DebugCommand {
        opcode: u32,
        param: u32,
    },
}

/// Bus state of a simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimPhase {
    Normal,
    Dfu(FirmwareTarget),
    /// Off the bus, rebooting
    Offline,
}

struct SimState {
    phase: SimPhase,
    pending: Option<(Instant, SimPhase)>,
    events: Vec<SimEvent>,
    dfu_info_failures: u32,
}

impl SimState {
    fn advance(&mut self, now: Instant) -> bool {
        match self.pending {
            Some((at, next)) if now >= at => {
                self.phase = next;
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}

/// Shared handle to one simulated device
#[derive(Clone)]
pub struct SimDevice {
    spec: Arc<SimDeviceSpec>,
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub fn new(spec: SimDeviceSpec) -> Self {
        let phase = if spec.start_in_dfu {
            SimPhase::Dfu(FirmwareTarget::Main)
        } else {
            SimPhase::Normal
        };
        let state = SimState {
            phase,
            pending: None,
            events: Vec::new(),
            dfu_info_failures: spec.faults.dfu_info_failures,
        };
        Self {
            spec: Arc::new(spec),
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn spec(&self) -> &SimDeviceSpec {
        &self.spec
    }

    pub fn identity(&self) -> &str {
        &self.spec.identity
    }

    /// Current bus state, applying any transition that is due
    pub fn phase(&self) -> SimPhase {
        let mut state = self.state();
        if state.advance(Instant::now()) {
            debug!(serial = %self.spec.identity, phase = ?state.phase, "Simulated device changed phase");
        }
        state.phase
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state().events.clone()
    }

    /// Device handle as currently enumerated, `None` while off the bus
    pub fn handle(&self) -> Option<Arc<dyn Device>> {
        let mode = match self.phase() {
            SimPhase::Normal => HandleMode::Normal,
            SimPhase::Dfu(target) => HandleMode::Dfu(target),
            SimPhase::Offline => return None,
        };
        Some(Arc::new(SimHandle {
            device: self.clone(),
            mode,
        }))
    }

    fn record(&self, event: SimEvent) {
        debug!(serial = %self.spec.identity, event = ?event, "Simulated device call");
        self.state().events.push(event);
    }

    /// Drop off the bus and come back as `next` after `delay`
    fn reboot(&self, next: Option<SimPhase>, delay: Duration) {
        let mut state = self.state();
        state.phase = SimPhase::Offline;
        state.pending = next.map(|phase| (Instant::now() + delay, phase));
    }

    fn reboot_into_dfu(&self, target: FirmwareTarget) {
        let next = (!self.spec.faults.never_enters_dfu).then_some(SimPhase::Dfu(target));
        self.reboot(next, self.spec.dfu_delay);
    }

    fn reboot_into_normal(&self) {
        let next = (!self.spec.faults.never_reconnects).then_some(SimPhase::Normal);
        self.reboot(next, self.spec.reboot_delay);
    }

    async fn write_image(
        &self,
        function: &str,
        image: &[u8],
        progress: ProgressCallback<'_>,
    ) -> Result<(), DeviceError> {
        for step in 1..=FLASH_STEPS {
            tokio::time::sleep(self.spec.io_step).await;

            if step == FLASH_STEPS / 2 {
                if self.spec.faults.panic_on_flash {
                    panic!("simulated firmware write crashed");
                }
                if self.spec.faults.flash_error {
                    return Err(DeviceError::protocol(
                        function,
                        format!("{} bytes", image.len()),
                        "Firmware write failed",
                    ));
                }
            }
            progress(step as f32 / FLASH_STEPS as f32);
        }
        Ok(())
    }

    fn take_dfu_info_failure(&self) -> bool {
        let mut state = self.state();
        if state.dfu_info_failures == 0 {
            return false;
        }
        state.dfu_info_failures -= 1;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleMode {
    Normal,
    Dfu(FirmwareTarget),
}

/// One enumeration of a simulated device
#[derive(Clone)]
struct SimHandle {
    device: SimDevice,
    mode: HandleMode,
}

impl SimHandle {
    /// Fails once the device left the bus state this handle was created in
    fn ensure_present(&self) -> Result<(), DeviceError> {
        let enumerated = match self.mode {
            HandleMode::Normal => SimPhase::Normal,
            HandleMode::Dfu(target) => SimPhase::Dfu(target),
        };
        if self.device.phase() == enumerated {
            Ok(())
        } else {
            Err(DeviceError::Disconnected(self.device.spec.identity.clone()))
        }
    }
}

impl InfoSource for SimHandle {
    fn supports(&self, key: InfoKey) -> bool {
        let spec = &self.device.spec;
        match self.mode {
            HandleMode::Normal => match key {
                InfoKey::FirmwareUpdateId => spec.expose_device_id,
                InfoKey::DfuDevicePath => spec.dfu_device_path.is_some(),
                _ => true,
            },
            HandleMode::Dfu(_) => match key {
                InfoKey::FirmwareUpdateId => spec.dfu_exposes_id,
                InfoKey::Name | InfoKey::ProductId => true,
                _ => false,
            },
        }
    }

    fn get_info(&self, key: InfoKey) -> Result<String, DeviceError> {
        if !self.supports(key) {
            return Err(DeviceError::NotSupported(format!("{:?}", key)));
        }
        self.ensure_present()?;
        if matches!(self.mode, HandleMode::Dfu(_))
            && key == InfoKey::FirmwareUpdateId
            && self.device.take_dfu_info_failure()
        {
            return Err(DeviceError::Disconnected(self.device.spec.identity.clone()));
        }

        let spec = &self.device.spec;
        let value = match key {
            InfoKey::Name => match self.mode {
                HandleMode::Normal => spec.name.clone(),
                HandleMode::Dfu(_) => format!("{} Recovery", spec.name),
            },
            InfoKey::SerialNumber | InfoKey::FirmwareUpdateId => spec.identity.clone(),
            InfoKey::FirmwareVersion => spec.firmware_version.clone(),
            InfoKey::ProductId => spec.product_id.clone(),
            InfoKey::ProductLine => spec.product_line.clone(),
            InfoKey::UsbTypeDescriptor => "3.2".to_string(),
            InfoKey::DfuDevicePath => spec
                .dfu_device_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
        };
        Ok(value)
    }
}

impl Device for SimHandle {
    fn query_sensors(&self) -> Result<Vec<Arc<dyn Sensor>>, DeviceError> {
        self.ensure_present()?;
        match self.mode {
            HandleMode::Normal => Ok(vec![
                Arc::new(SimSensor::new("Stereo Module", &self.device.spec.identity)),
                Arc::new(SimSensor::new("RGB Camera", &self.device.spec.identity)),
            ]),
            HandleMode::Dfu(_) => Ok(Vec::new()),
        }
    }

    fn as_updatable(&self) -> Option<Arc<dyn Updatable>> {
        match self.mode {
            HandleMode::Normal => Some(Arc::new(self.clone())),
            HandleMode::Dfu(_) => None,
        }
    }

    fn as_update_device(&self) -> Option<Arc<dyn UpdateDevice>> {
        match self.mode {
            HandleMode::Dfu(_) => Some(Arc::new(self.clone())),
            HandleMode::Normal => None,
        }
    }

    fn as_debug_protocol(&self) -> Option<Arc<dyn DebugProtocol>> {
        match self.mode {
            HandleMode::Normal => Some(Arc::new(self.clone())),
            HandleMode::Dfu(_) => None,
        }
    }
}

#[async_trait]
impl Updatable for SimHandle {
    async fn check_firmware_compatibility(&self, image: &[u8]) -> Result<bool, DeviceError> {
        self.ensure_present()?;
        self.device.record(SimEvent::CompatibilityChecked);
        if image.is_empty() {
            return Err(DeviceError::protocol(
                "check_firmware_compatibility",
                "0 bytes",
                "Empty firmware image",
            ));
        }
        Ok(!self.device.spec.faults.incompatible)
    }

    async fn create_flash_backup(
        &self,
        progress: ProgressCallback<'_>,
    ) -> Result<Vec<u8>, DeviceError> {
        self.ensure_present()?;
        self.device.record(SimEvent::BackupRead);
        match self.device.spec.faults.backup {
            BackupBehavior::Unsupported => Ok(Vec::new()),
            BackupBehavior::Fail => Err(DeviceError::protocol(
                "create_flash_backup",
                "",
                "Flash read timed out",
            )),
            BackupBehavior::Dump => {
                for step in 1..=BACKUP_STEPS {
                    tokio::time::sleep(self.device.spec.io_step).await;
                    progress(step as f32 / BACKUP_STEPS as f32);
                }
                Ok(self.device.spec.flash.clone())
            }
        }
    }

    async fn enter_update_state(&self) -> Result<(), DeviceError> {
        self.ensure_present()?;
        self.device.record(SimEvent::EnterUpdateState);
        self.device.reboot_into_dfu(FirmwareTarget::Main);
        Ok(())
    }

    async fn enter_update_safety_mcu_state(&self) -> Result<(), DeviceError> {
        self.ensure_present()?;
        self.device.record(SimEvent::EnterSafetyMcuState);
        self.device.reboot_into_dfu(FirmwareTarget::SafetyMcu);
        Ok(())
    }

    async fn update_unsigned(
        &self,
        image: &[u8],
        progress: ProgressCallback<'_>,
    ) -> Result<(), DeviceError> {
        self.ensure_present()?;
        self.device.record(SimEvent::UnsignedUpdate { size: image.len() });
        self.device
            .write_image("update_unsigned", image, progress)
            .await?;
        self.device.reboot_into_normal();
        Ok(())
    }
}

#[async_trait]
impl UpdateDevice for SimHandle {
    async fn update(&self, image: &[u8], progress: ProgressCallback<'_>) -> Result<(), DeviceError> {
        self.ensure_present()?;
        let target = match self.mode {
            HandleMode::Dfu(target) => target,
            HandleMode::Normal => FirmwareTarget::Main,
        };
        self.device.record(SimEvent::DfuUpdate {
            target,
            size: image.len(),
        });
        self.device.write_image("update", image, progress).await?;
        self.device.reboot_into_normal();
        Ok(())
    }
}

/// A MIPI device listens on its DFU node once told to; the bus state does
/// not change
#[async_trait]
impl DebugProtocol for SimHandle {
    async fn send_command(&self, opcode: u32, param: u32) -> Result<Vec<u8>, DeviceError> {
        self.ensure_present()?;
        self.device.record(SimEvent::DebugCommand { opcode, param });
        Ok(Vec::new())
    }
}

struct SimSensor {
    name: String,
    identity: String,
}

impl SimSensor {
    fn new(name: &str, identity: &str) -> Self {
        Self {
            name: name.to_string(),
            identity: identity.to_string(),
        }
    }
}

impl InfoSource for SimSensor {
    fn supports(&self, key: InfoKey) -> bool {
        matches!(
            key,
            InfoKey::Name | InfoKey::SerialNumber | InfoKey::FirmwareUpdateId
        )
    }

    fn get_info(&self, key: InfoKey) -> Result<String, DeviceError> {
        match key {
            InfoKey::Name => Ok(self.name.clone()),
            InfoKey::SerialNumber | InfoKey::FirmwareUpdateId => Ok(self.identity.clone()),
            other => Err(DeviceError::NotSupported(format!("{:?}", other))),
        }
    }
}

impl Sensor for SimSensor {}

#[cfg(test)]
mod tests {
    use super::*;
    use depthfw_core::DeviceIdentity;

    fn no_progress(_: f32) {}

    #[tokio::test(start_paused = true)]
    async fn test_dfu_round_trip_follows_delays() {
        let device = SimDevice::new(SimDeviceSpec::new("SN-1"));
        let handle = device.handle().unwrap();
        assert_eq!(DeviceIdentity::resolve(handle.as_ref()).unwrap().as_str(), "SN-1");

        let updatable = handle.as_updatable().unwrap();
        updatable.enter_update_state().await.unwrap();
        assert_eq!(device.phase(), SimPhase::Offline);
        assert!(device.handle().is_none());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(device.phase(), SimPhase::Dfu(FirmwareTarget::Main));

        let dfu = device.handle().unwrap().as_update_device().unwrap();
        dfu.update(&[1, 2, 3], &no_progress).await.unwrap();
        assert_eq!(device.phase(), SimPhase::Offline);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(device.phase(), SimPhase::Normal);
        assert_eq!(
            device.events(),
            vec![
                SimEvent::EnterUpdateState,
                SimEvent::DfuUpdate {
                    target: FirmwareTarget::Main,
                    size: 3
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_reconnects_stays_offline() {
        let mut spec = SimDeviceSpec::new("SN-1");
        spec.faults.never_reconnects = true;
        let device = SimDevice::new(spec);

        let updatable = device.handle().unwrap().as_updatable().unwrap();
        updatable.update_unsigned(&[0; 8], &no_progress).await.unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(device.phase(), SimPhase::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flash_reports_fractional_progress() {
        let device = SimDevice::new(SimDeviceSpec::new("SN-1"));
        let updatable = device.handle().unwrap().as_updatable().unwrap();
        let seen = Mutex::new(Vec::new());
        let record = |fraction: f32| seen.lock().unwrap().push(fraction);

        updatable.update_unsigned(&[0; 8], &record).await.unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), FLASH_STEPS as usize);
        assert_eq!(seen.last().copied(), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flash_error_is_protocol_error() {
        let mut spec = SimDeviceSpec::new("SN-1");
        spec.faults.flash_error = true;
        let device = SimDevice::new(spec);
        let updatable = device.handle().unwrap().as_updatable().unwrap();

        let err = updatable
            .update_unsigned(&[0; 8], &no_progress)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "update_unsigned(8 bytes):\nFirmware write failed");
        assert_eq!(device.phase(), SimPhase::Normal);
    }

    #[test]
    fn test_dfu_handle_hides_identity_when_configured() {
        let mut spec = SimDeviceSpec::new("SN-1");
        spec.start_in_dfu = true;
        spec.dfu_exposes_id = false;
        let device = SimDevice::new(spec);

        let handle = device.handle().unwrap();
        assert!(handle.is_update_device());
        assert!(!handle.is_updatable());
        assert!(!handle.supports(InfoKey::FirmwareUpdateId));
        assert_eq!(handle.get_info(InfoKey::Name).unwrap(), "Depth Camera D455 Recovery");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_handle_reports_disconnect() {
        let device = SimDevice::new(SimDeviceSpec::new("SN-1"));
        let handle = device.handle().unwrap();
        let updatable = handle.as_updatable().unwrap();
        updatable.enter_update_state().await.unwrap();

        let err = updatable
            .check_firmware_compatibility(&[1, 2, 3])
            .await
            .unwrap_err();
        assert_eq!(err, DeviceError::Disconnected("SN-1".to_string()));
        assert!(handle.get_info(InfoKey::FirmwareUpdateId).is_err());
        assert!(updatable.enter_update_state().await.is_err());

        // Still stale once the device shows up in DFU mode
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(updatable.create_flash_backup(&no_progress).await.is_err());
        assert!(handle.query_sensors().is_err());
        assert_eq!(device.events(), vec![SimEvent::EnterUpdateState]);

        let fresh = device.handle().unwrap();
        assert!(fresh.as_update_device().is_some());
        assert_eq!(fresh.get_info(InfoKey::FirmwareUpdateId).unwrap(), "SN-1");
    }

    #[tokio::test]
    async fn test_mipi_device_exposes_dfu_node_and_debug_channel() {
        let mut spec = SimDeviceSpec::new("SN-1");
        spec.dfu_device_path = Some(PathBuf::from("/dev/d4xx-dfu-a"));
        let device = SimDevice::new(spec);
        let handle = device.handle().unwrap();

        assert_eq!(
            handle.get_info(InfoKey::DfuDevicePath).unwrap(),
            "/dev/d4xx-dfu-a"
        );
        handle
            .as_debug_protocol()
            .unwrap()
            .send_command(0x1e, 1)
            .await
            .unwrap();
        assert_eq!(device.phase(), SimPhase::Normal);
        assert_eq!(
            device.events(),
            vec![SimEvent::DebugCommand {
                opcode: 0x1e,
                param: 1
            }]
        );

        let plain = SimDevice::new(SimDeviceSpec::new("SN-2")).handle().unwrap();
        assert!(!plain.supports(InfoKey::DfuDevicePath));
    }

    #[test]
    fn test_dfu_info_failures_are_transient() {
        let mut spec = SimDeviceSpec::new("SN-1");
        spec.start_in_dfu = true;
        spec.faults.dfu_info_failures = 2;
        let device = SimDevice::new(spec);
        let handle = device.handle().unwrap();

        assert!(handle.get_info(InfoKey::FirmwareUpdateId).is_err());
        assert!(handle.get_info(InfoKey::FirmwareUpdateId).is_err());
        assert_eq!(handle.get_info(InfoKey::FirmwareUpdateId).unwrap(), "SN-1");
    }
}
