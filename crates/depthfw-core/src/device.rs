//! Device boundary consumed by the update engine
//!
//! A backend (USB enumeration, a network bridge, the simulator) implements
//! [`DeviceInventory`] to report what is currently reachable. Each device
//! exposes info-key lookups, its sensors, and optional capability handles
//! ([`Updatable`] for a running device, [`UpdateDevice`] for a device sitting
//! in recovery/DFU mode, [`DebugProtocol`] for raw firmware commands).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::trace;

use crate::error::DeviceError;

/// Info fields a device or sensor may expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoKey {
    Name,
    SerialNumber,
    FirmwareVersion,
    /// Identifier that survives the transition into and out of DFU mode
    FirmwareUpdateId,
    ProductId,
    ProductLine,
    UsbTypeDescriptor,
    /// Device node accepting a signed image on MIPI-attached products
    DfuDevicePath,
}

/// Fractional progress sink (0.0 ..= 1.0) handed to long device operations
pub type ProgressCallback<'a> = &'a (dyn Fn(f32) + Send + Sync);

/// Info-key lookups shared by devices and sensors
pub trait InfoSource: Send + Sync {
    fn supports(&self, key: InfoKey) -> bool;

    fn get_info(&self, key: InfoKey) -> Result<String, DeviceError>;
}

/// A sensor belonging to a device
pub trait Sensor: InfoSource {}

/// A reachable device in one inventory snapshot
pub trait Device: InfoSource {
    fn query_sensors(&self) -> Result<Vec<Arc<dyn Sensor>>, DeviceError>;

    /// Capability handle for a device running normal firmware
    fn as_updatable(&self) -> Option<Arc<dyn Updatable>>;

    /// Capability handle for a device in recovery/DFU mode
    fn as_update_device(&self) -> Option<Arc<dyn UpdateDevice>>;

    /// Raw firmware command channel, when the backend exposes one
    fn as_debug_protocol(&self) -> Option<Arc<dyn DebugProtocol>> {
        None
    }

    fn is_updatable(&self) -> bool {
        self.as_updatable().is_some()
    }

    fn is_update_device(&self) -> bool {
        self.as_update_device().is_some()
    }
}

/// Operations of a device running normal firmware
#[async_trait]
pub trait Updatable: Send + Sync {
    /// Ask the device whether it accepts a signed image
    async fn check_firmware_compatibility(&self, image: &[u8]) -> Result<bool, DeviceError>;

    /// Read the full persistent flash; an empty result means unsupported
    async fn create_flash_backup(
        &self,
        progress: ProgressCallback<'_>,
    ) -> Result<Vec<u8>, DeviceError>;

    /// Reboot into the main firmware DFU mode
    async fn enter_update_state(&self) -> Result<(), DeviceError>;

    /// Reboot into the safety co-processor DFU mode
    async fn enter_update_safety_mcu_state(&self) -> Result<(), DeviceError>;

    /// Write an unsigned image without leaving normal mode
    async fn update_unsigned(
        &self,
        image: &[u8],
        progress: ProgressCallback<'_>,
    ) -> Result<(), DeviceError>;
}

/// Operations of a device in recovery/DFU mode
#[async_trait]
pub trait UpdateDevice: Send + Sync {
    async fn update(&self, image: &[u8], progress: ProgressCallback<'_>) -> Result<(), DeviceError>;
}

/// Raw command channel to the device firmware
#[async_trait]
pub trait DebugProtocol: Send + Sync {
    /// Send `opcode` with one parameter and return the raw response
    async fn send_command(&self, opcode: u32, param: u32) -> Result<Vec<u8>, DeviceError>;
}

/// Snapshot query of reachable devices
#[async_trait]
pub trait DeviceInventory: Send + Sync {
    async fn query_devices(&self) -> Result<Vec<Arc<dyn Device>>, DeviceError>;
}

/// Stable identifier correlating one physical device across reconnects
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity(pub String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Resolve the identity of a device, preferring the device-level update
    /// id and falling back to the first sensor's
    pub fn resolve(device: &dyn Device) -> Result<Self, DeviceError> {
        if device.supports(InfoKey::FirmwareUpdateId) {
            return Ok(Self(device.get_info(InfoKey::FirmwareUpdateId)?));
        }

        let sensors = device.query_sensors()?;
        let first = sensors
            .first()
            .ok_or_else(|| DeviceError::NotSupported("FirmwareUpdateId".to_string()))?;
        let id = first.get_info(InfoKey::FirmwareUpdateId)?;
        trace!(id = %id, "Resolved device identity from first sensor");
        Ok(Self(id))
    }

    /// Identity reported at device level, if exposed
    pub fn of_device(device: &dyn Device) -> Result<Option<Self>, DeviceError> {
        if !device.supports(InfoKey::FirmwareUpdateId) {
            return Ok(None);
        }
        Ok(Some(Self(device.get_info(InfoKey::FirmwareUpdateId)?)))
    }

    /// Identity reported by the first sensor, if exposed
    pub fn of_first_sensor(device: &dyn Device) -> Result<Option<Self>, DeviceError> {
        let sensors = device.query_sensors()?;
        match sensors.first() {
            Some(sensor) if sensor.supports(InfoKey::FirmwareUpdateId) => {
                Ok(Some(Self(sensor.get_info(InfoKey::FirmwareUpdateId)?)))
            }
            _ => Ok(None),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
