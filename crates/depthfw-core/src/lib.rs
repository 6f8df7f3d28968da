//! depthfw Core - Device boundary, firmware images and progress mapping
//!
//! This crate provides the foundational types for the depthfw update engine:
//! - Device inventory and capability traits implemented by device backends
//! - Device identity used to correlate devices across disconnect/reconnect
//! - Firmware images, targets and version comparison
//! - Phase progress aggregation into one overall percentage
//! - The error taxonomy shared by every layer

pub mod device;
pub mod error;
pub mod firmware;
pub mod progress;

pub use device::{
    DebugProtocol, Device, DeviceIdentity, DeviceInventory, InfoKey, InfoSource,
    ProgressCallback, Sensor, UpdateDevice, Updatable,
};
pub use error::{DeviceError, ErrorKind};
pub use firmware::{
    is_upgradeable, sha256_hex, FirmwareError, FirmwareImage, FirmwareTarget, FirmwareVersion,
    ProductLine,
};
pub use progress::{map_progress, PhaseBoundary};
