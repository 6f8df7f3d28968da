//! depthfw Update - Background firmware update orchestration
//!
//! This crate drives a device through a multi-phase firmware update:
//! - [`UpdateTask`] owns the task lifecycle and spawns the background worker
//! - [`check_for`] bounds every wait for a hot-plug transition
//! - [`UpdatePlan`] describes one update sequence declaratively, run by
//!   [`DeviceUpdateWorkflow`]
//! - [`FirmwareUpdateWorkflow`] and [`SafetyMcuUpdateWorkflow`] are the two
//!   concrete sequences (primary firmware and safety co-processor)
//! - [`FirmwareCatalog`] offers the bundled image when it is newer than the
//!   device's firmware

pub mod backup;
pub mod catalog;
pub mod config;
pub mod error;
pub mod firmware_update;
pub mod safety_mcu;
pub mod task;
pub mod waiter;
pub mod workflow;

pub use catalog::FirmwareCatalog;
pub use config::{load_config, BundledFirmwareConfig, RecommendedFirmwareConfig, UpdateConfig};
pub use error::UpdateError;
pub use firmware_update::{FirmwareUpdateWorkflow, MIPI_PRODUCT_ID};
pub use safety_mcu::SafetyMcuUpdateWorkflow;
pub use task::{TaskContext, TaskSnapshot, TaskStatus, UpdateTask, Workflow};
pub use waiter::{check_for, UNKNOWN_WAIT_FAILURE};
pub use workflow::{
    CleanupHook, DeviceUpdateWorkflow, RecoveryEntry, RecoveryMatch, RecoveryPolicy, UpdatePlan,
    MIPI_INCOMPATIBLE_MESSAGE, MIPI_WRITE_FAILED_MESSAGE, RECONNECT_TIMEOUT_MESSAGE,
    RECOVERY_TIMEOUT_MESSAGE,
};
