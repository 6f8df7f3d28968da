//! depthfw Sim - In-memory device inventory with hot-plug transitions
//!
//! Stands in for a USB backend: devices drop off the bus when rebooted,
//! reappear in DFU mode, and come back after flashing. Faults can be
//! injected per device ([`SimFaults`]) or per inventory
//! ([`SimInventory::fail_next_queries`]).

pub mod device;
pub mod inventory;

pub use device::{BackupBehavior, SimDevice, SimDeviceSpec, SimEvent, SimFaults, SimPhase};
pub use inventory::SimInventory;
