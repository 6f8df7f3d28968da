//! Simulated device inventory

use async_trait::async_trait;
use depthfw_core::{Device, DeviceError, DeviceInventory};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

use crate::device::SimDevice;

#[derive(Default)]
struct InventoryState {
    devices: Vec<SimDevice>,
    failing_queries: u32,
    queries: u64,
}

/// Inventory of simulated devices; clones share the same bus
#[derive(Clone, Default)]
pub struct SimInventory {
    inner: Arc<Mutex<InventoryState>>,
}

impl SimInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inventory with a single device plugged in
    pub fn with_device(device: SimDevice) -> Self {
        let inventory = Self::new();
        inventory.add_device(device);
        inventory
    }

    fn state(&self) -> MutexGuard<'_, InventoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_device(&self, device: SimDevice) {
        self.state().devices.push(device);
    }

    /// Make the next `count` queries fail, as enumeration does while a
    /// device is mid-reset
    pub fn fail_next_queries(&self, count: u32) {
        self.state().failing_queries = count;
    }

    /// Number of queries served so far, failed ones included
    pub fn query_count(&self) -> u64 {
        self.state().queries
    }
}

#[async_trait]
impl DeviceInventory for SimInventory {
    async fn query_devices(&self) -> Result<Vec<Arc<dyn Device>>, DeviceError> {
        let devices = {
            let mut state = self.state();
            state.queries += 1;
            if state.failing_queries > 0 {
                state.failing_queries -= 1;
                warn!("Simulated enumeration failure");
                return Err(DeviceError::Backend(
                    "Device enumeration failed while a device was resetting".to_string(),
                ));
            }
            state.devices.clone()
        };

        Ok(devices.iter().filter_map(SimDevice::handle).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDeviceSpec;

    #[tokio::test]
    async fn test_query_lists_enumerated_devices() {
        let inventory = SimInventory::with_device(SimDevice::new(SimDeviceSpec::new("SN-1")));
        inventory.add_device(SimDevice::new(SimDeviceSpec::new("SN-2")));

        let devices = inventory.query_devices().await.unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(inventory.query_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_queries_recover() {
        let inventory = SimInventory::with_device(SimDevice::new(SimDeviceSpec::new("SN-1")));
        inventory.fail_next_queries(1);

        assert!(matches!(
            inventory.query_devices().await,
            Err(DeviceError::Backend(_))
        ));
        assert_eq!(inventory.query_devices().await.unwrap().len(), 1);
        assert_eq!(inventory.query_count(), 2);
    }
}
