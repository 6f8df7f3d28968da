#![allow(dead_code)]

use std::sync::Arc;

use depthfw_core::{FirmwareImage, FirmwareTarget};
use depthfw_sim::{SimDevice, SimDeviceSpec, SimInventory};
use depthfw_update::{
    FirmwareUpdateWorkflow, SafetyMcuUpdateWorkflow, TaskSnapshot, UpdateConfig, UpdateTask,
};
use tempfile::TempDir;

pub const SERIAL: &str = "213622078310";
pub const IMAGE_SIZE: usize = 1024;

/// One simulated camera on its own bus, with a scratch backup directory
pub struct Rig {
    pub camera: SimDevice,
    pub inventory: SimInventory,
    pub config: UpdateConfig,
    pub backup_dir: TempDir,
}

impl Rig {
    pub fn new(spec: SimDeviceSpec) -> Self {
        let camera = SimDevice::new(spec);
        let inventory = SimInventory::with_device(camera.clone());
        let backup_dir = TempDir::new().unwrap();
        let config = UpdateConfig {
            backup_dir: Some(backup_dir.path().to_path_buf()),
            ..UpdateConfig::default()
        };
        Self {
            camera,
            inventory,
            config,
            backup_dir,
        }
    }

    pub fn firmware_workflow(&self, image: FirmwareImage) -> FirmwareUpdateWorkflow {
        let device = self.camera.handle().expect("camera is enumerated");
        FirmwareUpdateWorkflow::new(Arc::new(self.inventory.clone()), device, image, &self.config)
    }

    pub fn firmware_task(&self, image: FirmwareImage) -> UpdateTask {
        UpdateTask::new(self.firmware_workflow(image))
    }

    pub fn safety_mcu_task(&self, image: FirmwareImage) -> UpdateTask {
        let device = self.camera.handle().expect("camera is enumerated");
        UpdateTask::new(SafetyMcuUpdateWorkflow::new(
            Arc::new(self.inventory.clone()),
            device,
            image,
            &self.config,
        ))
    }

    pub fn backup_files(&self) -> Vec<std::path::PathBuf> {
        std::fs::read_dir(self.backup_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }
}

pub fn camera() -> SimDeviceSpec {
    SimDeviceSpec::new(SERIAL)
}

pub fn signed_image() -> FirmwareImage {
    FirmwareImage::new(vec![0xA5; IMAGE_SIZE], true, FirmwareTarget::Main)
}

pub fn unsigned_image() -> FirmwareImage {
    FirmwareImage::new(vec![0xA5; IMAGE_SIZE], false, FirmwareTarget::Main)
}

pub fn safety_mcu_image() -> FirmwareImage {
    FirmwareImage::new(vec![0x3C; IMAGE_SIZE], true, FirmwareTarget::SafetyMcu)
}

/// Start the task and record every progress value observed until it ends
pub async fn run_recording_progress(task: &UpdateTask) -> (TaskSnapshot, Vec<f32>) {
    let mut updates = task.subscribe();
    task.start().unwrap();

    let mut history = Vec::new();
    loop {
        let snapshot = updates.borrow_and_update().clone();
        history.push(snapshot.progress);
        if snapshot.status.is_terminal() {
            return (snapshot, history);
        }
        updates.changed().await.unwrap();
    }
}

/// Every entry of `expected` appears in `log`, in order
pub fn assert_in_order(log: &str, expected: &[&str]) {
    let mut rest = log;
    for line in expected {
        match rest.find(line) {
            Some(at) => rest = &rest[at + line.len()..],
            None => panic!("{:?} missing or out of order in log:\n{}", line, log),
        }
    }
}

pub fn assert_non_decreasing(history: &[f32]) {
    assert!(
        history.windows(2).all(|pair| pair[0] <= pair[1]),
        "progress went backwards: {:?}",
        history
    );
}
