mod common;

use std::time::Duration;

use common::*;
use depthfw_core::FirmwareTarget;
use depthfw_sim::{SimDevice, SimDeviceSpec, SimEvent, SimPhase};
use depthfw_update::{TaskStatus, RECONNECT_TIMEOUT_MESSAGE};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn safety_mcu_update_goes_through_dfu_without_backup() {
    let rig = Rig::new(camera());
    let task = rig.safety_mcu_task(safety_mcu_image());

    let started = Instant::now();
    let (snapshot, history) = run_recording_progress(&task).await;

    assert_eq!(snapshot.status, TaskStatus::Done, "{}", snapshot.log);
    assert_eq!(snapshot.progress, 100.0);
    assert_non_decreasing(&history);
    // DFU enumeration 2s + flash 2s + 60s settle; the reboot overlaps the settle
    assert!(started.elapsed() >= Duration::from_secs(64));

    assert_in_order(
        &snapshot.log,
        &[
            "Started Safety MCU Update process",
            "Requesting to switch to recovery mode",
            "DFU device found",
            "Recovery device connected, starting update",
            "Safety MCU Download completed, await DFU transition event\n\
             Internal write is in progress\n\
             Please DO NOT DISCONNECT the camera (might take a few minutes)",
            "Safety MCU Update completed, waiting for device to reconnect",
            "Discovered connection of the original device",
            "Device reconnected successfully!",
        ],
    );
    assert!(!snapshot.log.contains("back-up"));

    assert_eq!(
        rig.camera.events(),
        vec![
            SimEvent::EnterSafetyMcuState,
            SimEvent::DfuUpdate {
                target: FirmwareTarget::SafetyMcu,
                size: IMAGE_SIZE
            },
        ]
    );
    assert!(rig.backup_files().is_empty());
}

#[tokio::test(start_paused = true)]
async fn recovery_device_without_identity_is_accepted() {
    let mut spec = camera();
    spec.dfu_exposes_id = false;
    let rig = Rig::new(spec);
    let task = rig.safety_mcu_task(safety_mcu_image());

    task.start().unwrap();
    let snapshot = task.wait().await;

    assert!(snapshot.done(), "{}", snapshot.log);
}

#[tokio::test(start_paused = true)]
async fn recovery_wait_accepts_any_update_device() {
    let rig = Rig::new(camera());
    let mut other = SimDeviceSpec::new("999999999999");
    other.start_in_dfu = true;
    let bystander = SimDevice::new(other);
    rig.inventory.add_device(bystander.clone());
    let task = rig.safety_mcu_task(safety_mcu_image());

    task.start().unwrap();
    let snapshot = task.wait().await;

    // The first update-capable device wins, even though it is another camera
    assert_eq!(
        bystander.events(),
        vec![SimEvent::DfuUpdate {
            target: FirmwareTarget::Main,
            size: IMAGE_SIZE
        }]
    );
    assert_eq!(rig.camera.phase(), SimPhase::Dfu(FirmwareTarget::SafetyMcu));
    assert_eq!(snapshot.last_error.as_deref(), Some(RECONNECT_TIMEOUT_MESSAGE));
}

#[tokio::test(start_paused = true)]
async fn reconnect_deadline_is_two_minutes() {
    let mut spec = camera();
    spec.faults.never_reconnects = true;
    let rig = Rig::new(spec);
    let task = rig.safety_mcu_task(safety_mcu_image());

    let started = Instant::now();
    task.start().unwrap();
    let snapshot = task.wait().await;
    let elapsed = started.elapsed();

    assert_eq!(snapshot.last_error.as_deref(), Some(RECONNECT_TIMEOUT_MESSAGE));
    assert_eq!(snapshot.progress, 0.0);
    // DFU enumeration 2s + flash 2s + settle 60s, then the 120s wait
    assert!(elapsed >= Duration::from_secs(184), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(186), "{:?}", elapsed);
}
