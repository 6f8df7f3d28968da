//! depthfw Sim - Run a firmware update against a simulated camera
//!
//! Polls the task the way a UI frame loop would and prints new log lines and
//! progress as they appear.

use anyhow::{bail, Result};
use clap::Parser;
use depthfw_core::{FirmwareImage, FirmwareTarget, InfoKey};
use depthfw_sim::{BackupBehavior, SimDevice, SimDeviceSpec, SimInventory};
use depthfw_update::{
    load_config, FirmwareCatalog, FirmwareUpdateWorkflow, SafetyMcuUpdateWorkflow, UpdateTask,
    Workflow,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "depthfw-sim")]
#[command(about = "Drive a firmware update against a simulated depth camera")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "depthfw.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Firmware image to flash; when omitted the bundled image from the
    /// configuration is offered, or a synthetic image if none is configured
    #[arg(short, long)]
    firmware: Option<PathBuf>,

    /// Serial number of the simulated camera
    #[arg(long, default_value = "213622078310")]
    serial: String,

    /// Firmware version the simulated camera reports
    #[arg(long, default_value = "5.13.0.50")]
    camera_version: String,

    /// Product id of the simulated camera (ABCD for the MIPI-attached model)
    #[arg(long, default_value = "0B5C")]
    product_id: String,

    /// DFU node of a MIPI-attached camera
    #[arg(long)]
    dfu_device_path: Option<PathBuf>,

    /// Treat the image as unsigned (written in place, no recovery mode)
    #[arg(long)]
    unsigned: bool,

    /// Update the safety co-processor instead of the main firmware
    #[arg(long)]
    safety_mcu: bool,

    /// Simulated camera never comes back after flashing
    #[arg(long)]
    never_reconnect: bool,

    /// Simulated camera rejects the image
    #[arg(long)]
    incompatible: bool,

    /// Simulated camera cannot dump its flash
    #[arg(long)]
    no_backup: bool,

    /// Print the final task snapshot as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("depthfw-sim v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    let mut spec = SimDeviceSpec::new(args.serial.clone());
    spec.firmware_version = args.camera_version.clone();
    spec.product_id = args.product_id.clone();
    spec.dfu_device_path = args.dfu_device_path.clone();
    spec.faults.never_reconnects = args.never_reconnect;
    spec.faults.incompatible = args.incompatible;
    if args.no_backup {
        spec.faults.backup = BackupBehavior::Unsupported;
    }
    let camera = SimDevice::new(spec);
    let inventory = SimInventory::with_device(camera.clone());

    let Some(device) = camera.handle() else {
        bail!("Simulated camera is not enumerated");
    };

    let target = if args.safety_mcu {
        FirmwareTarget::SafetyMcu
    } else {
        FirmwareTarget::Main
    };
    let catalog = FirmwareCatalog::new(&config.recommended);
    let product_line = device.get_info(InfoKey::ProductLine)?;
    let image = match &args.firmware {
        Some(path) => FirmwareImage::from_file(path, !args.unsigned, target)?,
        None if !args.safety_mcu && catalog.is_recommended_available(&product_line) => {
            match catalog.recommended_update(device.as_ref())? {
                Some(image) => image,
                None => {
                    println!("Camera already runs the recommended firmware");
                    return Ok(());
                }
            }
        }
        None => FirmwareImage::new(vec![0xA5; 256 * 1024], !args.unsigned, target),
    };
    info!(
        target = %image.target(),
        signed = image.is_signed(),
        size = image.len(),
        sha256 = %image.sha256_hex(),
        "Firmware image ready"
    );

    let workflow: Arc<dyn Workflow> = if args.safety_mcu {
        Arc::new(SafetyMcuUpdateWorkflow::new(
            Arc::new(inventory),
            device,
            image,
            &config,
        ))
    } else {
        Arc::new(FirmwareUpdateWorkflow::new(
            Arc::new(inventory),
            device,
            image,
            &config,
        ))
    };

    let task = UpdateTask::from_arc(workflow).with_poll_interval(config.poll_interval());
    let mut updates = task.subscribe();
    task.start()?;

    let mut printed = 0;
    let mut last_progress = -1.0;
    loop {
        let snapshot = updates.borrow_and_update().clone();

        if snapshot.log.len() > printed {
            print!("{}", &snapshot.log[printed..]);
            printed = snapshot.log.len();
        }
        if snapshot.progress != last_progress {
            println!("[{:>5.1}%]", snapshot.progress);
            last_progress = snapshot.progress;
        }
        if snapshot.status.is_terminal() {
            break;
        }
        if updates.changed().await.is_err() {
            break;
        }
    }

    let snapshot = task.snapshot();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    println!("Device events: {:?}", camera.events());

    if let Some(error) = task.check_error() {
        bail!("{} failed: {}", task.process_name(), error);
    }
    println!("{} finished", task.process_name());
    Ok(())
}
