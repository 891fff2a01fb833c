//! Drive-level operations: ATA secure erase and pushing configured drive
//! settings to the hardware.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::BlockRef;
use crate::context::AppContext;
use crate::core::capabilities::drive::{DriveAtaProps, DriveProps};
use crate::core::capabilities::{DRIVE, DRIVE_ATA};
use crate::core::jobs::ATA_SECURE_ERASE;
use crate::core::mounts::MountTable;
use crate::core::platform::shell_quote;
use crate::core::{Caller, DriveObject, ObjectGraph, ObjectPath};
use crate::error::StorageError;

/// Time the drive gets to settle after a secure erase before it is probed again.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Fails with `DeviceBusy` if any block on `drive` is mounted, an active
/// swap, or an unlocked encrypted device.
pub fn drive_is_not_in_use(
    graph: &ObjectGraph,
    mounts: &MountTable,
    drive: &DriveObject,
) -> Result<(), StorageError> {
    for block in graph.blocks_on_drive(drive) {
        let name = block.device_name();
        if mounts.is_mounted(block.device.devnum) {
            return Err(StorageError::DeviceBusy(format!("Device {} is mounted", name)));
        }
        if mounts.swap_active(&block.device) {
            return Err(StorageError::DeviceBusy(format!("Swap space {} is active", name)));
        }
        if graph.cleartext_for(block).is_some()
            || graph.unlocked.find_by_crypto_device(block.device.devnum).is_some()
        {
            return Err(StorageError::DeviceBusy(format!(
                "Encrypted device {} is unlocked",
                name
            )));
        }
    }
    Ok(())
}

struct EraseTarget {
    drive: ObjectPath,
    device: String,
    sysfs_path: String,
    ata: DriveAtaProps,
}

fn erase_target(graph: &ObjectGraph, drive: &DriveObject) -> Result<EraseTarget, StorageError> {
    let ata: DriveAtaProps = drive
        .capabilities
        .get(DRIVE_ATA)
        .and_then(|r| r.decode())
        .ok_or_else(|| StorageError::NotSupported("Drive is not an ATA drive".to_string()))?;
    let whole = graph
        .block_for_drive(drive)
        .ok_or_else(|| StorageError::NotFound(format!("No block device for {}", drive.path)))?;
    Ok(EraseTarget {
        drive: drive.path.clone(),
        device: whole.device_name(),
        sysfs_path: whole.device.sysfs_path.clone(),
        ata,
    })
}

/// ATA SECURITY ERASE UNIT on the drive holding `target`.
///
/// The caller must already be authorized for `ata-secure-erase`.
pub(crate) async fn secure_erase_block(
    ctx: &AppContext,
    target: &BlockRef,
    enhanced: bool,
    caller: &Caller,
) -> Result<(), StorageError> {
    let mounts = ctx.manager.mounts().snapshot();
    let erase = ctx.manager.read(|g| {
        let block = g
            .block(&target.path)
            .or_else(|| g.block_for_device_file(&target.device_file))
            .ok_or_else(|| {
                StorageError::NotFound(format!(
                    "Block device {} disappeared",
                    target.device_file.display()
                ))
            })?;
        let drive = g
            .drive_for_block(block)
            .ok_or_else(|| StorageError::NotFound("No drive object".to_string()))?;
        let erase = erase_target(g, drive)?;
        drive_is_not_in_use(g, &mounts, drive)?;
        Ok::<_, StorageError>(erase)
    })?;

    if erase.ata.security_frozen {
        return Err(StorageError::Failed(format!(
            "Security on {} is frozen; power-cycle the drive and try again",
            erase.device
        )));
    }

    let device = shell_quote(&erase.device);
    let erase_flag = if enhanced {
        "--security-erase-enhanced"
    } else {
        "--security-erase"
    };
    let minutes = if enhanced {
        erase.ata.security_enhanced_erase_unit_minutes
    } else {
        erase.ata.security_erase_unit_minutes
    };
    info!(device = %erase.device, enhanced, estimated_minutes = minutes, "Starting ATA secure erase");

    let job = ctx.jobs.begin(&ctx.db, ATA_SECURE_ERASE, &erase.drive, caller).await;
    let result = async {
        ctx.platform
            .run_tool(
                &format!("hdparm --user-master u --security-set-pass NULL {}", device),
                None,
            )
            .await?;
        let erased = ctx
            .platform
            .run_tool(
                &format!("hdparm --user-master u {} NULL {}", erase_flag, device),
                None,
            )
            .await;
        if erased.is_err() {
            let disable = format!("hdparm --user-master u --security-disable NULL {}", device);
            if let Err(e) = ctx.platform.run_tool(&disable, None).await {
                warn!(device = %erase.device, error = %e, "Failed to clear the security password after a failed erase");
            }
        }
        erased
    }
    .await;
    job.finish(&result).await;
    result?;

    tokio::time::sleep(SETTLE_DELAY).await;
    ctx.platform.trigger_uevent(&erase.sysfs_path)?;
    Ok(())
}

/// `hdparm` arguments for the configured settings, empty if nothing is set.
fn hdparm_args(props: &DriveProps, ata: &DriveAtaProps) -> Vec<String> {
    let settings = &props.configuration;
    let mut args = Vec::new();
    if let Some(v) = settings.standby_timeout {
        if ata.pm_supported {
            args.push(format!("-S {}", v));
        }
    }
    if let Some(v) = settings.apm_level {
        if ata.apm_supported {
            args.push(format!("-B {}", v));
        }
    }
    if let Some(v) = settings.aam_level {
        if ata.aam_supported {
            args.push(format!("-M {}", v));
        }
    }
    if let Some(v) = settings.write_cache_enabled {
        if ata.write_cache_supported {
            args.push(format!("-W {}", u8::from(v)));
        }
    }
    args
}

/// Push configured settings to the drive at `path`. Drives without ATA
/// support or without settings are left alone.
pub async fn apply_configuration(ctx: &AppContext, path: &ObjectPath) -> Result<(), StorageError> {
    let found = ctx.manager.read(|g| {
        let drive = g.drive(path)?;
        let props: DriveProps = drive.capabilities.get(DRIVE)?.decode()?;
        let ata: DriveAtaProps = drive.capabilities.get(DRIVE_ATA)?.decode()?;
        let device = g.block_for_drive(drive)?.device_name();
        Some((props, ata, device))
    });
    let Some((props, ata, device)) = found else {
        debug!(drive = %path, "Not an ATA drive, skipping configuration");
        return Ok(());
    };

    let args = hdparm_args(&props, &ata);
    if args.is_empty() {
        return Ok(());
    }
    let command = format!("hdparm {} {}", args.join(" "), shell_quote(&device));
    ctx.platform.run_tool(&command, None).await?;
    info!(drive = %path, "Applied drive configuration");
    Ok(())
}
