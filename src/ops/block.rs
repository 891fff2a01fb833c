//! Block operations other than format: rescan, raw device access, partition
//! type changes and configuration record management.

use std::fs::File;

use tracing::{info, warn};

use super::{lookup_block, open_action};
use crate::context::AppContext;
use crate::core::capabilities::PARTITION;
use crate::core::capabilities::block::PartitionProps;
use crate::core::configuration::{BlockIdentity, ConfigurationItem};
use crate::core::platform::shell_quote;
use crate::core::{Action, BlockObject, Caller, ObjectPath, OpenMode};
use crate::error::StorageError;

/// Re-probe the block: emit a `change` uevent and, for whole disks, ask the
/// kernel to re-read the partition table.
pub async fn rescan(ctx: &AppContext, path: &ObjectPath, caller: &Caller) -> Result<(), StorageError> {
    let block = lookup_block(ctx, path)?;
    ctx.authority
        .check(
            caller,
            Action::Rescan,
            &format!("Authentication is required to rescan {}", block.device_name()),
        )
        .await?;

    ctx.platform.trigger_uevent(&block.device.sysfs_path)?;
    if block.device.is_disk() {
        if let Some(device) = block.device_file() {
            if let Err(e) = ctx.platform.reread_partition_table(device) {
                warn!(device = %device.display(), error = %e, "Partition table re-read failed");
            }
        }
    }
    Ok(())
}

/// Open the raw device on behalf of the caller. The returned file is handed
/// to the client over the socket.
pub async fn open_for(
    ctx: &AppContext,
    path: &ObjectPath,
    mode: OpenMode,
    caller: &Caller,
) -> Result<File, StorageError> {
    let block = lookup_block(ctx, path)?;
    let device = super::device_file(&block)?;
    let purpose = match mode {
        OpenMode::Backup => "backup",
        OpenMode::Restore => "restore",
        OpenMode::Benchmark { .. } => "benchmarking",
        OpenMode::Erase => "erasing",
    };
    ctx.authority
        .check(
            caller,
            open_action(&block),
            &format!(
                "Authentication is required to open {} for {}",
                block.device_name(),
                purpose
            ),
        )
        .await?;

    let file = ctx.platform.open_device(&device, mode)?;
    info!(device = %device.display(), ?mode, uid = caller.uid, "Opened device for client");
    Ok(file)
}

/// Rewrite the type of `partition` in its table with `sfdisk`.
pub(crate) async fn set_partition_type(
    ctx: &AppContext,
    partition: &BlockObject,
    part_type: &str,
) -> Result<(), StorageError> {
    let props: PartitionProps = partition
        .capabilities
        .get(PARTITION)
        .and_then(|r| r.decode())
        .ok_or_else(|| {
            StorageError::NotSupported(format!("{} is not a partition", partition.device_name()))
        })?;
    let table = ctx
        .manager
        .read(|g| g.partition_table_of(partition).cloned())
        .ok_or_else(|| {
            StorageError::NotFound(format!(
                "No partition table for {}",
                partition.device_name()
            ))
        })?;

    let command = format!(
        "sfdisk --part-type {} {} {}",
        shell_quote(&table.device_name()),
        props.number,
        shell_quote(part_type)
    );
    ctx.platform.run_tool(&command, None).await?;
    ctx.platform.trigger_uevent(&partition.device.sysfs_path)?;
    info!(partition = %partition.path, part_type, "Partition type updated");
    Ok(())
}

fn track_parents(item: &ConfigurationItem) -> bool {
    match item {
        ConfigurationItem::Fstab(i) => i.track_parents,
        ConfigurationItem::Crypttab(i) => i.track_parents,
    }
}

async fn authorize_configuration(
    ctx: &AppContext,
    block: &BlockObject,
    caller: &Caller,
    verb: &str,
) -> Result<(), StorageError> {
    ctx.authority
        .check(
            caller,
            Action::ModifySystemConfiguration,
            &format!(
                "Authentication is required to {} the system configuration for {}",
                verb,
                block.device_name()
            ),
        )
        .await
}

fn identity_and_parents(
    ctx: &AppContext,
    block: &BlockObject,
    item: &ConfigurationItem,
) -> (BlockIdentity, Vec<String>) {
    let parents = if track_parents(item) {
        ctx.manager.read(|g| {
            g.block(&block.path)
                .map(|b| g.parent_uuids(b))
                .unwrap_or_default()
        })
    } else {
        Vec::new()
    };
    (BlockIdentity::from(&*block.device), parents)
}

pub async fn add_configuration_item(
    ctx: &AppContext,
    path: &ObjectPath,
    item: &ConfigurationItem,
    caller: &Caller,
) -> Result<(), StorageError> {
    let block = lookup_block(ctx, path)?;
    authorize_configuration(ctx, &block, caller, "add to").await?;
    let (identity, parents) = identity_and_parents(ctx, &block, item);
    ctx.manager.tables().add_item(item, &identity, &parents)?;
    ctx.manager.refresh_all();
    info!(block = %path, kind = item.kind(), "Configuration item added");
    Ok(())
}

pub async fn remove_configuration_item(
    ctx: &AppContext,
    path: &ObjectPath,
    item: &ConfigurationItem,
    caller: &Caller,
) -> Result<(), StorageError> {
    let block = lookup_block(ctx, path)?;
    authorize_configuration(ctx, &block, caller, "remove from").await?;
    ctx.manager.tables().remove_item(item)?;
    ctx.manager.refresh_all();
    info!(block = %path, kind = item.kind(), "Configuration item removed");
    Ok(())
}

pub async fn update_configuration_item(
    ctx: &AppContext,
    path: &ObjectPath,
    old: &ConfigurationItem,
    new: &ConfigurationItem,
    caller: &Caller,
) -> Result<(), StorageError> {
    let block = lookup_block(ctx, path)?;
    authorize_configuration(ctx, &block, caller, "modify").await?;
    let (identity, parents) = identity_and_parents(ctx, &block, new);
    ctx.manager
        .tables()
        .update_item(old, new, &identity, &parents)?;
    ctx.manager.refresh_all();
    info!(block = %path, kind = new.kind(), "Configuration item updated");
    Ok(())
}

/// Configuration records of the block, crypttab records with the contents
/// of their key files.
pub async fn get_secret_configuration(
    ctx: &AppContext,
    path: &ObjectPath,
    caller: &Caller,
) -> Result<Vec<ConfigurationItem>, StorageError> {
    let block = lookup_block(ctx, path)?;
    ctx.authority
        .check(
            caller,
            Action::ReadSystemConfigurationSecrets,
            &format!(
                "Authentication is required to read system-level secrets for {}",
                block.device_name()
            ),
        )
        .await?;
    let tables = ctx.manager.tables();
    tables.configuration_for(&tables.snapshot(), &BlockIdentity::from(&*block.device), true)
}
