//! The format workflow.
//!
//! Wipe, optionally erase, optionally encrypt, create the requested content,
//! then fix up ownership, partition type and configuration records. Every
//! change to the block is followed by a wait for the uevent that reflects
//! it; the block is re-resolved on each check because the kernel may
//! replace it while we wait.
//!
//! There is no rollback. A failure reports the step it happened in and
//! leaves the block as it is.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, error, info, info_span, warn};

use super::erase::{self, EraseMode};
use super::fstypes::{Creation, FsInfo, fs_info, partition_type_for, same_partition_type};
use super::{BlockRef, block, lookup_block, modify_action, run_tool_job, teardown};
use crate::context::AppContext;
use crate::core::capabilities::block::PartitionProps;
use crate::core::capabilities::{PARTITION, PARTITION_TABLE};
use crate::core::configuration::{BlockIdentity, ConfigurationItem};
use crate::core::jobs::FORMAT_MKFS;
use crate::core::platform::shell_quote;
use crate::core::unlock::UnlockedEntry;
use crate::core::{Action, BlockObject, Caller, ObjectGraph, ObjectPath};
use crate::error::{FormatError, FormatStep, StepExt, StorageError};

/// Options accepted by `block.format`.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FormatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub take_ownership: bool,
    #[serde(rename = "encrypt.passphrase", skip_serializing_if = "Option::is_none")]
    pub encrypt_passphrase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub erase: Option<String>,
    pub no_block: bool,
    pub update_partition_type: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub config_items: Vec<ConfigurationItem>,
    pub tear_down: bool,
}

impl std::fmt::Debug for FormatOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatOptions")
            .field("label", &self.label)
            .field("take_ownership", &self.take_ownership)
            .field("encrypt", &self.encrypt_passphrase.is_some())
            .field("erase", &self.erase)
            .field("no_block", &self.no_block)
            .field("update_partition_type", &self.update_partition_type)
            .field("config_items", &self.config_items.len())
            .field("tear_down", &self.tear_down)
            .finish()
    }
}

/// Everything validated up front, owned so the tail can run detached.
struct Plan {
    fs_type: String,
    info: &'static FsInfo,
    erase: Option<EraseMode>,
    options: FormatOptions,
    caller: Caller,
}

fn partition_props(block: &BlockObject) -> Option<PartitionProps> {
    block.capabilities.get(PARTITION)?.decode()
}

fn validate(
    block: &BlockObject,
    fs_type: &str,
    options: &FormatOptions,
) -> Result<(&'static FsInfo, Option<EraseMode>), StorageError> {
    let info = fs_info(fs_type).ok_or_else(|| {
        StorageError::NotSupported(format!(
            "Creation of file system type {} is not supported",
            fs_type
        ))
    })?;

    if options.label.as_deref().is_some_and(|l| !l.is_empty()) && !info.supports_label() {
        return Err(StorageError::NotSupported(format!(
            "File system type {} does not support labels",
            fs_type
        )));
    }

    let erase = options.erase.as_deref().map(EraseMode::parse).transpose()?;

    // A partition starting at offset 0 overlaps the table of its disk
    // (hybrid ISO images). Writing to it would destroy the table.
    if partition_props(block).is_some_and(|p| p.offset == 0) {
        return Err(StorageError::NotSupported(
            "This partition cannot be modified because it contains a partition table; \
             please reinitialize layout of the whole device."
                .to_string(),
        ));
    }

    Ok((info, erase))
}

async fn authorize(
    ctx: &AppContext,
    block: &BlockObject,
    plan: &Plan,
) -> Result<(), StorageError> {
    let device = block.device_name();
    let action = if plan.erase.is_some_and(|e| e.is_ata()) {
        Action::AtaSecureErase
    } else {
        modify_action(ctx, block, &plan.caller)
    };
    ctx.authority
        .check(
            &plan.caller,
            action,
            &format!("Authentication is required to format {}", device),
        )
        .await?;

    if !plan.options.config_items.is_empty() || plan.options.tear_down {
        ctx.authority
            .check(
                &plan.caller,
                Action::ModifySystemConfiguration,
                &format!("Authentication is required to modify the system configuration for {}", device),
            )
            .await?;
    }
    Ok(())
}

/// Wait until the tracked block satisfies `check`.
async fn wait_block(
    ctx: &AppContext,
    target: &mut BlockRef,
    timeout: Duration,
    message: &str,
    mut check: impl FnMut(&ObjectGraph, &BlockObject) -> bool,
) -> Result<BlockObject, StorageError> {
    ctx.manager
        .wait_for(timeout, |g| {
            let block = target.resolve(g)?;
            check(g, block).then(|| block.clone())
        })
        .await
        .ok_or_else(|| StorageError::Timeout(message.to_string()))
}

fn is_empty(block: &BlockObject) -> bool {
    block.device.fs_type().is_none()
        && block.device.partition_table_type().is_none()
        && !block.has(PARTITION_TABLE)
}

async fn wipe(ctx: &AppContext, target: &mut BlockRef) -> Result<(), StorageError> {
    let was_partitioned = ctx
        .manager
        .read(|g| target.resolve(g).is_some_and(|b| b.has(PARTITION_TABLE)));

    let command = format!("wipefs -a {}", shell_quote(&target.device_file.display().to_string()));
    ctx.platform.run_tool(&command, None).await?;
    ctx.platform.trigger_uevent(&target.sysfs_path)?;
    if was_partitioned {
        if let Err(e) = ctx.platform.reread_partition_table(&target.device_file) {
            warn!(device = %target.device_file.display(), error = %e, "Failed to reread partition table after wipe");
        }
    }

    wait_block(
        ctx,
        target,
        ctx.config.timeouts.wipe(),
        "Error synchronizing after initial wipe",
        |_, b| is_empty(b),
    )
    .await?;
    Ok(())
}

/// `luksFormat` then `luksOpen`. Returns the cleartext block.
async fn encrypt(
    ctx: &AppContext,
    target: &mut BlockRef,
    passphrase: &str,
    caller: &Caller,
) -> Result<BlockRef, FormatError> {
    let device = shell_quote(&target.device_file.display().to_string());
    let timeout = ctx.config.timeouts.encryption();

    ctx.platform
        .run_tool(&format!("cryptsetup luksFormat {}", device), Some(passphrase))
        .await
        .at(FormatStep::EncryptFormat)?;
    ctx.platform
        .trigger_uevent(&target.sysfs_path)
        .at(FormatStep::EncryptFormat)?;
    let formatted = wait_block(
        ctx,
        target,
        timeout,
        "Error synchronizing after luksFormat",
        |_, b| b.device.fs_type() == Some("crypto_LUKS"),
    )
    .await
    .at(FormatStep::EncryptFormat)?;

    let uuid = formatted.device.fs_uuid().unwrap_or_default().to_string();
    let command = format!(
        "cryptsetup luksOpen {} {}",
        device,
        shell_quote(&format!("luks-{}", uuid))
    );
    ctx.platform
        .run_tool(&command, Some(passphrase))
        .await
        .at(FormatStep::EncryptOpen)?;

    let (backing, cleartext) = ctx
        .manager
        .wait_for(timeout, |g| {
            let backing = target.resolve(g)?;
            let cleartext = g.cleartext_for(backing)?;
            Some((backing.clone(), cleartext.clone()))
        })
        .await
        .ok_or_else(|| {
            StorageError::Timeout("Error waiting for cleartext object after luksOpen".to_string())
        })
        .at(FormatStep::EncryptOpen)?;

    ctx.manager.write(|g| {
        g.unlocked.add(UnlockedEntry {
            cleartext_device: cleartext.device.devnum,
            crypto_device: backing.device.devnum,
            dm_uuid: cleartext.device.dm_uuid().unwrap_or_default().to_string(),
            unlocked_by_uid: caller.uid,
        })
    });
    info!(cleartext = %cleartext.path, "Unlocked new encrypted device");

    BlockRef::new(&cleartext).at(FormatStep::EncryptOpen)
}

async fn create(ctx: &AppContext, target: &mut BlockRef, plan: &Plan) -> Result<(), StorageError> {
    let device = target.device_file.display().to_string();
    match plan.info.creation {
        Creation::Command(_) => {
            let command = plan
                .info
                .command(&device, plan.options.label.as_deref())
                .unwrap_or_default();
            run_tool_job(ctx, FORMAT_MKFS, &target.path, &plan.caller, &command, None).await?;
        }
        Creation::PartitionTable => {
            let job = ctx.jobs.begin(&ctx.db, FORMAT_MKFS, &target.path, &plan.caller).await;
            let result = ctx
                .platform
                .create_partition_table(&target.device_file, &plan.fs_type)
                .await;
            job.finish(&result).await;
            result?;
        }
    }

    ctx.platform.trigger_uevent(&target.sysfs_path)?;

    let fs_type = plan.fs_type.as_str();
    wait_block(
        ctx,
        target,
        ctx.config.timeouts.mkfs(),
        &format!("Error synchronizing after formatting with type `{}'", fs_type),
        |_, b| {
            if fs_type == "empty" {
                is_empty(b)
            } else {
                b.device.fs_type() == Some(fs_type)
                    || b.device.partition_table_type() == Some(fs_type)
            }
        },
    )
    .await?;
    Ok(())
}

/// Hand the root directory of a fresh filesystem to the caller.
///
/// The filesystem is mounted on a private directory for the duration. The
/// mount and the directory are removed even when changing ownership fails.
fn take_ownership(
    ctx: &AppContext,
    device: &Path,
    fs_type: &str,
    caller: &Caller,
) -> Result<(), StorageError> {
    let run_dir = &ctx.config.run_dir;
    std::fs::create_dir_all(run_dir)
        .map_err(|e| StorageError::io(format!("Cannot create {}", run_dir.display()), e))?;
    let mount_dir = nix::unistd::mkdtemp(&run_dir.join("block-format-tos-XXXXXX"))
        .map_err(|e| StorageError::Failed(format!("Cannot create directory: {}", e)))?;

    let remove_dir = |dir: &Path| {
        if let Err(e) = std::fs::remove_dir(dir) {
            warn!(dir = %dir.display(), error = %e, "Cannot remove temporary mount point");
        }
    };

    if let Err(e) = ctx.platform.mount(device, &mount_dir, fs_type) {
        remove_dir(&mount_dir);
        return Err(e);
    }

    let chown = ctx
        .platform
        .set_owner(&mount_dir, caller.uid, caller.gid, 0o700);

    let unmount = ctx.platform.unmount(&mount_dir);
    match &unmount {
        Ok(()) => remove_dir(&mount_dir),
        Err(e) => warn!(dir = %mount_dir.display(), error = %e, "Leaving temporary mount point behind"),
    }
    chown.and(unmount)
}

async fn update_partition_type(
    ctx: &AppContext,
    target: &mut BlockRef,
    content: &str,
) -> Result<(), StorageError> {
    let Some((partition, props)) = ctx.manager.read(|g| {
        let b = target.resolve(g)?;
        partition_props(b).map(|p| (b.clone(), p))
    }) else {
        return Ok(());
    };
    let Some(wanted) = partition_type_for(&props.scheme, content) else {
        return Ok(());
    };
    if same_partition_type(wanted, &props.part_type) {
        return Ok(());
    }
    block::set_partition_type(ctx, &partition, wanted).await
}

fn apply_configuration(
    ctx: &AppContext,
    items: &[ConfigurationItem],
    original: &mut BlockRef,
    mkfs: &mut BlockRef,
) -> Result<(), StorageError> {
    let tables = ctx.manager.tables();
    for item in items {
        let (identity, parents) = ctx.manager.read(|g| {
            let target = match item {
                ConfigurationItem::Fstab(_) => mkfs.resolve(g),
                ConfigurationItem::Crypttab(_) => original.resolve(g),
            }
            .ok_or_else(|| StorageError::NotFound("Block device disappeared".to_string()))?;
            let track = match item {
                ConfigurationItem::Fstab(i) => i.track_parents,
                ConfigurationItem::Crypttab(i) => i.track_parents,
            };
            let parents = if track { g.parent_uuids(target) } else { Vec::new() };
            Ok::<_, StorageError>((BlockIdentity::from(&*target.device), parents))
        })?;
        tables.add_item(item, &identity, &parents)?;
    }
    ctx.manager.refresh_all();
    Ok(())
}

/// Everything after the wipe. With `no-block` this runs detached.
async fn finish(ctx: &AppContext, mut target: BlockRef, plan: Plan) -> Result<(), FormatError> {
    let encrypting = plan.options.encrypt_passphrase.is_some();

    if let Some(mode) = plan.erase {
        if !encrypting {
            erase::erase(ctx, &target, mode, &plan.caller)
                .await
                .at(FormatStep::Erase)?;
        }
    }

    let mut mkfs_target = match &plan.options.encrypt_passphrase {
        Some(passphrase) => {
            let cleartext = encrypt(ctx, &mut target, passphrase, &plan.caller).await?;
            if let Some(mode) = plan.erase {
                erase::erase(ctx, &cleartext, mode, &plan.caller)
                    .await
                    .at(FormatStep::Erase)?;
            }
            cleartext
        }
        None => target.clone(),
    };

    create(ctx, &mut mkfs_target, &plan).await.at(FormatStep::Create)?;

    if plan.options.take_ownership && plan.info.supports_owners {
        take_ownership(ctx, &mkfs_target.device_file, &plan.fs_type, &plan.caller)
            .at(FormatStep::TakeOwnership)?;
    }

    if plan.options.update_partition_type {
        let content = if encrypting { "crypto_LUKS" } else { plan.fs_type.as_str() };
        update_partition_type(ctx, &mut target, content)
            .await
            .at(FormatStep::SetPartitionType)?;
    }

    if !plan.options.config_items.is_empty() {
        apply_configuration(ctx, &plan.options.config_items, &mut target, &mut mkfs_target)
            .at(FormatStep::Configure)?;
    }

    info!(device = %mkfs_target.device_file.display(), fs_type = %plan.fs_type, "Format complete");
    Ok(())
}

/// Format the block at `path` with `fs_type`.
pub async fn format(
    ctx: &AppContext,
    path: &ObjectPath,
    fs_type: &str,
    options: FormatOptions,
    caller: &Caller,
) -> Result<(), FormatError> {
    let span = info_span!("format", object = %path, fs_type);
    async move {
        let block = lookup_block(ctx, path).at(FormatStep::Validate)?;
        let (info, erase) = validate(&block, fs_type, &options).at(FormatStep::Validate)?;
        let mut target = BlockRef::new(&block).at(FormatStep::Validate)?;
        let plan = Plan {
            fs_type: fs_type.to_string(),
            info,
            erase,
            options,
            caller: *caller,
        };

        authorize(ctx, &block, &plan).await.at(FormatStep::Authorize)?;

        if plan.options.tear_down {
            teardown::teardown(ctx, &mut target, caller)
                .await
                .at(FormatStep::TearDown)?;
        }

        wipe(ctx, &mut target).await.at(FormatStep::Wipe)?;

        if plan.options.no_block {
            let ctx = ctx.clone();
            let device = target.device_file.clone();
            tokio::spawn(
                async move {
                    match finish(&ctx, target, plan).await {
                        Ok(()) => {}
                        Err(e) => error!(device = %device.display(), step = %e.step, error = %e.source, "Background format failed"),
                    }
                }
                .in_current_span(),
            );
            return Ok(());
        }

        finish(ctx, target, plan).await
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_use_wire_names() {
        let options: FormatOptions = serde_json::from_value(serde_json::json!({
            "label": "data",
            "take-ownership": true,
            "encrypt.passphrase": "secret",
            "erase": "zero",
            "no-block": true,
            "update-partition-type": true,
            "tear-down": true,
            "config-items": [{ "kind": "fstab", "dir": "/mnt/data" }],
        }))
        .unwrap();

        assert_eq!(options.label.as_deref(), Some("data"));
        assert!(options.take_ownership && options.no_block && options.tear_down);
        assert!(options.update_partition_type);
        assert_eq!(options.encrypt_passphrase.as_deref(), Some("secret"));
        assert_eq!(options.config_items.len(), 1);
        assert!(!format!("{:?}", options).contains("secret"));
    }

    #[test]
    fn missing_options_default_to_off() {
        let options: FormatOptions = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!options.take_ownership);
        assert!(options.erase.is_none());
        assert!(options.config_items.is_empty());
    }
}
