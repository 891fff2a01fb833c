//! Recursive teardown of a block before it is overwritten: nested partitions,
//! unlocked encrypted mappings and the configuration records pointing at them.

use tracing::{debug, info};

use super::BlockRef;
use crate::context::AppContext;
use crate::core::capabilities::{ENCRYPTED, PARTITION, PARTITION_TABLE};
use crate::core::capabilities::block::PartitionProps;
use crate::core::configuration::BlockIdentity;
use crate::core::platform::shell_quote;
use crate::core::{BlockObject, Caller, ObjectGraph, ObjectPath};
use crate::error::StorageError;

fn partition_props(block: &BlockObject) -> Option<PartitionProps> {
    block.capabilities.get(PARTITION)?.decode()
}

/// Depth-first visit order: children before the block that holds them.
fn walk_order(graph: &ObjectGraph, block: &BlockObject, out: &mut Vec<ObjectPath>) {
    let props = partition_props(block);
    if props.as_ref().is_some_and(|p| p.is_container) {
        if let Some(table) = graph.partition_table_of(block) {
            for child in graph.partitions_of(table) {
                if partition_props(child).is_some_and(|p| p.is_contained) {
                    walk_order(graph, child, out);
                }
            }
        }
    } else if block.has(PARTITION_TABLE) {
        for child in graph.partitions_of(block) {
            if !partition_props(child).is_some_and(|p| p.is_contained) {
                walk_order(graph, child, out);
            }
        }
    }

    if block.has(ENCRYPTED) {
        if let Some(cleartext) = graph.cleartext_for(block) {
            walk_order(graph, cleartext, out);
        }
    }

    out.push(block.path.clone());
}

/// Refuse the whole teardown if anything it would visit is in use.
fn check_not_busy(ctx: &AppContext, blocks: &[BlockObject]) -> Result<(), StorageError> {
    let mounts = ctx.manager.mounts().snapshot();
    for block in blocks {
        if mounts.is_mounted(block.device.devnum) {
            return Err(StorageError::DeviceBusy(format!(
                "Device {} is mounted",
                block.device_name()
            )));
        }
        if mounts.swap_active(&block.device) {
            return Err(StorageError::DeviceBusy(format!(
                "Swap space {} is active",
                block.device_name()
            )));
        }
    }
    Ok(())
}

/// Close the cleartext mapping of `backing` and forget who unlocked it.
pub(crate) async fn lock(
    ctx: &AppContext,
    backing: &BlockObject,
    cleartext: &BlockObject,
) -> Result<(), StorageError> {
    let command = format!("cryptsetup luksClose {}", shell_quote(&cleartext.device_name()));
    ctx.platform.run_tool(&command, None).await?;

    let backing_path = backing.path.clone();
    let gone = ctx
        .manager
        .wait_for(ctx.config.timeouts.encryption(), |g| {
            let still_open = g
                .block(&backing_path)
                .and_then(|b| g.cleartext_for(b))
                .is_some();
            (!still_open).then_some(())
        })
        .await;
    if gone.is_none() {
        return Err(StorageError::Timeout(format!(
            "Error waiting for cleartext object {} to disappear after locking",
            cleartext.device_name()
        )));
    }

    ctx.manager
        .write(|g| g.unlocked.remove_cleartext(cleartext.device.devnum));
    info!(device = %backing.device_name(), "Locked encrypted device");
    Ok(())
}

fn remove_configuration(
    ctx: &AppContext,
    block: &BlockObject,
) -> Result<(), StorageError> {
    let tables = ctx.manager.tables();
    let snapshot = tables.snapshot();

    if block.has(ENCRYPTED) {
        if let Some(uuid) = block.device.fs_uuid() {
            for item in snapshot.children_of(uuid) {
                debug!(device = %block.device_name(), kind = item.kind(), "Removing child configuration");
                tables.remove_item(&item)?;
            }
        }
    }

    let snapshot = tables.snapshot();
    for item in snapshot.for_block(&BlockIdentity::from(&*block.device)) {
        debug!(device = %block.device_name(), kind = item.kind(), "Removing configuration");
        tables.remove_item(&item)?;
    }
    Ok(())
}

async fn tear_down_one(ctx: &AppContext, path: &ObjectPath) -> Result<(), StorageError> {
    let Some((block, cleartext)) = ctx.manager.read(|g| {
        g.block(path)
            .map(|b| (b.clone(), g.cleartext_for(b).cloned()))
    }) else {
        // Went away with its parent (e.g. a cleartext mapping locked earlier).
        return Ok(());
    };

    if block.has(ENCRYPTED) {
        if let Some(cleartext) = cleartext {
            lock(ctx, &block, &cleartext).await?;
        }
    }
    remove_configuration(ctx, &block)
}

/// Tear down everything on top of `target`, then its own configuration.
///
/// Nothing is touched if any visited block is mounted or an active swap.
/// The first failure aborts the walk.
pub(crate) async fn teardown(
    ctx: &AppContext,
    target: &mut BlockRef,
    _caller: &Caller,
) -> Result<(), StorageError> {
    let visited = ctx.manager.read(|g| {
        let block = target.resolve(g)?;
        let mut order = Vec::new();
        walk_order(g, block, &mut order);
        let blocks: Vec<BlockObject> = order.iter().filter_map(|p| g.block(p).cloned()).collect();
        Some((order, blocks))
    });
    let Some((order, blocks)) = visited else {
        return Err(StorageError::NotFound(format!(
            "Block device {} disappeared",
            target.device_file.display()
        )));
    };

    check_not_busy(ctx, &blocks)?;
    debug!(count = order.len(), "Tearing down");

    let result = async {
        for path in &order {
            tear_down_one(ctx, path).await?;
        }
        Ok(())
    }
    .await;
    ctx.manager.refresh_all();
    result
}
