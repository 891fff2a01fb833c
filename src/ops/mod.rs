//! Privileged operations on drives and blocks.
//!
//! Each operation authorizes the caller, drives external tools through the
//! [`Platform`](crate::core::Platform), and synchronizes with the uevent
//! stream through [`ObjectManager::wait_for`](crate::core::ObjectManager::wait_for).

pub mod block;
pub mod drive;
pub mod erase;
pub mod format;
pub mod fstypes;
pub mod teardown;

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::context::AppContext;
use crate::core::capabilities::{BLOCK, DRIVE};
use crate::core::{Action, BlockObject, Caller, ObjectGraph, ObjectPath};
use crate::error::StorageError;

pub use format::{FormatOptions, format};

const DEFAULT_SEAT: &str = "seat0";

/// Snapshot of the block at `path`.
pub(crate) fn lookup_block(ctx: &AppContext, path: &ObjectPath) -> Result<BlockObject, StorageError> {
    ctx.manager
        .read(|g| g.block(path).cloned())
        .ok_or_else(|| StorageError::NotFound(format!("No block device at {}", path)))
}

pub(crate) fn device_file(block: &BlockObject) -> Result<PathBuf, StorageError> {
    block
        .device_file()
        .map(Path::to_path_buf)
        .ok_or_else(|| StorageError::NotFound(format!("{} has no device file", block.path)))
}

/// The block an operation is working on, tracked across remove/add pairs.
///
/// The kernel may replace a block object while a workflow waits on it. The
/// reference is re-resolved by sysfs path and device node before every
/// check, falling back to the device node alone.
#[derive(Debug, Clone)]
pub(crate) struct BlockRef {
    pub path: ObjectPath,
    pub device_file: PathBuf,
    pub sysfs_path: String,
}

impl BlockRef {
    pub fn new(block: &BlockObject) -> Result<Self, StorageError> {
        Ok(Self {
            path: block.path.clone(),
            device_file: device_file(block)?,
            sysfs_path: block.device.sysfs_path.clone(),
        })
    }

    pub fn resolve<'g>(&mut self, graph: &'g ObjectGraph) -> Option<&'g BlockObject> {
        let block = graph
            .block_for_sysfs(&self.sysfs_path)
            .filter(|b| b.device.answers_to(&self.device_file))
            .or_else(|| graph.block_for_device_file(&self.device_file))?;
        if block.path != self.path || block.device.sysfs_path != self.sysfs_path {
            warn!(
                device = %self.device_file.display(),
                old = %self.path,
                new = %block.path,
                "Block device was removed and re-added while we were working on it"
            );
            self.path = block.path.clone();
            self.sysfs_path = block.device.sysfs_path.clone();
        }
        Some(block)
    }
}

fn hint_system(block: &BlockObject) -> bool {
    block
        .capabilities
        .get(BLOCK)
        .is_none_or(|b| b.get_bool("hint_system"))
}

/// Whether `caller` unlocked this block (or the encrypted device below it).
fn setup_by_user(graph: &ObjectGraph, block: &BlockObject, caller: &Caller) -> bool {
    let mut current = Some(block);
    while let Some(b) = current {
        if graph
            .unlocked
            .find_by_cleartext(b.device.devnum)
            .is_some_and(|e| e.unlocked_by_uid == caller.uid)
        {
            return true;
        }
        current = graph.crypto_backing(b);
    }
    false
}

fn on_default_seat(graph: &ObjectGraph, block: &BlockObject) -> bool {
    graph
        .drive_for_block(block)
        .and_then(|d| d.capabilities.get(DRIVE))
        .and_then(|c| c.get_str("seat").map(str::to_string))
        .is_none_or(|seat| seat.is_empty() || seat == DEFAULT_SEAT)
}

/// The modify action for `block`, escalated for system devices and devices
/// on another seat unless the caller set the device up themselves.
pub(crate) fn modify_action(ctx: &AppContext, block: &BlockObject, caller: &Caller) -> Action {
    ctx.manager.read(|g| {
        let current = g.block(&block.path).unwrap_or(block);
        if setup_by_user(g, current, caller) {
            Action::ModifyDevice
        } else if hint_system(current) {
            Action::ModifyDeviceSystem
        } else if !on_default_seat(g, current) {
            Action::ModifyDeviceOtherSeat
        } else {
            Action::ModifyDevice
        }
    })
}

pub(crate) fn open_action(block: &BlockObject) -> Action {
    if hint_system(block) {
        Action::OpenDeviceSystem
    } else {
        Action::OpenDevice
    }
}

/// Run one external tool as a tracked, cancellable job.
pub(crate) async fn run_tool_job(
    ctx: &AppContext,
    operation: &'static str,
    object: &ObjectPath,
    caller: &Caller,
    command: &str,
    stdin: Option<&str>,
) -> Result<(), StorageError> {
    let job = ctx.jobs.begin(&ctx.db, operation, object, caller).await;
    let cancel = job.cancel_token();
    let result = tokio::select! {
        r = ctx.platform.run_tool(command, stdin) => r,
        _ = cancel.cancelled() => Err(StorageError::Cancelled("Job was canceled".to_string())),
    };
    job.finish(&result).await;
    result
}
