//! The published object graph: registry, drive and block arenas, and the
//! unlock registry. Every read and write happens under the daemon's graph lock.

use std::collections::BTreeMap;
use std::path::Path;

use super::objects::{BlockObject, DriveObject, ObjectPath};
use super::registry::DeviceRegistry;
use super::unlock::UnlockRegistry;

#[derive(Debug, Default)]
pub struct ObjectGraph {
    pub registry: DeviceRegistry,
    pub unlocked: UnlockRegistry,
    drives: BTreeMap<ObjectPath, DriveObject>,
    blocks: BTreeMap<ObjectPath, BlockObject>,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unlock_registry(unlocked: UnlockRegistry) -> Self {
        Self {
            unlocked,
            ..Self::default()
        }
    }

    pub fn drive(&self, path: &ObjectPath) -> Option<&DriveObject> {
        self.drives.get(path)
    }

    pub fn block(&self, path: &ObjectPath) -> Option<&BlockObject> {
        self.blocks.get(path)
    }

    pub fn drives(&self) -> impl Iterator<Item = &DriveObject> {
        self.drives.values()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BlockObject> {
        self.blocks.values()
    }

    pub(crate) fn drive_mut(&mut self, path: &ObjectPath) -> Option<&mut DriveObject> {
        self.drives.get_mut(path)
    }

    pub(crate) fn block_mut(&mut self, path: &ObjectPath) -> Option<&mut BlockObject> {
        self.blocks.get_mut(path)
    }

    pub(crate) fn insert_drive(&mut self, drive: DriveObject) {
        self.drives.insert(drive.path.clone(), drive);
    }

    pub(crate) fn insert_block(&mut self, block: BlockObject) {
        self.blocks.insert(block.path.clone(), block);
    }

    pub(crate) fn remove_drive(&mut self, path: &ObjectPath) -> Option<DriveObject> {
        self.drives.remove(path)
    }

    pub(crate) fn remove_block(&mut self, path: &ObjectPath) -> Option<BlockObject> {
        self.blocks.remove(path)
    }

    /// Forget unlock entries whose cleartext device is gone or now carries a
    /// different device-mapper uuid. Returns how many were dropped.
    pub fn prune_stale_unlocks(&mut self) -> usize {
        let blocks = &self.blocks;
        self.unlocked.prune(|e| {
            blocks.values().any(|b| {
                b.device.devnum == e.cleartext_device
                    && (e.dm_uuid.is_empty() || b.device.dm_uuid() == Some(e.dm_uuid.as_str()))
            })
        })
    }

    /// Pick an unused drive path, suffixing `_2`, `_3`, ... on collision.
    pub fn allocate_drive_path(&self, name: &str) -> ObjectPath {
        let first = ObjectPath::drive(name);
        if !self.drives.contains_key(&first) {
            return first;
        }
        (2..)
            .map(|n| ObjectPath::drive(&format!("{}_{}", name, n)))
            .find(|p| !self.drives.contains_key(p))
            .unwrap_or(first)
    }

    pub fn drive_with_vpd(&self, vpd: &str) -> Option<&DriveObject> {
        self.drives.values().find(|d| d.vpd == vpd)
    }

    pub fn block_for_sysfs(&self, sysfs_path: &str) -> Option<&BlockObject> {
        self.registry
            .block_owner(sysfs_path)
            .and_then(|p| self.blocks.get(p))
    }

    pub fn block_for_device_file(&self, path: &Path) -> Option<&BlockObject> {
        self.blocks.values().find(|b| b.device.answers_to(path))
    }

    /// Drive this block lives on. Partitions resolve through their disk.
    pub fn drive_for_block(&self, block: &BlockObject) -> Option<&DriveObject> {
        let whole = if block.device.is_partition() {
            block.device.parent.as_deref()?
        } else {
            block.device.sysfs_path.as_str()
        };
        self.registry
            .drive_owner(whole)
            .and_then(|p| self.drives.get(p))
    }

    /// The whole-disk block object of a drive.
    pub fn block_for_drive(&self, drive: &DriveObject) -> Option<&BlockObject> {
        drive
            .devices
            .iter()
            .find_map(|d| self.block_for_sysfs(&d.sysfs_path))
    }

    /// Every block whose drive is `drive`, partitions included.
    pub fn blocks_on_drive<'a>(
        &'a self,
        drive: &'a DriveObject,
    ) -> impl Iterator<Item = &'a BlockObject> + 'a {
        self.blocks.values().filter(move |b| {
            self.drive_for_block(b)
                .is_some_and(|d| d.path == drive.path)
        })
    }

    /// For a LUKS cleartext mapping, the block it was unlocked from.
    pub fn crypto_backing(&self, block: &BlockObject) -> Option<&BlockObject> {
        if !block.device.name.starts_with("dm-") {
            return None;
        }
        if !block
            .device
            .dm_uuid()
            .is_some_and(|u| u.starts_with("CRYPT-LUKS"))
        {
            return None;
        }
        match block.device.slaves.as_slice() {
            [only] => self.block_for_sysfs(only),
            _ => None,
        }
    }

    /// For an encrypted block, its unlocked cleartext mapping if any.
    pub fn cleartext_for(&self, backing: &BlockObject) -> Option<&BlockObject> {
        self.blocks.values().find(|b| {
            self.crypto_backing(b)
                .is_some_and(|c| c.path == backing.path)
        })
    }

    /// The block holding the partition table a partition belongs to.
    pub fn partition_table_of(&self, partition: &BlockObject) -> Option<&BlockObject> {
        if !partition.device.is_partition() {
            return None;
        }
        partition
            .device
            .parent
            .as_deref()
            .and_then(|p| self.block_for_sysfs(p))
    }

    pub fn partitions_of<'a>(
        &'a self,
        table: &'a BlockObject,
    ) -> impl Iterator<Item = &'a BlockObject> + 'a {
        self.blocks.values().filter(move |b| {
            b.device.is_partition()
                && b.device.parent.as_deref() == Some(table.device.sysfs_path.as_str())
        })
    }

    /// Drives sharing a non-empty sibling id with `drive`.
    pub fn siblings<'a>(&'a self, drive: &'a DriveObject) -> Vec<&'a DriveObject> {
        let sibling_id = drive
            .capabilities
            .get("drive")
            .and_then(|c| c.get_str("sibling_id"))
            .filter(|s| !s.is_empty());
        let Some(sibling_id) = sibling_id else {
            return Vec::new();
        };
        self.drives
            .values()
            .filter(|d| d.path != drive.path)
            .filter(|d| {
                d.capabilities
                    .get("drive")
                    .and_then(|c| c.get_str("sibling_id"))
                    == Some(sibling_id)
            })
            .collect()
    }

    /// Filesystem UUIDs of every encrypted device underneath `block`, nearest first.
    pub fn parent_uuids(&self, block: &BlockObject) -> Vec<String> {
        let mut uuids = Vec::new();
        let mut current = block;
        while let Some(backing) = self.crypto_backing(current) {
            if let Some(uuid) = backing.device.fs_uuid() {
                uuids.push(uuid.to_string());
            }
            current = backing;
        }
        uuids
    }
}
