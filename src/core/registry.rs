//! Live device descriptors keyed by sysfs path, plus the reverse index from a
//! sysfs path to the domain objects built on it.

use std::collections::HashMap;
use std::sync::Arc;

use super::device::DeviceDescriptor;
use super::objects::ObjectPath;

#[derive(Debug, Default, Clone)]
struct Owners {
    drive: Option<ObjectPath>,
    block: Option<ObjectPath>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    descriptors: HashMap<String, Arc<DeviceDescriptor>>,
    owners: HashMap<String, Owners>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the descriptor for its sysfs path. Returns the previous one.
    pub fn upsert(&mut self, device: Arc<DeviceDescriptor>) -> Option<Arc<DeviceDescriptor>> {
        self.descriptors.insert(device.sysfs_path.clone(), device)
    }

    pub fn remove(&mut self, sysfs_path: &str) -> Option<Arc<DeviceDescriptor>> {
        self.descriptors.remove(sysfs_path)
    }

    pub fn get(&self, sysfs_path: &str) -> Option<&Arc<DeviceDescriptor>> {
        self.descriptors.get(sysfs_path)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<DeviceDescriptor>> {
        self.descriptors.values()
    }

    pub fn drive_owner(&self, sysfs_path: &str) -> Option<&ObjectPath> {
        self.owners.get(sysfs_path)?.drive.as_ref()
    }

    pub fn block_owner(&self, sysfs_path: &str) -> Option<&ObjectPath> {
        self.owners.get(sysfs_path)?.block.as_ref()
    }

    pub fn set_drive_owner(&mut self, sysfs_path: &str, owner: Option<ObjectPath>) {
        self.owners.entry(sysfs_path.to_string()).or_default().drive = owner;
        self.prune_owner(sysfs_path);
    }

    pub fn set_block_owner(&mut self, sysfs_path: &str, owner: Option<ObjectPath>) {
        self.owners.entry(sysfs_path.to_string()).or_default().block = owner;
        self.prune_owner(sysfs_path);
    }

    fn prune_owner(&mut self, sysfs_path: &str) {
        if let Some(o) = self.owners.get(sysfs_path) {
            if o.drive.is_none() && o.block.is_none() {
                self.owners.remove(sysfs_path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(path: &str, name: &str) -> Arc<DeviceDescriptor> {
        Arc::new(DeviceDescriptor {
            sysfs_path: path.to_string(),
            name: name.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn upsert_replaces_snapshot() {
        let mut reg = DeviceRegistry::new();
        assert!(reg.upsert(desc("/sys/block/sda", "sda")).is_none());
        let old = reg.upsert(desc("/sys/block/sda", "sda")).unwrap();
        assert_eq!(old.name, "sda");
        assert_eq!(reg.len(), 1);
        assert!(reg.remove("/sys/block/sda").is_some());
        assert!(reg.is_empty());
    }

    #[test]
    fn owner_index_tracks_both_kinds() {
        let mut reg = DeviceRegistry::new();
        let drive = ObjectPath::drive("ACME_Disk_1");
        let block = ObjectPath::block("sda");
        reg.set_drive_owner("/sys/block/sda", Some(drive.clone()));
        reg.set_block_owner("/sys/block/sda", Some(block.clone()));
        assert_eq!(reg.drive_owner("/sys/block/sda"), Some(&drive));
        assert_eq!(reg.block_owner("/sys/block/sda"), Some(&block));

        reg.set_drive_owner("/sys/block/sda", None);
        assert!(reg.drive_owner("/sys/block/sda").is_none());
        assert_eq!(reg.block_owner("/sys/block/sda"), Some(&block));
    }
}
