use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::capability::CapabilityTable;
use super::device::DeviceDescriptor;

pub const DRIVES_PREFIX: &str = "/drives/";
pub const BLOCKS_PREFIX: &str = "/block_devices/";

/// Externally visible address of a drive or block object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectPath(String);

impl ObjectPath {
    pub fn drive(name: &str) -> Self {
        Self(format!("{}{}", DRIVES_PREFIX, name))
    }

    pub fn block(kernel_name: &str) -> Self {
        let name: String = kernel_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        Self(format!("{}{}", BLOCKS_PREFIX, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjectPath {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ObjectPath {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A physical or logical drive, possibly reachable through several paths.
#[derive(Debug, Clone)]
pub struct DriveObject {
    pub path: ObjectPath,
    /// Hardware identity, derived once at creation.
    pub vpd: String,
    /// Member descriptors in discovery order.
    pub devices: Vec<Arc<DeviceDescriptor>>,
    pub capabilities: CapabilityTable,
    pub module_capabilities: CapabilityTable,
}

impl DriveObject {
    pub fn new(path: ObjectPath, vpd: String, device: Arc<DeviceDescriptor>) -> Self {
        Self {
            path,
            vpd,
            devices: vec![device],
            capabilities: CapabilityTable::default(),
            module_capabilities: CapabilityTable::default(),
        }
    }

    /// First member, used for identity-level properties.
    pub fn device(&self) -> Option<&Arc<DeviceDescriptor>> {
        self.devices.first()
    }

    /// Replace the member with the same sysfs path in place, or append it.
    pub fn upsert_member(&mut self, device: Arc<DeviceDescriptor>) {
        match self
            .devices
            .iter_mut()
            .find(|d| d.sysfs_path == device.sysfs_path)
        {
            Some(slot) => *slot = device,
            None => self.devices.push(device),
        }
    }

    /// Swap the member at `old_sysfs` for `device`, keeping its position.
    pub fn replace_member(&mut self, old_sysfs: &str, device: Arc<DeviceDescriptor>) {
        match self.devices.iter_mut().find(|d| d.sysfs_path == old_sysfs) {
            Some(slot) => *slot = device,
            None => self.upsert_member(device),
        }
    }

    /// Returns true if a member was removed.
    pub fn remove_member(&mut self, sysfs_path: &str) -> bool {
        let before = self.devices.len();
        self.devices.retain(|d| d.sysfs_path != sysfs_path);
        before != self.devices.len()
    }
}

/// One kernel block device.
#[derive(Debug, Clone)]
pub struct BlockObject {
    pub path: ObjectPath,
    pub device: Arc<DeviceDescriptor>,
    pub capabilities: CapabilityTable,
    pub module_capabilities: CapabilityTable,
}

impl BlockObject {
    pub fn new(device: Arc<DeviceDescriptor>) -> Self {
        Self {
            path: ObjectPath::block(&device.name),
            device,
            capabilities: CapabilityTable::default(),
            module_capabilities: CapabilityTable::default(),
        }
    }

    pub fn has(&self, kind: &str) -> bool {
        self.capabilities.has(kind) || self.module_capabilities.has(kind)
    }

    pub fn device_file(&self) -> Option<&std::path::Path> {
        self.device.device_file.as_deref()
    }

    /// Device node for messages and tool invocations.
    pub fn device_name(&self) -> String {
        match &self.device.device_file {
            Some(p) => p.display().to_string(),
            None => self.device.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(path: &str, serial: &str) -> Arc<DeviceDescriptor> {
        Arc::new(DeviceDescriptor {
            sysfs_path: path.to_string(),
            ..Default::default()
        }
        .with_property("ID_SERIAL_SHORT", serial))
    }

    #[test]
    fn block_path_is_sanitized() {
        assert_eq!(ObjectPath::block("dm-0").as_str(), "/block_devices/dm_0");
    }

    #[test]
    fn members_are_replaced_in_place() {
        let mut drive = DriveObject::new(
            ObjectPath::drive("x"),
            "vpd".into(),
            member("/sys/block/sda", "1"),
        );
        drive.upsert_member(member("/sys/block/sdb", "1"));
        drive.upsert_member(member("/sys/block/sda", "2"));

        assert_eq!(drive.devices.len(), 2);
        assert_eq!(drive.devices[0].sysfs_path, "/sys/block/sda");
        assert_eq!(drive.devices[0].property("ID_SERIAL_SHORT"), Some("2"));

        assert!(drive.remove_member("/sys/block/sda"));
        assert!(!drive.remove_member("/sys/block/sda"));
        assert_eq!(drive.devices.len(), 1);
    }
}
