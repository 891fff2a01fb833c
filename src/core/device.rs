use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Kernel uevent action. Unknown actions are folded into `Change`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UeventAction {
    Add,
    Change,
    Remove,
    Online,
    Offline,
}

impl UeventAction {
    pub fn parse(s: &str) -> Self {
        match s {
            "add" => Self::Add,
            "remove" => Self::Remove,
            "online" => Self::Online,
            "offline" => Self::Offline,
            _ => Self::Change,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Change => "change",
            Self::Remove => "remove",
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// Immutable snapshot of one kernel block device.
///
/// A new descriptor is built for every event; the registry replaces the old
/// snapshot instead of editing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Full sysfs path, e.g. `/sys/devices/pci0000:00/.../block/sda`.
    pub sysfs_path: String,
    /// Kernel name, e.g. `sda1`.
    pub name: String,
    pub subsystem: String,
    /// `disk`, `partition`, or empty.
    pub devtype: String,
    pub device_file: Option<PathBuf>,
    pub symlinks: Vec<PathBuf>,
    pub devnum: u64,
    pub properties: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
    /// Sysfs paths of the devices listed under `slaves/`.
    pub slaves: Vec<String>,
    /// Sysfs path of the parent device in the `block` subsystem, if any.
    pub parent: Option<String>,
    /// Subsystems found on the way up the device tree (`scsi`, `firewire`, ...).
    pub parent_subsystems: Vec<String>,
}

impl DeviceDescriptor {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// udev-style boolean: `1`, `true` or `yes`.
    pub fn property_bool(&self, key: &str) -> bool {
        matches!(self.property(key), Some("1" | "true" | "yes"))
    }

    pub fn property_u64(&self, key: &str) -> Option<u64> {
        self.property(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn attribute_u64(&self, key: &str) -> Option<u64> {
        self.attribute(key).and_then(|v| v.parse().ok())
    }

    pub fn is_disk(&self) -> bool {
        self.devtype == "disk"
    }

    pub fn is_partition(&self) -> bool {
        self.devtype == "partition"
    }

    /// Size in bytes, from the `size` attribute (512-byte sectors).
    pub fn size(&self) -> u64 {
        self.attribute_u64("size").unwrap_or(0) * 512
    }

    pub fn read_only(&self) -> bool {
        self.attribute("ro") == Some("1")
    }

    pub fn fs_usage(&self) -> Option<&str> {
        self.property("ID_FS_USAGE")
    }

    pub fn fs_type(&self) -> Option<&str> {
        self.property("ID_FS_TYPE")
    }

    pub fn fs_uuid(&self) -> Option<&str> {
        self.property("ID_FS_UUID")
    }

    pub fn fs_label(&self) -> Option<&str> {
        self.property("ID_FS_LABEL")
    }

    pub fn partition_table_type(&self) -> Option<&str> {
        self.property("ID_PART_TABLE_TYPE")
    }

    pub fn dm_uuid(&self) -> Option<&str> {
        self.attribute("dm/uuid")
    }

    pub fn dm_name(&self) -> Option<&str> {
        self.attribute("dm/name")
    }

    /// Device node or any of its aliases equals `path`.
    pub fn answers_to(&self, path: &Path) -> bool {
        self.device_file.as_deref() == Some(path) || self.symlinks.iter().any(|s| s == path)
    }

    pub fn major(&self) -> u64 {
        nix::sys::stat::major(self.devnum)
    }

    pub fn minor(&self) -> u64 {
        nix::sys::stat::minor(self.devnum)
    }

    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}

/// One hardware event as delivered by a monitor.
#[derive(Debug, Clone)]
pub struct Uevent {
    pub action: UeventAction,
    pub device: Arc<DeviceDescriptor>,
}

impl Uevent {
    pub fn new(action: UeventAction, device: DeviceDescriptor) -> Self {
        Self {
            action,
            device: Arc::new(device),
        }
    }
}

/// Events produced by a hardware monitor.
#[derive(Debug, Clone)]
pub enum HardwareEvent {
    Uevent(Uevent),
    /// The mount table changed; mount-derived capability state is stale.
    MountsChanged,
}
