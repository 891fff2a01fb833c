use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{BLOCK, ENCRYPTED, FILESYSTEM, PARTITION, PARTITION_TABLE, SWAPSPACE};
use crate::core::capability::{CapabilityDef, Env, Representation};
use crate::core::configuration::{BlockIdentity, ConfigurationItem};
use crate::core::device::DeviceDescriptor;
use crate::core::objects::{BlockObject, ObjectPath};

use super::drive::DriveProps;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockProps {
    pub device: Option<PathBuf>,
    pub preferred_device: Option<PathBuf>,
    pub symlinks: Vec<PathBuf>,
    pub device_number: u64,
    pub size: u64,
    pub read_only: bool,
    pub id_usage: String,
    pub id_type: String,
    pub id_version: String,
    pub id_label: String,
    pub id_uuid: String,
    pub drive: Option<ObjectPath>,
    pub crypto_backing_device: Option<ObjectPath>,
    pub hint_partitionable: bool,
    pub hint_system: bool,
    pub hint_ignore: bool,
    pub hint_auto: bool,
    pub configuration: Vec<ConfigurationItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionProps {
    pub number: u32,
    #[serde(rename = "type")]
    pub part_type: String,
    pub flags: u64,
    pub offset: u64,
    pub size: u64,
    pub name: String,
    pub uuid: String,
    pub scheme: String,
    pub table: Option<ObjectPath>,
    pub is_container: bool,
    pub is_contained: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionTableProps {
    #[serde(rename = "type")]
    pub table_type: String,
    pub partitions: Vec<ObjectPath>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncryptedProps {
    pub cleartext_device: Option<ObjectPath>,
    pub child_configuration: Vec<ConfigurationItem>,
}

fn drive_props(block: &BlockObject, env: &Env<'_>) -> Option<DriveProps> {
    env.graph
        .drive_for_block(block)?
        .capabilities
        .get(super::DRIVE)?
        .decode()
}

fn hint_override(device: &DeviceDescriptor, key: &str) -> Option<bool> {
    device.property(key).map(|v| matches!(v, "1" | "true" | "yes"))
}

/// A block is a system device unless it sits on a removable drive. Cleartext
/// mappings inherit the hint of the device they were unlocked from.
fn hint_system(block: &BlockObject, env: &Env<'_>) -> bool {
    if let Some(v) = hint_override(&block.device, "UDISKS_SYSTEM") {
        return v;
    }
    if let Some(backing) = env.graph.crypto_backing(block) {
        return backing
            .capabilities
            .get(BLOCK)
            .map(|b| b.get_bool("hint_system"))
            .unwrap_or(true);
    }
    match drive_props(block, env) {
        Some(d) => !(d.removable || d.ejectable),
        None => true,
    }
}

fn preferred_device(device: &DeviceDescriptor) -> Option<PathBuf> {
    if let Some(name) = device.dm_name() {
        return Some(PathBuf::from(format!("/dev/mapper/{}", name)));
    }
    device.device_file.clone()
}

pub fn block() -> CapabilityDef<BlockObject> {
    CapabilityDef::new(
        BLOCK,
        |_, _| true,
        |block: &BlockObject, env, _, rep: &mut Representation| {
            let d = &block.device;
            let drive = env.graph.drive_for_block(block).map(|d| d.path.clone());
            let removable_drive = drive_props(block, env).is_some_and(|p| p.removable);
            rep.set(BlockProps {
                device: d.device_file.clone(),
                preferred_device: preferred_device(d),
                symlinks: d.symlinks.clone(),
                device_number: d.devnum,
                size: d.size(),
                read_only: d.read_only(),
                id_usage: d.fs_usage().unwrap_or_default().to_string(),
                id_type: d.fs_type().unwrap_or_default().to_string(),
                id_version: d.property("ID_FS_VERSION").unwrap_or_default().to_string(),
                id_label: d.fs_label().unwrap_or_default().to_string(),
                id_uuid: d.fs_uuid().unwrap_or_default().to_string(),
                drive,
                crypto_backing_device: env.graph.crypto_backing(block).map(|b| b.path.clone()),
                hint_partitionable: d.is_disk() && !d.name.starts_with("dm-"),
                hint_system: hint_system(block, env),
                hint_ignore: hint_override(d, "UDISKS_IGNORE").unwrap_or(false),
                hint_auto: hint_override(d, "UDISKS_AUTO").unwrap_or(removable_drive),
                configuration: env.config.for_block(&BlockIdentity::from(&**d)),
            });
            false
        },
    )
}

pub fn filesystem() -> CapabilityDef<BlockObject> {
    CapabilityDef::new(
        FILESYSTEM,
        |block: &BlockObject, _| block.device.fs_usage() == Some("filesystem"),
        |block: &BlockObject, env, _, rep: &mut Representation| {
            let mount_points = env.mounts.mount_points(block.device.devnum);
            rep.set(serde_json::json!({ "mount_points": mount_points }));
            false
        },
    )
}

pub fn swapspace() -> CapabilityDef<BlockObject> {
    CapabilityDef::new(
        SWAPSPACE,
        |block: &BlockObject, _| {
            block.device.fs_usage() == Some("other") && block.device.fs_type() == Some("swap")
        },
        |block: &BlockObject, env, _, rep: &mut Representation| {
            rep.set(serde_json::json!({ "active": env.mounts.swap_active(&block.device) }));
            false
        },
    )
}

pub fn partition_table() -> CapabilityDef<BlockObject> {
    CapabilityDef::new(
        PARTITION_TABLE,
        |block: &BlockObject, env| {
            if block.device.is_partition() {
                return false;
            }
            block.device.partition_table_type().is_some()
                || (block.device.is_disk() && env.graph.partitions_of(block).next().is_some())
        },
        |block: &BlockObject, env, _, rep: &mut Representation| {
            rep.set(PartitionTableProps {
                table_type: block
                    .device
                    .partition_table_type()
                    .unwrap_or_default()
                    .to_string(),
                partitions: env.graph.partitions_of(block).map(|p| p.path.clone()).collect(),
            });
            false
        },
    )
}

fn parse_part_type(t: &str) -> Option<u32> {
    let t = t.trim();
    let hex = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X"))?;
    u32::from_str_radix(hex, 16).ok()
}

/// Extended (container) partition types on MBR tables.
fn is_dos_container(part_type: &str) -> bool {
    matches!(parse_part_type(part_type), Some(0x05 | 0x0f | 0x85))
}

pub fn partition_props(block: &BlockObject, env: &Env<'_>) -> PartitionProps {
    let d = &block.device;
    let table = env.graph.partition_table_of(block);
    let number = d
        .property_u64("ID_PART_ENTRY_NUMBER")
        .or_else(|| d.attribute_u64("partition"))
        .unwrap_or(0) as u32;
    let scheme = d
        .property("ID_PART_ENTRY_SCHEME")
        .map(str::to_string)
        .or_else(|| {
            table.and_then(|t| t.device.partition_table_type().map(str::to_string))
        })
        .unwrap_or_default();
    let part_type = d
        .property("ID_PART_ENTRY_TYPE")
        .unwrap_or_default()
        .to_string();
    let offset = d
        .property_u64("ID_PART_ENTRY_OFFSET")
        .or_else(|| d.attribute_u64("start"))
        .unwrap_or(0)
        * 512;
    let size = d
        .property_u64("ID_PART_ENTRY_SIZE")
        .map(|s| s * 512)
        .unwrap_or_else(|| d.size());
    let is_dos = scheme == "dos";

    PartitionProps {
        number,
        is_container: is_dos && is_dos_container(&part_type),
        is_contained: is_dos && number >= 5,
        part_type,
        flags: d
            .property("ID_PART_ENTRY_FLAGS")
            .and_then(|f| parse_part_type(f).map(u64::from).or_else(|| f.parse().ok()))
            .unwrap_or(0),
        offset,
        size,
        name: d.property("ID_PART_ENTRY_NAME").unwrap_or_default().to_string(),
        uuid: d.property("ID_PART_ENTRY_UUID").unwrap_or_default().to_string(),
        scheme,
        table: table.map(|t| t.path.clone()),
    }
}

pub fn partition() -> CapabilityDef<BlockObject> {
    CapabilityDef::new(
        PARTITION,
        |block: &BlockObject, _| {
            block.device.is_partition() || block.device.property("ID_PART_ENTRY_SCHEME").is_some()
        },
        |block: &BlockObject, env, _, rep: &mut Representation| {
            rep.set(partition_props(block, env));
            false
        },
    )
}

pub fn encrypted() -> CapabilityDef<BlockObject> {
    CapabilityDef::new(
        ENCRYPTED,
        |block: &BlockObject, _| block.device.fs_usage() == Some("crypto"),
        |block: &BlockObject, env, _, rep: &mut Representation| {
            rep.set(EncryptedProps {
                cleartext_device: env.graph.cleartext_for(block).map(|b| b.path.clone()),
                child_configuration: block
                    .device
                    .fs_uuid()
                    .map(|u| env.config.children_of(u))
                    .unwrap_or_default(),
            });
            false
        },
    )
}
