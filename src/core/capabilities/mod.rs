//! Built-in capability definitions for drives and blocks.

pub mod block;
pub mod drive;

use super::capability::CapabilityDef;
use super::objects::{BlockObject, DriveObject};

pub const DRIVE: &str = "drive";
pub const DRIVE_ATA: &str = "drive-ata";
pub const BLOCK: &str = "block";
pub const FILESYSTEM: &str = "filesystem";
pub const SWAPSPACE: &str = "swapspace";
pub const PARTITION_TABLE: &str = "partition-table";
pub const PARTITION: &str = "partition";
pub const ENCRYPTED: &str = "encrypted";

pub fn drive_capabilities() -> Vec<CapabilityDef<DriveObject>> {
    vec![drive::drive(), drive::drive_ata()]
}

pub fn block_capabilities() -> Vec<CapabilityDef<BlockObject>> {
    vec![
        block::block(),
        block::filesystem(),
        block::swapspace(),
        block::partition_table(),
        block::partition(),
        block::encrypted(),
    ]
}
