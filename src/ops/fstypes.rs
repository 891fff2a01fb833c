//! Content types that can be created on a block, and the partition type
//! each one implies.

use crate::core::platform::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Creation {
    /// Shell command with `$DEVICE` and `$LABEL` placeholders.
    Command(&'static str),
    /// Written with the platform's partition-table primitive.
    PartitionTable,
}

#[derive(Debug, Clone, Copy)]
pub struct FsInfo {
    pub id: &'static str,
    pub creation: Creation,
    /// Whether the root directory can be handed to the caller after creation.
    pub supports_owners: bool,
}

const FS_TYPES: &[FsInfo] = &[
    FsInfo {
        id: "ext2",
        creation: Creation::Command("mkfs.ext2 -F -L $LABEL $DEVICE"),
        supports_owners: true,
    },
    FsInfo {
        id: "ext3",
        creation: Creation::Command("mkfs.ext3 -F -L $LABEL $DEVICE"),
        supports_owners: true,
    },
    FsInfo {
        id: "ext4",
        creation: Creation::Command("mkfs.ext4 -F -L $LABEL $DEVICE"),
        supports_owners: true,
    },
    FsInfo {
        id: "xfs",
        creation: Creation::Command("mkfs.xfs -f -L $LABEL $DEVICE"),
        supports_owners: true,
    },
    FsInfo {
        id: "btrfs",
        creation: Creation::Command("mkfs.btrfs -f -L $LABEL $DEVICE"),
        supports_owners: true,
    },
    FsInfo {
        id: "vfat",
        creation: Creation::Command("mkfs.vfat -I -n $LABEL $DEVICE"),
        supports_owners: false,
    },
    FsInfo {
        id: "ntfs",
        creation: Creation::Command("mkntfs -f -F -L $LABEL $DEVICE"),
        supports_owners: false,
    },
    FsInfo {
        id: "exfat",
        creation: Creation::Command("mkfs.exfat -n $LABEL $DEVICE"),
        supports_owners: false,
    },
    FsInfo {
        id: "swap",
        creation: Creation::Command("mkswap -L $LABEL $DEVICE"),
        supports_owners: false,
    },
    FsInfo {
        id: "empty",
        creation: Creation::Command("wipefs -a $DEVICE"),
        supports_owners: false,
    },
    FsInfo {
        id: "dos",
        creation: Creation::PartitionTable,
        supports_owners: false,
    },
    FsInfo {
        id: "gpt",
        creation: Creation::PartitionTable,
        supports_owners: false,
    },
];

pub fn fs_info(id: &str) -> Option<&'static FsInfo> {
    FS_TYPES.iter().find(|f| f.id == id)
}

impl FsInfo {
    pub fn supports_label(&self) -> bool {
        matches!(self.creation, Creation::Command(t) if t.contains("$LABEL"))
    }

    /// The creation command for `device`, or `None` for partition tables.
    pub fn command(&self, device: &str, label: Option<&str>) -> Option<String> {
        match self.creation {
            Creation::Command(template) => Some(
                template
                    .replace("$DEVICE", &shell_quote(device))
                    .replace("$LABEL", &shell_quote(label.unwrap_or(""))),
            ),
            Creation::PartitionTable => None,
        }
    }
}

const PARTITION_TYPES: &[(&str, &str, &str)] = &[
    ("dos", "vfat", "0x0c"),
    ("dos", "ntfs", "0x07"),
    ("dos", "exfat", "0x0c"),
    ("dos", "swap", "0x82"),
    ("dos", "ext2", "0x83"),
    ("dos", "ext3", "0x83"),
    ("dos", "ext4", "0x83"),
    ("dos", "xfs", "0x83"),
    ("dos", "btrfs", "0x83"),
    ("dos", "crypto_LUKS", "0x83"),
    ("gpt", "vfat", "ebd0a0a2-b9e5-4433-87c0-68b6b72699c7"),
    ("gpt", "ntfs", "ebd0a0a2-b9e5-4433-87c0-68b6b72699c7"),
    ("gpt", "exfat", "ebd0a0a2-b9e5-4433-87c0-68b6b72699c7"),
    ("gpt", "swap", "0657fd6d-a4ab-43c4-84e5-0933c84b4f4f"),
    ("gpt", "ext2", "0fc63daf-8483-4772-8e79-3d69d8477de4"),
    ("gpt", "ext3", "0fc63daf-8483-4772-8e79-3d69d8477de4"),
    ("gpt", "ext4", "0fc63daf-8483-4772-8e79-3d69d8477de4"),
    ("gpt", "xfs", "0fc63daf-8483-4772-8e79-3d69d8477de4"),
    ("gpt", "btrfs", "0fc63daf-8483-4772-8e79-3d69d8477de4"),
    ("gpt", "crypto_LUKS", "0fc63daf-8483-4772-8e79-3d69d8477de4"),
];

/// Partition type code implied by putting `content` into a `table_type` table.
pub fn partition_type_for(table_type: &str, content: &str) -> Option<&'static str> {
    PARTITION_TYPES
        .iter()
        .find(|(t, c, _)| *t == table_type && *c == content)
        .map(|(_, _, p)| *p)
}

/// Partition type codes compare case-insensitively, and `0xc` equals `0x0c`.
pub fn same_partition_type(a: &str, b: &str) -> bool {
    let hex = |s: &str| {
        s.strip_prefix("0x")
            .and_then(|h| u32::from_str_radix(h, 16).ok())
    };
    match (hex(a), hex(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a.eq_ignore_ascii_case(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_quoted_device_and_label() {
        let ext4 = fs_info("ext4").unwrap();
        assert_eq!(
            ext4.command("/dev/sdb1", Some("My Disk")).unwrap(),
            "mkfs.ext4 -F -L 'My Disk' '/dev/sdb1'"
        );
        assert_eq!(
            ext4.command("/dev/sdb1", None).unwrap(),
            "mkfs.ext4 -F -L '' '/dev/sdb1'"
        );
    }

    #[test]
    fn label_support_follows_template() {
        assert!(fs_info("vfat").unwrap().supports_label());
        assert!(!fs_info("empty").unwrap().supports_label());
        assert!(!fs_info("gpt").unwrap().supports_label());
        assert!(fs_info("reiserfs").is_none());
    }

    #[test]
    fn partition_type_lookup() {
        assert_eq!(partition_type_for("dos", "vfat"), Some("0x0c"));
        assert_eq!(
            partition_type_for("gpt", "crypto_LUKS"),
            Some("0fc63daf-8483-4772-8e79-3d69d8477de4")
        );
        assert_eq!(partition_type_for("dos", "empty"), None);
        assert!(same_partition_type("0xc", "0x0c"));
        assert!(same_partition_type(
            "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
            "0fc63daf-8483-4772-8e79-3d69d8477de4"
        ));
        assert!(!same_partition_type("0x83", "0x0c"));
    }
}
