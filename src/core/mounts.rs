//! Mount and swap state, read from `/proc/self/mountinfo` and `/proc/swaps`.

use std::fs;
use std::path::PathBuf;

use nix::sys::stat::makedev;
use tracing::warn;

use super::configuration::fstab::unescape;
use super::device::DeviceDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub devnum: u64,
    pub mount_point: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct MountTable {
    mounts: Vec<Mount>,
    swaps: Vec<PathBuf>,
}

impl MountTable {
    pub fn new(mounts: Vec<Mount>, swaps: Vec<PathBuf>) -> Self {
        Self { mounts, swaps }
    }

    pub fn mount_points(&self, devnum: u64) -> Vec<PathBuf> {
        self.mounts
            .iter()
            .filter(|m| m.devnum == devnum)
            .map(|m| m.mount_point.clone())
            .collect()
    }

    pub fn is_mounted(&self, devnum: u64) -> bool {
        self.mounts.iter().any(|m| m.devnum == devnum)
    }

    pub fn swap_active(&self, device: &DeviceDescriptor) -> bool {
        self.swaps.iter().any(|s| device.answers_to(s))
    }
}

/// Where mount state comes from. The Linux daemon reads procfs; simulations
/// keep their own table.
pub trait MountSource: Send + Sync {
    fn snapshot(&self) -> MountTable;
}

pub struct ProcMounts;

impl MountSource for ProcMounts {
    fn snapshot(&self) -> MountTable {
        let mounts = match fs::read_to_string("/proc/self/mountinfo") {
            Ok(s) => parse_mountinfo(&s),
            Err(e) => {
                warn!(error = %e, "Failed to read mountinfo");
                Vec::new()
            }
        };
        let swaps = fs::read_to_string("/proc/swaps")
            .map(|s| parse_swaps(&s))
            .unwrap_or_default();
        MountTable::new(mounts, swaps)
    }
}

/// Parse `/proc/self/mountinfo`. Malformed lines are skipped.
pub fn parse_mountinfo(input: &str) -> Vec<Mount> {
    input
        .lines()
        .filter_map(|line| {
            let (left, _) = line.split_once(" - ")?;
            let mut fields = left.split_whitespace();
            let devnum = fields.nth(2)?;
            let mount_point = fields.nth(1)?;
            let (major, minor) = devnum.split_once(':')?;
            Some(Mount {
                devnum: makedev(major.parse().ok()?, minor.parse().ok()?),
                mount_point: PathBuf::from(unescape(mount_point)),
            })
        })
        .collect()
}

/// Parse `/proc/swaps`, skipping the header line.
pub fn parse_swaps(input: &str) -> Vec<PathBuf> {
    input
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(|f| PathBuf::from(unescape(f)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
22 1 8:2 / / rw,relatime shared:1 - ext4 /dev/sda2 rw
40 22 8:17 / /media/user/My\\040Disk rw,nosuid shared:20 - vfat /dev/sdb1 rw
41 22 0:45 / /run/user/1000 rw - tmpfs tmpfs rw
garbage line
";

    #[test]
    fn parses_devnum_and_unescapes_mount_point() {
        let mounts = parse_mountinfo(MOUNTINFO);
        assert_eq!(mounts.len(), 3);
        let table = MountTable::new(mounts, Vec::new());
        assert_eq!(
            table.mount_points(makedev(8, 17)),
            vec![PathBuf::from("/media/user/My Disk")]
        );
        assert!(table.is_mounted(makedev(8, 2)));
        assert!(!table.is_mounted(makedev(8, 18)));
    }

    #[test]
    fn parses_swaps() {
        let swaps = parse_swaps(
            "Filename\tType\tSize\tUsed\tPriority\n/dev/sda3 partition 8388604 0 -2\n",
        );
        assert_eq!(swaps, vec![PathBuf::from("/dev/sda3")]);
    }
}
