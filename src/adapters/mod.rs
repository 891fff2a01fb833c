//! Hardware backends: real udev plus procfs, or the in-process simulator.

use std::path::Path;
use std::sync::Arc;

use crate::core::hardware::HardwareMonitor;
use crate::core::mounts::{MountSource, ProcMounts};
use crate::core::{LinuxPlatform, Platform};

pub mod linux;
pub mod simulated;

pub use linux::{LinuxAdapter, LinuxAdapterConfig};
pub use simulated::{SimulatedMonitor, SimulatedMounts, SimulatedPlatform, Simulator};

/// Everything the daemon needs from the host.
pub struct Backend {
    pub monitor: Box<dyn HardwareMonitor>,
    pub platform: Arc<dyn Platform>,
    pub mounts: Arc<dyn MountSource>,
}

/// Pick the backend. In simulation the devices are driven from stdin:
///
/// ```text
/// add <name> <size-mib>
/// part <disk> <number> <size-mib> [type]
/// rm <name>
/// mount <name> <mount-point>
/// umount
/// fail <tool> <message...>
/// ```
pub fn get_backend(simulation: bool, data_dir: &Path) -> Backend {
    if simulation {
        let (monitor, sim) = SimulatedMonitor::new(data_dir);
        let backend = Backend {
            monitor: Box::new(monitor),
            platform: Arc::new(sim.platform()),
            mounts: Arc::new(sim.mount_source()),
        };
        std::thread::spawn(move || drive_from_stdin(sim));
        return backend;
    }

    Backend {
        monitor: Box::new(LinuxAdapter::with_defaults()),
        platform: Arc::new(LinuxPlatform),
        mounts: Arc::new(ProcMounts),
    }
}

const MIB: u64 = 1024 * 1024;

fn drive_from_stdin(sim: Simulator) {
    for line in std::io::stdin().lines().map_while(Result::ok) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let num = |i: usize, default: u64| {
            parts
                .get(i)
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        };
        match parts.as_slice() {
            ["add", name, ..] => {
                sim.add_disk(name, num(2, 64) * MIB);
            }
            ["part", disk, number, ..] => {
                let number: u32 = number.parse().unwrap_or(1);
                let size = num(3, 16) * MIB;
                let offset = MIB + (number as u64).saturating_sub(1) * size;
                let part_type = parts.get(4).copied().unwrap_or("0x83");
                sim.add_partition(disk, number, offset, size, part_type, "dos");
            }
            ["rm", name] => sim.remove(name),
            ["mount", name, target] => sim.mount(name, Path::new(target)),
            ["umount"] => sim.unmount_all(),
            ["fail", tool, message @ ..] => sim.fail_tool(tool, &message.join(" ")),
            _ => eprintln!(
                "(simulator) commands: add <name> [MiB] | part <disk> <n> [MiB] [type] | rm <name> | mount <name> <dir> | umount | fail <tool> <msg>"
            ),
        }
    }
}
