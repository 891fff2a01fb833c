//! udev-backed hardware monitor.
//!
//! One thread polls the udev monitor socket and `/proc/self/mountinfo`. The
//! kernel flags the mountinfo file with `POLLPRI` whenever the mount table
//! changes.

use std::fs::{self, File};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::device::{DeviceDescriptor, HardwareEvent, Uevent, UeventAction};
use crate::core::hardware::HardwareMonitor;

/// Sysfs attributes copied into every descriptor.
const ATTRIBUTES: &[&str] = &[
    "size",
    "ro",
    "removable",
    "partition",
    "start",
    "dm/uuid",
    "dm/name",
    "queue/rotational",
];

#[derive(Debug, Clone)]
pub struct LinuxAdapterConfig {
    pub subsystem: String,
    pub mountinfo_path: String,
    /// Poll timeout; bounds how long `stop()` takes to be noticed.
    pub poll_timeout_ms: u16,
}

impl Default for LinuxAdapterConfig {
    fn default() -> Self {
        Self {
            subsystem: "block".to_string(),
            mountinfo_path: "/proc/self/mountinfo".to_string(),
            poll_timeout_ms: 500,
        }
    }
}

pub struct LinuxAdapter {
    config: LinuxAdapterConfig,
    cancelled: Arc<AtomicBool>,
}

impl LinuxAdapter {
    pub fn new(config: LinuxAdapterConfig) -> Self {
        Self {
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(LinuxAdapterConfig::default())
    }
}

fn os(s: Option<&std::ffi::OsStr>) -> String {
    s.map(|v| v.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Sysfs paths of the devices listed under `<syspath>/slaves`.
fn read_slaves(syspath: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(syspath.join("slaves")) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| fs::canonicalize(e.path()).ok())
        .map(|p| p.display().to_string())
        .collect()
}

pub(crate) fn descriptor_from_udev(device: &udev::Device) -> DeviceDescriptor {
    let properties = device
        .properties()
        .map(|p| (os(Some(p.name())), os(Some(p.value()))))
        .collect();
    let attributes = ATTRIBUTES
        .iter()
        .filter_map(|name| {
            device
                .attribute_value(name)
                .map(|v| (name.to_string(), v.to_string_lossy().trim().to_string()))
        })
        .collect();
    let symlinks = device
        .property_value("DEVLINKS")
        .map(|v| {
            v.to_string_lossy()
                .split_whitespace()
                .map(Into::into)
                .collect()
        })
        .unwrap_or_default();

    let mut parent_subsystems = Vec::new();
    let mut block_parent = None;
    let mut current = device.parent();
    while let Some(p) = current {
        let subsystem = os(p.subsystem());
        if subsystem == "block" && block_parent.is_none() {
            block_parent = Some(p.syspath().display().to_string());
        }
        if !subsystem.is_empty() && !parent_subsystems.contains(&subsystem) {
            parent_subsystems.push(subsystem);
        }
        current = p.parent();
    }

    DeviceDescriptor {
        sysfs_path: device.syspath().display().to_string(),
        name: os(Some(device.sysname())),
        subsystem: os(device.subsystem()),
        devtype: os(device.devtype()),
        device_file: device.devnode().map(Path::to_path_buf),
        symlinks,
        devnum: device.devnum().unwrap_or(0),
        properties,
        attributes,
        slaves: read_slaves(device.syspath()),
        parent: block_parent,
        parent_subsystems,
    }
}

fn monitor_loop(
    config: LinuxAdapterConfig,
    cancelled: Arc<AtomicBool>,
    tx: mpsc::Sender<HardwareEvent>,
) -> Result<()> {
    let socket = udev::MonitorBuilder::new()?
        .match_subsystem(&config.subsystem)?
        .listen()
        .context("Failed to open udev monitor")?;
    let mountinfo = File::open(&config.mountinfo_path)
        .with_context(|| format!("Failed to open {}", config.mountinfo_path))?;

    info!(subsystem = %config.subsystem, "udev monitor started");

    while !cancelled.load(Ordering::Relaxed) {
        // SAFETY: the socket outlives this borrow; it is dropped after the loop.
        let socket_fd = unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) };
        let mut fds = [
            PollFd::new(socket_fd, PollFlags::POLLIN),
            PollFd::new(mountinfo.as_fd(), PollFlags::POLLPRI),
        ];
        match poll(&mut fds, PollTimeout::from(config.poll_timeout_ms)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(e).context("poll failed"),
        }

        let uevents_ready = fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        let mounts_changed = fds[1]
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLPRI | PollFlags::POLLERR));

        if uevents_ready {
            for event in socket.iter() {
                let action = UeventAction::parse(&os(event.action()));
                let descriptor = descriptor_from_udev(&event.device());
                debug!(action = action.as_str(), sysfs_path = %descriptor.sysfs_path, "uevent");
                let event = HardwareEvent::Uevent(Uevent::new(action, descriptor));
                if tx.blocking_send(event).is_err() {
                    return Ok(());
                }
            }
        }
        if mounts_changed && tx.blocking_send(HardwareEvent::MountsChanged).is_err() {
            return Ok(());
        }
    }

    info!("udev monitor stopped");
    Ok(())
}

impl HardwareMonitor for LinuxAdapter {
    fn start(&self, tx: mpsc::Sender<HardwareEvent>) {
        self.cancelled.store(false, Ordering::Relaxed);
        let config = self.config.clone();
        let cancelled = self.cancelled.clone();
        let spawned = std::thread::Builder::new()
            .name("udev-monitor".to_string())
            .spawn(move || {
                if let Err(e) = monitor_loop(config, cancelled, tx) {
                    error!(error = %e, "udev monitor failed");
                }
            });
        if let Err(e) = spawned {
            error!(error = %e, "Failed to spawn udev monitor thread");
        }
    }

    fn stop(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    fn coldplug(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut enumerator = udev::Enumerator::new()?;
        enumerator.match_subsystem(&self.config.subsystem)?;
        let mut devices: Vec<DeviceDescriptor> = enumerator
            .scan_devices()
            .context("Failed to enumerate block devices")?
            .map(|d| descriptor_from_udev(&d))
            .collect();
        // Whole disks before partitions, mappings last.
        devices.sort_by_key(|d| (!d.is_disk(), !d.slaves.is_empty(), d.sysfs_path.clone()));
        if devices.is_empty() {
            warn!("No block devices found during coldplug");
        }
        Ok(devices)
    }
}
