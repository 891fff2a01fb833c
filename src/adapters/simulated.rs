//! In-process stand-in for the kernel, udev and the external tools.
//!
//! A [`Simulator`] owns a table of fake block devices, each backed by a
//! sparse temp file. [`SimulatedMonitor`] forwards the uevents it produces,
//! [`SimulatedPlatform`] interprets the tool invocations an operation makes
//! and mutates the fake devices the way the real tool would change what
//! udev probes, and [`SimulatedMounts`] exposes the fake mount table.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use nix::sys::stat::makedev;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::core::device::{DeviceDescriptor, HardwareEvent, Uevent, UeventAction};
use crate::core::hardware::HardwareMonitor;
use crate::core::mounts::{Mount, MountSource, MountTable};
use crate::core::platform::{OpenMode, Platform, tool_name};
use crate::error::StorageError;

const SCSI_MAJOR: u64 = 8;
const DM_MAJOR: u64 = 253;
const SYSFS_ROOT: &str = "/sys/devices/virtual/block";

/// Ownership change recorded instead of calling `chown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerChange {
    pub path: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

#[derive(Default)]
struct SimState {
    devices: BTreeMap<String, DeviceDescriptor>,
    backing: HashMap<String, PathBuf>,
    passphrases: HashMap<String, String>,
    mounts: Vec<Mount>,
    failing: HashMap<String, String>,
    silent: HashSet<String>,
    commands: Vec<String>,
    owners: Vec<OwnerChange>,
    next_minor: u64,
    next_dm: u64,
}

impl SimState {
    fn by_device_file(&self, device: &Path) -> Option<&DeviceDescriptor> {
        self.devices.values().find(|d| d.answers_to(device))
    }

    fn sysfs_for(&self, device: &Path) -> Result<String, StorageError> {
        self.by_device_file(device)
            .map(|d| d.sysfs_path.clone())
            .ok_or_else(|| StorageError::NotFound(format!("No such device {}", device.display())))
    }

    fn partitions_of(&self, disk_sysfs: &str) -> Vec<String> {
        self.devices
            .values()
            .filter(|d| d.parent.as_deref() == Some(disk_sysfs))
            .map(|d| d.sysfs_path.clone())
            .collect()
    }
}

fn clear_probe(d: &mut DeviceDescriptor) {
    d.properties
        .retain(|k, _| !k.starts_with("ID_FS_") && !k.starts_with("ID_PART_TABLE_"));
}

/// Split a command line built with single-quoted arguments.
fn split_args(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;
    for c in command.chars() {
        match c {
            '\'' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

fn arg_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Handle used by tests and the stdin driver to change the simulated hardware.
#[derive(Clone)]
pub struct Simulator {
    state: Arc<Mutex<SimState>>,
    tx: mpsc::UnboundedSender<HardwareEvent>,
    data_dir: Arc<PathBuf>,
}

impl Simulator {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, action: UeventAction, device: DeviceDescriptor) {
        debug!(action = action.as_str(), sysfs_path = %device.sysfs_path, "Simulated uevent");
        let _ = self
            .tx
            .send(HardwareEvent::Uevent(Uevent::new(action, device)));
    }

    fn emit_sysfs(&self, action: UeventAction, sysfs_path: &str) -> Result<(), StorageError> {
        let device = self
            .lock()
            .devices
            .get(sysfs_path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("No such device {}", sysfs_path)))?;
        self.emit(action, device);
        Ok(())
    }

    fn create_backing(&self, name: &str, size: u64) -> PathBuf {
        let path = self.data_dir.join(format!("{}.img", name));
        if let Ok(file) = File::create(&path) {
            let _ = file.set_len(size);
        }
        path
    }

    fn insert(&self, device: DeviceDescriptor, size: u64) -> DeviceDescriptor {
        let backing = self.create_backing(&device.name, size);
        let mut state = self.lock();
        state.backing.insert(device.sysfs_path.clone(), backing);
        state.devices.insert(device.sysfs_path.clone(), device.clone());
        device
    }

    fn alloc_minor(&self) -> u64 {
        let mut state = self.lock();
        state.next_minor += 16;
        state.next_minor
    }

    /// Plug in a whole disk of `size` bytes on a removable drive.
    pub fn add_disk(&self, name: &str, size: u64) -> DeviceDescriptor {
        let minor = self.alloc_minor();
        let device = DeviceDescriptor {
            sysfs_path: format!("{}/{}", SYSFS_ROOT, name),
            name: name.to_string(),
            subsystem: "block".to_string(),
            devtype: "disk".to_string(),
            device_file: Some(PathBuf::from(format!("/dev/{}", name))),
            devnum: makedev(SCSI_MAJOR, minor),
            ..Default::default()
        }
        .with_property("ID_VENDOR", "Simulated")
        .with_property("ID_MODEL", "Disk")
        .with_property("ID_SERIAL", format!("Simulated_Disk_{}", name))
        .with_property("ID_SERIAL_SHORT", name)
        .with_property("ID_BUS", "usb")
        .with_attribute("size", (size / 512).to_string())
        .with_attribute("removable", "1");
        let device = self.insert(device, size);
        info!(name, size, "Simulated disk added");
        self.emit(UeventAction::Add, device.clone());
        device
    }

    /// Add partition `number` to `disk`, writing a partition table of
    /// `scheme` if the disk has none yet.
    pub fn add_partition(
        &self,
        disk: &str,
        number: u32,
        offset: u64,
        size: u64,
        part_type: &str,
        scheme: &str,
    ) -> DeviceDescriptor {
        let disk_sysfs = format!("{}/{}", SYSFS_ROOT, disk);
        let (disk_devnum, disk_changed) = {
            let mut state = self.lock();
            let Some(d) = state.devices.get_mut(&disk_sysfs) else {
                return DeviceDescriptor::default();
            };
            let changed = d.partition_table_type().is_none();
            if changed {
                clear_probe(d);
                d.properties
                    .insert("ID_PART_TABLE_TYPE".into(), scheme.to_string());
            }
            (d.devnum, changed.then(|| d.clone()))
        };
        if let Some(d) = disk_changed {
            self.emit(UeventAction::Change, d);
        }

        let name = format!("{}{}", disk, number);
        let device = DeviceDescriptor {
            sysfs_path: format!("{}/{}", disk_sysfs, name),
            name: name.clone(),
            subsystem: "block".to_string(),
            devtype: "partition".to_string(),
            device_file: Some(PathBuf::from(format!("/dev/{}", name))),
            devnum: disk_devnum + number as u64,
            parent: Some(disk_sysfs),
            ..Default::default()
        }
        .with_property("ID_PART_ENTRY_SCHEME", scheme)
        .with_property("ID_PART_ENTRY_NUMBER", number.to_string())
        .with_property("ID_PART_ENTRY_TYPE", part_type)
        .with_property("ID_PART_ENTRY_OFFSET", (offset / 512).to_string())
        .with_property("ID_PART_ENTRY_SIZE", (size / 512).to_string())
        .with_property("ID_PART_ENTRY_UUID", Uuid::new_v4().to_string())
        .with_attribute("size", (size / 512).to_string())
        .with_attribute("partition", number.to_string());
        let device = self.insert(device, size);
        self.emit(UeventAction::Add, device.clone());
        device
    }

    /// Set udev properties on `name` and emit a `change`.
    pub fn set_properties(&self, name: &str, props: &[(&str, &str)]) {
        let changed = {
            let mut state = self.lock();
            state
                .devices
                .values_mut()
                .find(|d| d.name == name)
                .map(|d| {
                    for (k, v) in props {
                        d.properties.insert(k.to_string(), v.to_string());
                    }
                    d.clone()
                })
        };
        if let Some(d) = changed {
            self.emit(UeventAction::Change, d);
        }
    }

    /// Unplug `name` and everything on top of it.
    pub fn remove(&self, name: &str) {
        let removed: Vec<DeviceDescriptor> = {
            let mut state = self.lock();
            let Some(root) = state.devices.values().find(|d| d.name == name).cloned() else {
                return;
            };
            let mut doomed: Vec<String> = state.partitions_of(&root.sysfs_path);
            doomed.push(root.sysfs_path.clone());
            let holders: Vec<String> = state
                .devices
                .values()
                .filter(|d| d.slaves.iter().any(|s| doomed.contains(s)))
                .map(|d| d.sysfs_path.clone())
                .collect();
            holders
                .into_iter()
                .chain(doomed)
                .filter_map(|s| {
                    state.backing.remove(&s);
                    state.devices.remove(&s)
                })
                .collect()
        };
        for d in removed {
            self.emit(UeventAction::Remove, d);
        }
    }

    /// Re-emit `change` for `name` without modifying it.
    pub fn change(&self, name: &str) {
        let device = self.lock().devices.values().find(|d| d.name == name).cloned();
        if let Some(d) = device {
            self.emit(UeventAction::Change, d);
        }
    }

    pub fn mount(&self, name: &str, mount_point: &Path) {
        {
            let mut state = self.lock();
            let Some(devnum) = state.devices.values().find(|d| d.name == name).map(|d| d.devnum)
            else {
                return;
            };
            state.mounts.push(Mount {
                devnum,
                mount_point: mount_point.to_path_buf(),
            });
        }
        let _ = self.tx.send(HardwareEvent::MountsChanged);
    }

    pub fn unmount_all(&self) {
        self.lock().mounts.clear();
        let _ = self.tx.send(HardwareEvent::MountsChanged);
    }

    /// Make every future run of `tool` fail with `stderr`.
    pub fn fail_tool(&self, tool: &str, stderr: &str) {
        self.lock()
            .failing
            .insert(tool.to_string(), stderr.to_string());
    }

    /// Let `tool` succeed without changing anything, so waits on its effect
    /// time out.
    pub fn silence_tool(&self, tool: &str) {
        self.lock().silent.insert(tool.to_string());
    }

    /// Every command line run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    pub fn owner_changes(&self) -> Vec<OwnerChange> {
        self.lock().owners.clone()
    }

    pub fn device(&self, name: &str) -> Option<DeviceDescriptor> {
        self.lock().devices.values().find(|d| d.name == name).cloned()
    }

    pub fn platform(&self) -> SimulatedPlatform {
        SimulatedPlatform { sim: self.clone() }
    }

    pub fn mount_source(&self) -> SimulatedMounts {
        SimulatedMounts { sim: self.clone() }
    }

    fn set_filesystem(&self, device: &Path, usage: &str, fs_type: &str, label: Option<&str>) -> Result<(), StorageError> {
        let mut state = self.lock();
        let sysfs = state.sysfs_for(device)?;
        if let Some(d) = state.devices.get_mut(&sysfs) {
            clear_probe(d);
            d.properties.insert("ID_FS_USAGE".into(), usage.to_string());
            d.properties.insert("ID_FS_TYPE".into(), fs_type.to_string());
            d.properties
                .insert("ID_FS_UUID".into(), Uuid::new_v4().to_string());
            if let Some(label) = label.filter(|l| !l.is_empty()) {
                d.properties.insert("ID_FS_LABEL".into(), label.to_string());
            }
        }
        Ok(())
    }

    fn wipe(&self, device: &Path) -> Result<(), StorageError> {
        let mut state = self.lock();
        let sysfs = state.sysfs_for(device)?;
        if let Some(d) = state.devices.get_mut(&sysfs) {
            clear_probe(d);
        }
        Ok(())
    }

    fn luks_open(&self, device: &Path, name: &str, passphrase: &str) -> Result<(), StorageError> {
        let created = {
            let mut state = self.lock();
            let sysfs = state.sysfs_for(device)?;
            if state.passphrases.get(&sysfs).map(String::as_str) != Some(passphrase) {
                return Err(StorageError::ExternalToolFailed {
                    tool: "cryptsetup".to_string(),
                    status: "exit status: 2".to_string(),
                    stderr: "No key available with this passphrase.".to_string(),
                });
            }
            let backing = state.devices.get(&sysfs).cloned().unwrap_or_default();
            state.next_dm += 1;
            let dm = format!("dm-{}", state.next_dm - 1);
            let uuid = backing.fs_uuid().unwrap_or_default().replace('-', "");
            DeviceDescriptor {
                sysfs_path: format!("{}/{}", SYSFS_ROOT, dm),
                name: dm.clone(),
                subsystem: "block".to_string(),
                devtype: "disk".to_string(),
                device_file: Some(PathBuf::from(format!("/dev/{}", dm))),
                symlinks: vec![PathBuf::from(format!("/dev/mapper/{}", name))],
                devnum: makedev(DM_MAJOR, state.next_dm - 1),
                slaves: vec![sysfs],
                ..Default::default()
            }
            .with_attribute("dm/name", name)
            .with_attribute("dm/uuid", format!("CRYPT-LUKS2-{}-{}", uuid, name))
            .with_attribute("size", backing.attribute("size").unwrap_or("0"))
        };
        let size = created.size();
        let created = self.insert(created, size);
        self.emit(UeventAction::Add, created);
        Ok(())
    }

    fn luks_close(&self, device: &Path) -> Result<(), StorageError> {
        let removed = {
            let mut state = self.lock();
            let sysfs = state.sysfs_for(device)?;
            state.backing.remove(&sysfs);
            state.devices.remove(&sysfs)
        };
        if let Some(d) = removed {
            self.emit(UeventAction::Remove, d);
        }
        Ok(())
    }

    fn set_part_type(&self, disk: &Path, number: &str, part_type: &str) -> Result<(), StorageError> {
        let changed = {
            let mut state = self.lock();
            let disk_sysfs = state.sysfs_for(disk)?;
            let target = state
                .devices
                .values_mut()
                .find(|d| {
                    d.parent.as_deref() == Some(disk_sysfs.as_str())
                        && d.property("ID_PART_ENTRY_NUMBER") == Some(number)
                })
                .ok_or_else(|| StorageError::ExternalToolFailed {
                    tool: "sfdisk".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: format!("partition {} does not exist", number),
                })?;
            target
                .properties
                .insert("ID_PART_ENTRY_TYPE".into(), part_type.to_string());
            target.clone()
        };
        self.emit(UeventAction::Change, changed);
        Ok(())
    }

    fn create_table(&self, device: &Path, script: &str) -> Result<(), StorageError> {
        let table = script
            .lines()
            .find_map(|l| l.strip_prefix("label:"))
            .map(str::trim)
            .unwrap_or("dos")
            .to_string();
        let mut state = self.lock();
        let sysfs = state.sysfs_for(device)?;
        if let Some(d) = state.devices.get_mut(&sysfs) {
            clear_probe(d);
            d.properties.insert("ID_PART_TABLE_TYPE".into(), table);
        }
        Ok(())
    }

    /// Interpret one tool invocation.
    fn apply(&self, command: &str, stdin: Option<&str>) -> Result<(), StorageError> {
        let args = split_args(command);
        let tool = tool_name(command);
        let device = |i: usize| PathBuf::from(args.get(i).map(String::as_str).unwrap_or(""));
        let last = PathBuf::from(args.last().map(String::as_str).unwrap_or(""));

        match tool {
            "wipefs" => self.wipe(&last),
            "cryptsetup" => match args.get(1).map(String::as_str) {
                Some("luksFormat") => {
                    let dev = device(2);
                    self.set_filesystem(&dev, "crypto", "crypto_LUKS", None)?;
                    let mut state = self.lock();
                    let sysfs = state.sysfs_for(&dev)?;
                    state
                        .passphrases
                        .insert(sysfs, stdin.unwrap_or_default().to_string());
                    Ok(())
                }
                Some("luksOpen") => self.luks_open(
                    &device(2),
                    args.get(3).map(String::as_str).unwrap_or("luks"),
                    stdin.unwrap_or_default(),
                ),
                Some("luksClose") => self.luks_close(&device(2)),
                _ => Ok(()),
            },
            "mkswap" => self.set_filesystem(&last, "other", "swap", arg_after(&args, "-L")),
            "mkntfs" => self.set_filesystem(&last, "filesystem", "ntfs", arg_after(&args, "-L")),
            t if t.starts_with("mkfs.") => {
                let fs_type = &t["mkfs.".len()..];
                let label = arg_after(&args, "-L").or_else(|| arg_after(&args, "-n"));
                self.set_filesystem(&last, "filesystem", fs_type, label)
            }
            "sfdisk" if args.iter().any(|a| a == "--part-type") => {
                let i = args.iter().position(|a| a == "--part-type").unwrap_or(0);
                self.set_part_type(
                    &device(i + 1),
                    args.get(i + 2).map(String::as_str).unwrap_or(""),
                    args.get(i + 3).map(String::as_str).unwrap_or(""),
                )
            }
            "sfdisk" => self.create_table(&last, stdin.unwrap_or_default()),
            _ => Ok(()),
        }
    }
}

/// Forwards the simulator's uevents to the daemon.
pub struct SimulatedMonitor {
    // Taken by `start()`, which only gets `&self`.
    cmd_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<HardwareEvent>>>>,
}

impl SimulatedMonitor {
    /// A monitor and the simulator driving it. Backing files live in `data_dir`.
    pub fn new(data_dir: &Path) -> (Self, Simulator) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sim = Simulator {
            state: Arc::new(Mutex::new(SimState::default())),
            tx,
            data_dir: Arc::new(data_dir.to_path_buf()),
        };
        (
            Self {
                cmd_rx: Arc::new(Mutex::new(Some(rx))),
            },
            sim,
        )
    }
}

impl HardwareMonitor for SimulatedMonitor {
    fn start(&self, daemon_tx: mpsc::Sender<HardwareEvent>) {
        let rx = self
            .cmd_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = rx else {
            tracing::warn!("SimulatedMonitor already started");
            return;
        };

        info!("Simulated monitor started");

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if daemon_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }

    fn stop(&self) {}

    /// Devices added before `start()` are replayed from the queue, so there
    /// is nothing to enumerate.
    fn coldplug(&self) -> anyhow::Result<Vec<DeviceDescriptor>> {
        Ok(Vec::new())
    }
}

pub struct SimulatedMounts {
    sim: Simulator,
}

impl MountSource for SimulatedMounts {
    fn snapshot(&self) -> MountTable {
        MountTable::new(self.sim.lock().mounts.clone(), Vec::new())
    }
}

pub struct SimulatedPlatform {
    sim: Simulator,
}

#[async_trait]
impl Platform for SimulatedPlatform {
    async fn run_tool(&self, command: &str, stdin: Option<&str>) -> Result<(), StorageError> {
        let tool = tool_name(command).to_string();
        let (failure, silent) = {
            let mut state = self.sim.lock();
            state.commands.push(command.to_string());
            (state.failing.get(&tool).cloned(), state.silent.contains(&tool))
        };
        debug!(%command, "Simulated tool");
        if let Some(stderr) = failure {
            return Err(StorageError::ExternalToolFailed {
                tool,
                status: "exit status: 1".to_string(),
                stderr,
            });
        }
        if silent {
            return Ok(());
        }
        self.sim.apply(command, stdin)
    }

    fn trigger_uevent(&self, sysfs_path: &str) -> Result<(), StorageError> {
        self.sim.emit_sysfs(UeventAction::Change, sysfs_path)
    }

    /// Drops partitions whose table has been wiped.
    fn reread_partition_table(&self, device: &Path) -> Result<(), StorageError> {
        let removed: Vec<DeviceDescriptor> = {
            let mut state = self.sim.lock();
            let sysfs = state.sysfs_for(device)?;
            let has_table = state
                .devices
                .get(&sysfs)
                .is_some_and(|d| d.partition_table_type().is_some());
            if has_table {
                return Ok(());
            }
            state
                .partitions_of(&sysfs)
                .into_iter()
                .filter_map(|p| {
                    state.backing.remove(&p);
                    state.devices.remove(&p)
                })
                .collect()
        };
        for d in removed {
            self.sim.emit(UeventAction::Remove, d);
        }
        Ok(())
    }

    fn mount(&self, device: &Path, target: &Path, _fs_type: &str) -> Result<(), StorageError> {
        let mut state = self.sim.lock();
        let devnum = state
            .by_device_file(device)
            .filter(|d| d.fs_usage() == Some("filesystem"))
            .map(|d| d.devnum)
            .ok_or_else(|| {
                StorageError::Failed(format!(
                    "Cannot mount {} at {}: no filesystem",
                    device.display(),
                    target.display()
                ))
            })?;
        state.mounts.push(Mount {
            devnum,
            mount_point: target.to_path_buf(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), StorageError> {
        let mut state = self.sim.lock();
        let before = state.mounts.len();
        state.mounts.retain(|m| m.mount_point != target);
        if state.mounts.len() == before {
            return Err(StorageError::Failed(format!(
                "Cannot unmount {}: not mounted",
                target.display()
            )));
        }
        Ok(())
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32, mode: u32) -> Result<(), StorageError> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| StorageError::io(format!("Cannot chmod {}", path.display()), e))?;
        self.sim.lock().owners.push(OwnerChange {
            path: path.to_path_buf(),
            uid,
            gid,
            mode,
        });
        Ok(())
    }

    fn open_device(&self, device: &Path, mode: OpenMode) -> Result<File, StorageError> {
        let backing = {
            let state = self.sim.lock();
            let sysfs = state.sysfs_for(device)?;
            state.backing.get(&sysfs).cloned()
        }
        .ok_or_else(|| StorageError::NotFound(format!("No backing file for {}", device.display())))?;

        let mut opts = OpenOptions::new();
        match mode {
            OpenMode::Backup => opts.read(true),
            OpenMode::Restore | OpenMode::Erase => opts.write(true),
            OpenMode::Benchmark { writable } => opts.read(true).write(writable),
        };
        opts.open(&backing)
            .map_err(|e| StorageError::io(format!("Error opening {}", device.display()), e))
    }

    fn device_size(&self, file: &File) -> Result<u64, StorageError> {
        file.metadata()
            .map(|m| m.len())
            .map_err(|e| StorageError::io("Error determining size of device", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_quoted_arguments() {
        assert_eq!(
            split_args("mkfs.ext4 -F -L 'My Disk' '/dev/sdb1'"),
            vec!["mkfs.ext4", "-F", "-L", "My Disk", "/dev/sdb1"]
        );
        assert_eq!(split_args("mkfs.ext4 -L '' x"), vec!["mkfs.ext4", "-L", "", "x"]);
    }

    #[tokio::test]
    async fn mkfs_changes_probe_result() {
        let dir = tempfile::tempdir().unwrap();
        let (_monitor, sim) = SimulatedMonitor::new(dir.path());
        sim.add_disk("sdx", 1 << 20);
        let platform = sim.platform();

        platform
            .run_tool("mkfs.vfat -I -n 'DATA' '/dev/sdx'", None)
            .await
            .unwrap();
        let d = sim.device("sdx").unwrap();
        assert_eq!(d.fs_type(), Some("vfat"));
        assert_eq!(d.fs_label(), Some("DATA"));

        sim.fail_tool("wipefs", "device busy");
        let err = platform.run_tool("wipefs -a '/dev/sdx'", None).await.unwrap_err();
        assert!(err.to_string().contains("device busy"));
    }
}
