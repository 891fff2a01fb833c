//! Uevent dispatch: one event in, registry and object graph updated, every
//! capability of the affected objects reconciled.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, debug_span, info, warn};

use super::capabilities::{self, DRIVE_ATA};
use super::capability::{CapabilityDef, Env};
use super::configuration::ConfigSnapshot;
use super::device::{DeviceDescriptor, Uevent, UeventAction};
use super::graph::ObjectGraph;
use super::identity::{check_for_vpd, drive_object_name};
use super::modules::ModuleManager;
use super::mounts::MountTable;
use super::objects::{BlockObject, DriveObject, ObjectPath};
use crate::config::DriveSettings;

/// Work a dispatch cycle asks for but which must run outside the graph lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    /// A drive's configured settings changed; push them to the hardware.
    ApplyDriveConfiguration(ObjectPath),
}

/// External state sampled once per dispatch cycle.
pub struct DispatchInputs<'a> {
    pub mounts: MountTable,
    pub config: ConfigSnapshot,
    pub drive_settings: &'a HashMap<String, DriveSettings>,
}

impl<'a> DispatchInputs<'a> {
    fn env<'g>(&'g self, graph: &'g ObjectGraph) -> Env<'g> {
        Env {
            graph,
            mounts: &self.mounts,
            config: &self.config,
            drive_settings: self.drive_settings,
        }
    }
}

pub struct Dispatcher {
    drive_capabilities: Vec<CapabilityDef<DriveObject>>,
    block_capabilities: Vec<CapabilityDef<BlockObject>>,
    modules: ModuleManager,
}

impl Dispatcher {
    pub fn new(modules: ModuleManager) -> Self {
        Self {
            drive_capabilities: capabilities::drive_capabilities(),
            block_capabilities: capabilities::block_capabilities(),
            modules,
        }
    }

    pub fn modules(&self) -> &ModuleManager {
        &self.modules
    }

    /// Process one event. Must be called with exclusive access to the graph.
    pub fn dispatch(
        &self,
        graph: &mut ObjectGraph,
        inputs: &DispatchInputs<'_>,
        event: &Uevent,
    ) -> Vec<FollowUp> {
        let device = &event.device;
        let sysfs = device.sysfs_path.as_str();
        let _span = debug_span!("dispatch", action = event.action.as_str(), sysfs_path = %sysfs)
            .entered();

        let mut followups = Vec::new();

        let related = match event.action {
            UeventAction::Remove => {
                let previous = graph.registry.remove(sysfs);
                let descriptor = previous.as_deref().unwrap_or(device.as_ref());
                self.remove_block(graph, sysfs);
                self.remove_drive_member(graph, inputs, descriptor, &mut followups);
                graph.prune_stale_unlocks();
                related_blocks(graph, descriptor)
            }
            UeventAction::Online | UeventAction::Offline => {
                self.refresh_owners(graph, inputs, sysfs, event.action, &mut followups);
                Vec::new()
            }
            UeventAction::Add | UeventAction::Change => {
                self.evict_stale(graph, inputs, device, &mut followups);
                graph.registry.upsert(device.clone());
                if device.is_disk() {
                    self.add_or_change_drive(graph, inputs, event, &mut followups);
                }
                self.add_or_change_block(graph, inputs, event);
                related_blocks(graph, device)
            }
        };

        for path in related {
            self.reconcile_block(graph, inputs, &path, UeventAction::Change);
        }

        followups
    }

    /// Re-reconcile every object, e.g. after the mount table changed.
    pub fn refresh_all(
        &self,
        graph: &mut ObjectGraph,
        inputs: &DispatchInputs<'_>,
    ) -> Vec<FollowUp> {
        let mut followups = Vec::new();
        let drives: Vec<ObjectPath> = graph.drives().map(|d| d.path.clone()).collect();
        for path in drives {
            if self.reconcile_drive(graph, inputs, &path, UeventAction::Change) {
                push_apply(graph, &path, &mut followups);
            }
        }
        let blocks: Vec<ObjectPath> = graph.blocks().map(|b| b.path.clone()).collect();
        for path in blocks {
            self.reconcile_block(graph, inputs, &path, UeventAction::Change);
        }
        followups
    }

    /// `online`/`offline` only reach the capabilities of objects that
    /// already exist; they never create or destroy anything.
    fn refresh_owners(
        &self,
        graph: &mut ObjectGraph,
        inputs: &DispatchInputs<'_>,
        sysfs: &str,
        action: UeventAction,
        followups: &mut Vec<FollowUp>,
    ) {
        let drive = graph.registry.drive_owner(sysfs).cloned();
        let block = graph.registry.block_owner(sysfs).cloned();
        if drive.is_none() && block.is_none() {
            debug!("No object for device, ignoring");
            return;
        }
        if let Some(path) = drive {
            if self.reconcile_drive(graph, inputs, &path, action) {
                push_apply(graph, &path, followups);
            }
        }
        if let Some(path) = block {
            self.reconcile_block(graph, inputs, &path, action);
        }
    }

    /// A device showed up under a kernel name still held by a different sysfs
    /// path, so that path's `remove` was missed. Drop everything built on it.
    /// A disk with the same hardware identity takes over the old drive member
    /// in place.
    fn evict_stale(
        &self,
        graph: &mut ObjectGraph,
        inputs: &DispatchInputs<'_>,
        device: &Arc<DeviceDescriptor>,
        followups: &mut Vec<FollowUp>,
    ) {
        let path = ObjectPath::block(&device.name);
        let Some(stale) = graph.block(&path).map(|b| b.device.clone()) else {
            return;
        };
        if stale.sysfs_path == device.sysfs_path {
            return;
        }
        warn!(
            block = %path,
            stale_sysfs = %stale.sysfs_path,
            "Replacing block object whose removal was never seen"
        );

        graph.registry.remove(&stale.sysfs_path);
        self.remove_block(graph, &stale.sysfs_path);

        let vpd = check_for_vpd(device, &graph.registry);
        let same_drive = graph
            .registry
            .drive_owner(&stale.sysfs_path)
            .filter(|p| {
                device.is_disk()
                    && graph
                        .drive(p)
                        .is_some_and(|d| vpd.as_deref() == Some(d.vpd.as_str()))
            })
            .cloned();
        match same_drive {
            Some(drive_path) => {
                graph.registry.set_drive_owner(&stale.sysfs_path, None);
                if let Some(drive) = graph.drive_mut(&drive_path) {
                    drive.replace_member(&stale.sysfs_path, device.clone());
                }
                graph
                    .registry
                    .set_drive_owner(&device.sysfs_path, Some(drive_path));
            }
            None => self.remove_drive_member(graph, inputs, &stale, followups),
        }
    }

    fn add_or_change_drive(
        &self,
        graph: &mut ObjectGraph,
        inputs: &DispatchInputs<'_>,
        event: &Uevent,
        followups: &mut Vec<FollowUp>,
    ) {
        let device = &event.device;
        let sysfs = device.sysfs_path.as_str();

        let path = match graph.registry.drive_owner(sysfs).cloned() {
            Some(path) => {
                if let Some(drive) = graph.drive_mut(&path) {
                    drive.upsert_member(device.clone());
                }
                path
            }
            None => {
                let Some(vpd) = check_for_vpd(device, &graph.registry) else {
                    debug!("No hardware identity, not a drive");
                    return;
                };
                let existing = graph.drive_with_vpd(&vpd).map(|d| d.path.clone());
                let path = match existing {
                    Some(path) => {
                        if let Some(drive) = graph.drive_mut(&path) {
                            drive.upsert_member(device.clone());
                        }
                        info!(drive = %path, "Added path to existing drive");
                        path
                    }
                    None => {
                        let path = graph.allocate_drive_path(&drive_object_name(device));
                        graph.insert_drive(DriveObject::new(path.clone(), vpd, device.clone()));
                        info!(drive = %path, "Drive added");
                        path
                    }
                };
                graph.registry.set_drive_owner(sysfs, Some(path.clone()));
                path
            }
        };

        if self.reconcile_drive(graph, inputs, &path, event.action) {
            push_apply(graph, &path, followups);
        }
    }

    fn remove_drive_member(
        &self,
        graph: &mut ObjectGraph,
        inputs: &DispatchInputs<'_>,
        device: &DeviceDescriptor,
        followups: &mut Vec<FollowUp>,
    ) {
        let sysfs = device.sysfs_path.as_str();
        let Some(path) = graph.registry.drive_owner(sysfs).cloned() else {
            if device.is_disk() {
                debug!("No drive owns removed device");
            }
            return;
        };
        graph.registry.set_drive_owner(sysfs, None);

        let now_empty = match graph.drive_mut(&path) {
            Some(drive) => {
                if !drive.remove_member(sysfs) {
                    warn!(drive = %path, "Drive did not list removed device as member");
                }
                drive.devices.is_empty()
            }
            None => return,
        };

        if now_empty {
            if let Some(mut drive) = graph.remove_drive(&path) {
                drive.capabilities.clear();
                drive.module_capabilities.clear();
            }
            info!(drive = %path, "Drive removed");
        } else if self.reconcile_drive(graph, inputs, &path, UeventAction::Remove) {
            push_apply(graph, &path, followups);
        }
    }

    fn add_or_change_block(
        &self,
        graph: &mut ObjectGraph,
        inputs: &DispatchInputs<'_>,
        event: &Uevent,
    ) {
        let device = &event.device;
        let sysfs = device.sysfs_path.as_str();

        let path = match graph.registry.block_owner(sysfs).cloned() {
            Some(path) => {
                if let Some(block) = graph.block_mut(&path) {
                    block.device = device.clone();
                }
                path
            }
            None => {
                let block = BlockObject::new(device.clone());
                let path = block.path.clone();
                graph.insert_block(block);
                graph.registry.set_block_owner(sysfs, Some(path.clone()));
                info!(block = %path, "Block device added");
                path
            }
        };

        self.reconcile_block(graph, inputs, &path, event.action);
    }

    fn remove_block(&self, graph: &mut ObjectGraph, sysfs: &str) {
        let Some(path) = graph.registry.block_owner(sysfs).cloned() else {
            return;
        };
        graph.registry.set_block_owner(sysfs, None);
        if let Some(mut block) = graph.remove_block(&path) {
            block.capabilities.clear();
            block.module_capabilities.clear();
            info!(block = %path, "Block device removed");
        }
    }

    /// Returns true if a capability reported a configuration change.
    fn reconcile_drive(
        &self,
        graph: &mut ObjectGraph,
        inputs: &DispatchInputs<'_>,
        path: &ObjectPath,
        action: UeventAction,
    ) -> bool {
        let Some(drive) = graph.drive_mut(path) else {
            return false;
        };
        let mut caps = std::mem::take(&mut drive.capabilities);
        let mut module_caps = std::mem::take(&mut drive.module_capabilities);

        let changed = match graph.drive(path) {
            Some(drive) => {
                let env = inputs.env(graph);
                let mut changed = caps.reconcile_all(drive, &self.drive_capabilities, &env, action);
                changed |= module_caps.reconcile_all(
                    drive,
                    self.modules.drive_capabilities(),
                    &env,
                    action,
                );
                changed
            }
            None => false,
        };

        if let Some(drive) = graph.drive_mut(path) {
            drive.capabilities = caps;
            drive.module_capabilities = module_caps;
        }
        changed
    }

    fn reconcile_block(
        &self,
        graph: &mut ObjectGraph,
        inputs: &DispatchInputs<'_>,
        path: &ObjectPath,
        action: UeventAction,
    ) {
        let Some(block) = graph.block_mut(path) else {
            return;
        };
        let mut caps = std::mem::take(&mut block.capabilities);
        let mut module_caps = std::mem::take(&mut block.module_capabilities);

        if let Some(block) = graph.block(path) {
            let env = inputs.env(graph);
            caps.reconcile_all(block, &self.block_capabilities, &env, action);
            module_caps.reconcile_all(block, self.modules.block_capabilities(), &env, action);
        }

        if let Some(block) = graph.block_mut(path) {
            block.capabilities = caps;
            block.module_capabilities = module_caps;
        }
    }
}

fn push_apply(graph: &ObjectGraph, path: &ObjectPath, followups: &mut Vec<FollowUp>) {
    if graph
        .drive(path)
        .is_some_and(|d| d.capabilities.has(DRIVE_ATA))
    {
        followups.push(FollowUp::ApplyDriveConfiguration(path.clone()));
    }
}

/// Blocks whose published state depends on `device`: the partition table a
/// partition sits in and the devices a mapping was built from.
fn related_blocks(graph: &ObjectGraph, device: &DeviceDescriptor) -> Vec<ObjectPath> {
    device
        .parent
        .iter()
        .chain(device.slaves.iter())
        .filter_map(|sysfs| graph.block_for_sysfs(sysfs))
        .map(|b| b.path.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::unlock::UnlockedEntry;

    fn disk(sysfs: &str, name: &str, serial: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            sysfs_path: sysfs.to_string(),
            name: name.to_string(),
            subsystem: "block".into(),
            devtype: "disk".into(),
            device_file: Some(format!("/dev/{}", name).into()),
            devnum: 0x800,
            ..Default::default()
        }
        .with_property("ID_SERIAL", serial)
    }

    fn partition(disk: &DeviceDescriptor, n: u32) -> DeviceDescriptor {
        DeviceDescriptor {
            sysfs_path: format!("{}/{}{}", disk.sysfs_path, disk.name, n),
            name: format!("{}{}", disk.name, n),
            subsystem: "block".into(),
            devtype: "partition".into(),
            devnum: disk.devnum + n as u64,
            parent: Some(disk.sysfs_path.clone()),
            ..Default::default()
        }
        .with_property("ID_PART_ENTRY_NUMBER", n.to_string())
    }

    struct Fixture {
        dispatcher: Dispatcher,
        graph: ObjectGraph,
        settings: HashMap<String, DriveSettings>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dispatcher: Dispatcher::new(ModuleManager::from_names(&[])),
                graph: ObjectGraph::new(),
                settings: HashMap::new(),
            }
        }

        fn send(&mut self, action: UeventAction, device: &DeviceDescriptor) {
            let inputs = DispatchInputs {
                mounts: MountTable::default(),
                config: ConfigSnapshot::default(),
                drive_settings: &self.settings,
            };
            self.dispatcher
                .dispatch(&mut self.graph, &inputs, &Uevent::new(action, device.clone()));
        }

        fn drives_with_vpd(&self, vpd: &str) -> usize {
            self.graph.drives().filter(|d| d.vpd == vpd).count()
        }
    }

    #[test]
    fn replayed_add_and_remove_keep_one_drive_per_identity() {
        let mut f = Fixture::new();
        let sdb = disk("/sys/block/sdb", "sdb", "ACME-1");
        let sdb1 = partition(&sdb, 1);

        for action in [
            UeventAction::Add,
            UeventAction::Change,
            UeventAction::Add,
            UeventAction::Remove,
            UeventAction::Add,
            UeventAction::Add,
        ] {
            f.send(action, &sdb);
            assert!(f.drives_with_vpd("ACME-1") <= 1);
        }
        f.send(UeventAction::Add, &sdb1);
        assert_eq!(f.drives_with_vpd("ACME-1"), 1);
        assert_eq!(f.graph.blocks().count(), 2);

        f.send(UeventAction::Remove, &sdb1);
        assert!(f.graph.block(&ObjectPath::block("sdb1")).is_none());
        assert!(f.graph.block_for_sysfs(&sdb1.sysfs_path).is_none());
        assert!(f.graph.registry.get(&sdb1.sysfs_path).is_none());

        f.send(UeventAction::Remove, &sdb);
        assert_eq!(f.graph.drives().count(), 0);
        assert_eq!(f.graph.blocks().count(), 0);
        assert!(f.graph.registry.is_empty());
    }

    #[test]
    fn second_path_joins_existing_drive() {
        let mut f = Fixture::new();
        let sdb = disk("/sys/devices/host1/block/sdb", "sdb", "MPATH-1");
        let mut sdc = disk("/sys/devices/host2/block/sdc", "sdc", "MPATH-1");
        sdc.devnum = 0x820;

        f.send(UeventAction::Add, &sdb);
        f.send(UeventAction::Add, &sdc);

        let drive = f.graph.drives().next().unwrap();
        assert_eq!(f.graph.drives().count(), 1);
        assert_eq!(drive.devices.len(), 2);
        let path = drive.path.clone();
        assert_eq!(f.graph.registry.drive_owner(&sdc.sysfs_path), Some(&path));

        f.send(UeventAction::Remove, &sdb);
        assert_eq!(f.graph.drive(&path).map(|d| d.devices.len()), Some(1));

        f.send(UeventAction::Remove, &sdc);
        assert!(f.graph.drive(&path).is_none());
    }

    #[test]
    fn online_and_offline_never_create_objects() {
        let mut f = Fixture::new();
        let sdz = disk("/sys/block/sdz", "sdz", "ACME-9");

        f.send(UeventAction::Online, &sdz);
        f.send(UeventAction::Offline, &sdz);

        assert_eq!(f.graph.drives().count(), 0);
        assert_eq!(f.graph.blocks().count(), 0);
        assert!(f.graph.registry.is_empty());
    }

    #[test]
    fn online_keeps_identity_of_known_device() {
        let mut f = Fixture::new();
        let sdb = disk("/sys/block/sdb", "sdb", "ACME-1");
        f.send(UeventAction::Add, &sdb);
        let drive = f.graph.drives().next().unwrap().path.clone();

        let mut renamed = sdb.clone().with_property("ID_SERIAL", "OTHER");
        renamed.devnum = 0x900;
        f.send(UeventAction::Online, &renamed);

        assert_eq!(f.graph.drives().count(), 1);
        assert_eq!(f.graph.drive(&drive).unwrap().vpd, "ACME-1");
        let block = f.graph.block(&ObjectPath::block("sdb")).unwrap();
        assert_eq!(block.device.devnum, 0x800);
    }

    #[test]
    fn missed_remove_is_replaced_in_place() {
        let mut f = Fixture::new();
        let old = disk("/sys/devices/usb1/block/sdb", "sdb", "ACME-1");
        let new = disk("/sys/devices/usb2/block/sdb", "sdb", "ACME-1");

        f.send(UeventAction::Add, &old);
        f.send(UeventAction::Add, &new);

        assert_eq!(f.graph.drives().count(), 1);
        let drive = f.graph.drives().next().unwrap();
        let members: Vec<_> = drive.devices.iter().map(|d| d.sysfs_path.as_str()).collect();
        assert_eq!(members, vec![new.sysfs_path.as_str()]);
        assert!(f.graph.registry.get(&old.sysfs_path).is_none());
        assert!(f.graph.registry.drive_owner(&old.sysfs_path).is_none());
        assert_eq!(
            f.graph.block(&ObjectPath::block("sdb")).unwrap().device.sysfs_path,
            new.sysfs_path
        );

        f.send(UeventAction::Remove, &new);
        assert_eq!(f.graph.drives().count(), 0);
        assert!(f.graph.registry.is_empty());
    }

    #[test]
    fn missed_remove_with_different_hardware_drops_old_drive() {
        let mut f = Fixture::new();
        let old = disk("/sys/devices/usb1/block/sdb", "sdb", "ACME-1");
        let new = disk("/sys/devices/usb2/block/sdb", "sdb", "ACME-2");

        f.send(UeventAction::Add, &old);
        f.send(UeventAction::Add, &new);

        assert_eq!(f.drives_with_vpd("ACME-1"), 0);
        assert_eq!(f.drives_with_vpd("ACME-2"), 1);
        assert_eq!(f.graph.registry.len(), 1);
    }

    #[test]
    fn unlock_entries_follow_their_mapping() {
        let mut f = Fixture::new();
        let dm = DeviceDescriptor {
            sysfs_path: "/sys/block/dm-0".into(),
            name: "dm-0".into(),
            subsystem: "block".into(),
            devtype: "disk".into(),
            devnum: 0xfd00,
            ..Default::default()
        }
        .with_attribute("dm/uuid", "CRYPT-LUKS2-B-luks-b");
        f.send(UeventAction::Add, &dm);

        let entry = |cleartext: u64, uuid: &str| UnlockedEntry {
            cleartext_device: cleartext,
            crypto_device: 0x811,
            dm_uuid: uuid.to_string(),
            unlocked_by_uid: 0,
        };
        f.graph.unlocked.add(entry(0xfd00, "CRYPT-LUKS2-B-luks-b"));
        f.graph.unlocked.add(entry(0xfd01, "CRYPT-LUKS2-C-luks-c"));
        assert_eq!(f.graph.prune_stale_unlocks(), 1);
        assert!(f.graph.unlocked.find_by_cleartext(0xfd00).is_some());

        f.graph.unlocked.add(entry(0xfd00, "CRYPT-LUKS2-A-luks-a"));
        assert_eq!(f.graph.prune_stale_unlocks(), 1);
        assert!(f.graph.unlocked.entries().is_empty());

        f.graph.unlocked.add(entry(0xfd00, "CRYPT-LUKS2-B-luks-b"));
        f.send(UeventAction::Remove, &dm);
        assert!(f.graph.unlocked.entries().is_empty());
    }
}
