//! Drive identity: the hardware identity string that groups multipath members
//! and the stable object name derived from vendor, model and serial.

use super::device::DeviceDescriptor;
use super::registry::DeviceRegistry;

/// A WWN some vendors ship on every unit; useless as an identity.
const BLACKLISTED_WWN: &str = "50f0000000000000";

fn wwn_is_blacklisted(wwn: &str) -> bool {
    let wwn = wwn
        .strip_prefix("0x")
        .or_else(|| wwn.strip_prefix("0X"))
        .unwrap_or(wwn);
    wwn.eq_ignore_ascii_case(BLACKLISTED_WWN)
}

/// Best-effort unique hardware identity, or `None` if the device does not
/// qualify as a drive.
///
/// Preference order is WWN plus serial, WWN, serial, then the stable `ID_PATH`.
/// Whole disks without any of those fall back to class-specific rules.
pub fn check_for_vpd(device: &DeviceDescriptor, registry: &DeviceRegistry) -> Option<String> {
    let serial = device
        .property("ID_SERIAL")
        .or_else(|| device.property("ID_SERIAL_SHORT"));
    let wwn = device
        .property("ID_WWN_WITH_EXTENSION")
        .filter(|w| !wwn_is_blacklisted(w));
    let path = device.property("ID_PATH");

    match (wwn, serial) {
        (Some(w), Some(s)) => return Some(format!("{}_{}", w, s)),
        (Some(w), None) => return Some(w.to_string()),
        (None, Some(s)) => return Some(s.to_string()),
        (None, None) => {}
    }
    if let Some(p) = path {
        return Some(p.to_string());
    }

    if !device.is_disk() {
        return None;
    }

    let name = device.name.as_str();
    if name.starts_with("fd") {
        return Some(format!("pcfloppy_{}", name));
    }
    if name.starts_with("vd") {
        return Some(name.to_string());
    }
    if name.starts_with("sd")
        && device.property("ID_VENDOR") == Some("VMware")
        && device
            .property("ID_MODEL")
            .is_some_and(|m| m.starts_with("Virtual"))
    {
        return Some(name.to_string());
    }
    if device.parent_subsystems.iter().any(|s| s == "firewire") {
        return Some(name.to_string());
    }
    if device.dm_name().is_some_and(|n| n.starts_with("mpath")) {
        return device
            .slaves
            .iter()
            .filter_map(|slave| registry.get(slave))
            .find_map(|slave| check_for_vpd(slave, registry));
    }

    None
}

fn sanitize(part: &str) -> String {
    part.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            c if c.is_ascii_alphanumeric() || c == '_' => c,
            _ => '_',
        })
        .collect()
}

/// `VENDOR_MODEL_SERIAL` with each part sanitized, or `drive` when all three
/// are missing.
pub fn drive_object_name(device: &DeviceDescriptor) -> String {
    let vendor = device.property("ID_VENDOR");
    let model = device.property("ID_MODEL");
    let serial = device
        .property("ID_SERIAL_SHORT")
        .or_else(|| device.property("ID_SERIAL"));

    let parts: Vec<String> = [vendor, model, serial]
        .into_iter()
        .flatten()
        .map(sanitize)
        .filter(|s| !s.is_empty())
        .collect();

    if parts.is_empty() {
        "drive".to_string()
    } else {
        parts.join("_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn disk(name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            sysfs_path: format!("/sys/block/{}", name),
            name: name.to_string(),
            devtype: "disk".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn prefers_wwn_with_serial() {
        let reg = DeviceRegistry::new();
        let d = disk("sda")
            .with_property("ID_WWN_WITH_EXTENSION", "0x5000c500a1b2c3d4")
            .with_property("ID_SERIAL", "ST1000_Z1D2")
            .with_property("ID_PATH", "pci-0000:00:1f.2-ata-1");
        assert_eq!(
            check_for_vpd(&d, &reg).as_deref(),
            Some("0x5000c500a1b2c3d4_ST1000_Z1D2")
        );
    }

    #[test]
    fn blacklisted_wwn_falls_back_to_serial() {
        let reg = DeviceRegistry::new();
        let d = disk("sda")
            .with_property("ID_WWN_WITH_EXTENSION", "0x50F0000000000000")
            .with_property("ID_SERIAL", "S1");
        assert_eq!(check_for_vpd(&d, &reg).as_deref(), Some("S1"));
    }

    #[test]
    fn id_path_then_class_fallbacks() {
        let reg = DeviceRegistry::new();
        let d = disk("sdc").with_property("ID_PATH", "pci-0000:00:14.0-usb-0:1:1.0");
        assert_eq!(
            check_for_vpd(&d, &reg).as_deref(),
            Some("pci-0000:00:14.0-usb-0:1:1.0")
        );
        assert_eq!(check_for_vpd(&disk("fd0"), &reg).as_deref(), Some("pcfloppy_fd0"));
        assert_eq!(check_for_vpd(&disk("vda"), &reg).as_deref(), Some("vda"));
        assert_eq!(check_for_vpd(&disk("sdz"), &reg), None);

        let vm = disk("sdb")
            .with_property("ID_VENDOR", "VMware")
            .with_property("ID_MODEL", "Virtual_disk");
        assert_eq!(check_for_vpd(&vm, &reg).as_deref(), Some("sdb"));
    }

    #[test]
    fn partitions_never_use_fallbacks() {
        let reg = DeviceRegistry::new();
        let mut p = disk("vda1");
        p.devtype = "partition".to_string();
        assert_eq!(check_for_vpd(&p, &reg), None);
    }

    #[test]
    fn multipath_uses_first_slave_identity() {
        let mut reg = DeviceRegistry::new();
        reg.upsert(Arc::new(disk("sdd")));
        reg.upsert(Arc::new(disk("sde").with_property("ID_SERIAL", "MP1")));

        let mut dm = disk("dm-3").with_attribute("dm/name", "mpatha");
        dm.slaves = vec!["/sys/block/sdd".into(), "/sys/block/sde".into()];
        assert_eq!(check_for_vpd(&dm, &reg).as_deref(), Some("MP1"));
    }

    #[test]
    fn object_name_sanitizes_parts() {
        let d = disk("sda")
            .with_property("ID_VENDOR", " ACME ")
            .with_property("ID_MODEL", "Fast-Disk 2000")
            .with_property("ID_SERIAL_SHORT", "XY-1");
        assert_eq!(drive_object_name(&d), "ACME_Fast_Disk_2000_XY_1");
        assert_eq!(drive_object_name(&disk("sda")), "drive");
    }
}
