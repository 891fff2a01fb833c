use serde::{Deserialize, Serialize};

use super::{DRIVE, DRIVE_ATA};
use crate::config::DriveSettings;
use crate::core::capability::{CapabilityDef, Env, Representation};
use crate::core::device::{DeviceDescriptor, UeventAction};
use crate::core::objects::DriveObject;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriveProps {
    pub id: String,
    pub vendor: String,
    pub model: String,
    pub revision: String,
    pub serial: String,
    pub wwn: String,
    pub size: u64,
    pub removable: bool,
    pub ejectable: bool,
    pub media_removable: bool,
    /// 0 for solid state, -1 when spinning at an unknown rate.
    pub rotation_rate: i32,
    pub connection_bus: String,
    pub seat: String,
    pub sibling_id: String,
    pub configuration: DriveSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriveAtaProps {
    pub smart_supported: bool,
    pub smart_enabled: bool,
    pub pm_supported: bool,
    pub pm_enabled: bool,
    pub apm_supported: bool,
    pub aam_supported: bool,
    pub write_cache_supported: bool,
    pub write_cache_enabled: bool,
    pub security_erase_unit_minutes: u64,
    pub security_enhanced_erase_unit_minutes: u64,
    pub security_frozen: bool,
}

/// `VENDOR-MODEL-SERIAL`, the key used for per-drive settings.
pub fn drive_id(device: &DeviceDescriptor) -> String {
    [
        device.property("ID_VENDOR"),
        device.property("ID_MODEL"),
        device
            .property("ID_SERIAL_SHORT")
            .or_else(|| device.property("ID_SERIAL")),
    ]
    .into_iter()
    .flatten()
    .map(|p| p.trim().replace(' ', "-"))
    .filter(|p| !p.is_empty())
    .collect::<Vec<_>>()
    .join("-")
}

/// Multi-LUN USB readers expose one drive per slot; they share the path
/// prefix before `-lun-`.
fn sibling_id(device: &DeviceDescriptor) -> String {
    if device.property("ID_BUS") != Some("usb") {
        return String::new();
    }
    device
        .property("ID_PATH")
        .and_then(|p| p.rsplit_once("-lun-").map(|(prefix, _)| prefix.to_string()))
        .unwrap_or_default()
}

fn drive_props(device: &DeviceDescriptor, env: &Env<'_>) -> DriveProps {
    let id = drive_id(device);
    let removable = device.attribute("removable") == Some("1");
    let floppy = device.property_bool("ID_DRIVE_FLOPPY") || device.name.starts_with("fd");
    let optical = device.property_bool("ID_CDROM");
    DriveProps {
        vendor: device.property("ID_VENDOR").unwrap_or_default().replace('_', " "),
        model: device.property("ID_MODEL").unwrap_or_default().replace('_', " "),
        revision: device.property("ID_REVISION").unwrap_or_default().to_string(),
        serial: device
            .property("ID_SERIAL_SHORT")
            .or_else(|| device.property("ID_SERIAL"))
            .unwrap_or_default()
            .to_string(),
        wwn: device
            .property("ID_WWN_WITH_EXTENSION")
            .unwrap_or_default()
            .to_string(),
        size: device.size(),
        removable: removable || device.property("ID_BUS") == Some("usb"),
        ejectable: removable || floppy || optical,
        media_removable: removable,
        rotation_rate: match device.attribute("queue/rotational") {
            Some("0") => 0,
            _ => -1,
        },
        connection_bus: device.property("ID_BUS").unwrap_or_default().to_string(),
        seat: device.property("ID_SEAT").unwrap_or("seat0").to_string(),
        sibling_id: sibling_id(device),
        configuration: env.drive_settings.get(&id).cloned().unwrap_or_default(),
        id,
    }
}

/// Core drive capability. Always applies. Its refresh reports a change when
/// the configured drive settings differ from what was last published.
pub fn drive() -> CapabilityDef<DriveObject> {
    CapabilityDef::new(
        DRIVE,
        |_, _| true,
        |drive: &DriveObject, env, _action: UeventAction, rep: &mut Representation| {
            let Some(device) = drive.device() else {
                return false;
            };
            let previous = rep
                .decode::<DriveProps>()
                .map(|p| p.configuration)
                .unwrap_or_default();
            let props = drive_props(device, env);
            let changed = previous != props.configuration;
            rep.set(&props);
            changed
        },
    )
}

pub fn drive_ata() -> CapabilityDef<DriveObject> {
    CapabilityDef::new(
        DRIVE_ATA,
        |drive: &DriveObject, _| drive.device().is_some_and(|d| d.property_bool("ID_ATA")),
        |drive: &DriveObject, _, _, rep: &mut Representation| {
            if let Some(d) = drive.device() {
                rep.set(DriveAtaProps {
                    smart_supported: d.property_bool("ID_ATA_FEATURE_SET_SMART"),
                    smart_enabled: d.property_bool("ID_ATA_FEATURE_SET_SMART_ENABLED"),
                    pm_supported: d.property_bool("ID_ATA_FEATURE_SET_PM"),
                    pm_enabled: d.property_bool("ID_ATA_FEATURE_SET_PM_ENABLED"),
                    apm_supported: d.property_bool("ID_ATA_FEATURE_SET_APM"),
                    aam_supported: d.property_bool("ID_ATA_FEATURE_SET_AAM"),
                    write_cache_supported: d.property_bool("ID_ATA_WRITE_CACHE"),
                    write_cache_enabled: d.property_bool("ID_ATA_WRITE_CACHE_ENABLED"),
                    security_erase_unit_minutes: d
                        .property_u64("ID_ATA_FEATURE_SET_SECURITY_ERASE_UNIT_MIN")
                        .unwrap_or(0),
                    security_enhanced_erase_unit_minutes: d
                        .property_u64("ID_ATA_FEATURE_SET_SECURITY_ENHANCED_ERASE_UNIT_MIN")
                        .unwrap_or(0),
                    security_frozen: d.property_bool("ID_ATA_FEATURE_SET_SECURITY_FROZEN"),
                });
            }
            false
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_id_joins_trimmed_parts() {
        let d = DeviceDescriptor::default()
            .with_property("ID_VENDOR", "ACME")
            .with_property("ID_MODEL", "Disk 1")
            .with_property("ID_SERIAL_SHORT", "S9");
        assert_eq!(drive_id(&d), "ACME-Disk-1-S9");
    }

    #[test]
    fn usb_luns_share_sibling_id() {
        let d = DeviceDescriptor::default()
            .with_property("ID_BUS", "usb")
            .with_property("ID_PATH", "pci-0000:00:14.0-usb-0:2:1.0-scsi-0:0:0:1");
        assert_eq!(sibling_id(&d), "");
        let d = d.with_property("ID_PATH", "pci-0000:00:14.0-usb-0:2:1.0-lun-1");
        assert_eq!(sibling_id(&d), "pci-0000:00:14.0-usb-0:2:1.0");
    }
}
