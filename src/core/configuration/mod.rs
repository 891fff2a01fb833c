//! Configuration records tied to block devices: mount records in the fstab
//! and unlock records in the crypttab.
//!
//! Records are matched to a block by identity only (device path or alias,
//! label, UUID, partition UUID/name). Both tables are read in full and
//! rewritten in full on every change.

pub mod crypttab;
pub mod fstab;

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::core::device::DeviceDescriptor;
use crate::error::StorageError;
pub use crypttab::CrypttabEntry;
pub use fstab::FstabEntry;

/// A configuration item as exchanged with clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConfigurationItem {
    Fstab(FstabItem),
    Crypttab(CrypttabItem),
}

impl ConfigurationItem {
    pub fn kind(&self) -> &'static str {
        match self {
            ConfigurationItem::Fstab(_) => "fstab",
            ConfigurationItem::Crypttab(_) => "crypttab",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FstabItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passno: Option<i32>,
    #[serde(rename = "track-parents", default, skip_serializing_if = "is_false")]
    pub track_parents: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrypttabItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(
        rename = "passphrase-path",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub passphrase_path: Option<String>,
    #[serde(
        rename = "passphrase-contents",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub passphrase_contents: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    #[serde(rename = "track-parents", default, skip_serializing_if = "is_false")]
    pub track_parents: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl From<&FstabEntry> for FstabItem {
    fn from(e: &FstabEntry) -> Self {
        Self {
            fsname: Some(e.fsname.clone()),
            dir: Some(e.dir.clone()),
            fs_type: Some(e.fs_type.clone()),
            opts: Some(e.opts.clone()),
            freq: Some(e.freq),
            passno: Some(e.passno),
            track_parents: false,
        }
    }
}

impl From<&CrypttabEntry> for CrypttabItem {
    fn from(e: &CrypttabEntry) -> Self {
        Self {
            name: Some(e.name.clone()),
            device: Some(e.device.clone()),
            passphrase_path: Some(e.passphrase_path.clone()),
            passphrase_contents: None,
            options: Some(e.options.clone()),
            track_parents: false,
        }
    }
}

/// The identity fields configuration records are matched against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockIdentity {
    pub device: Option<PathBuf>,
    pub symlinks: Vec<PathBuf>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub part_uuid: Option<String>,
    pub part_name: Option<String>,
}

impl From<&DeviceDescriptor> for BlockIdentity {
    fn from(d: &DeviceDescriptor) -> Self {
        Self {
            device: d.device_file.clone(),
            symlinks: d.symlinks.clone(),
            uuid: d.fs_uuid().map(str::to_string),
            label: d.fs_label().map(str::to_string),
            part_uuid: d.property("ID_PART_ENTRY_UUID").map(str::to_string),
            part_name: d.property("ID_PART_ENTRY_NAME").map(str::to_string),
        }
    }
}

impl BlockIdentity {
    fn answers_to(&self, path: &str) -> bool {
        let path = Path::new(path);
        self.device.as_deref() == Some(path) || self.symlinks.iter().any(|s| s == path)
    }

    /// The `fsname` used when a client adds a record without one:
    /// `UUID=<uuid>` if the block has one, else its device node.
    pub fn default_fsname(&self) -> Option<String> {
        if let Some(uuid) = &self.uuid {
            return Some(format!("UUID={}", uuid));
        }
        self.device.as_ref().map(|d| d.display().to_string())
    }

    pub fn fstab_matches(&self, fsname: &str) -> bool {
        if let Some(v) = fsname.strip_prefix("PARTUUID=") {
            return self.part_uuid.as_deref() == Some(v);
        }
        if let Some(v) = fsname.strip_prefix("PARTLABEL=") {
            return self.part_name.as_deref() == Some(v);
        }
        self.crypttab_matches(fsname)
    }

    pub fn crypttab_matches(&self, device: &str) -> bool {
        if let Some(v) = device.strip_prefix("UUID=") {
            return self.uuid.as_deref() == Some(v);
        }
        if let Some(v) = device.strip_prefix("LABEL=") {
            return self.label.as_deref() == Some(v);
        }
        if device.starts_with("/dev") {
            return self.answers_to(device);
        }
        false
    }
}

/// Both tables, read once per dispatch cycle.
#[derive(Debug, Clone, Default)]
pub struct ConfigSnapshot {
    pub fstab: Vec<FstabEntry>,
    pub crypttab: Vec<CrypttabEntry>,
}

impl ConfigSnapshot {
    /// Records referring to `identity`, without secrets.
    pub fn for_block(&self, identity: &BlockIdentity) -> Vec<ConfigurationItem> {
        let fstab = self
            .fstab
            .iter()
            .filter(|e| identity.fstab_matches(&e.fsname))
            .map(|e| ConfigurationItem::Fstab(e.into()));
        let crypttab = self
            .crypttab
            .iter()
            .filter(|e| identity.crypttab_matches(&e.device))
            .map(|e| ConfigurationItem::Crypttab(e.into()));
        fstab.chain(crypttab).collect()
    }

    /// Records that declare `x-parent=<uuid>`, i.e. configuration of devices
    /// that only exist while the parent is unlocked.
    pub fn children_of(&self, uuid: &str) -> Vec<ConfigurationItem> {
        let tag = format!("x-parent={}", uuid);
        let fstab = self
            .fstab
            .iter()
            .filter(|e| e.has_option(&tag))
            .map(|e| ConfigurationItem::Fstab(e.into()));
        let crypttab = self
            .crypttab
            .iter()
            .filter(|e| e.has_option(&tag))
            .map(|e| ConfigurationItem::Crypttab(e.into()));
        fstab.chain(crypttab).collect()
    }
}

/// Strip existing `x-parent=` options and append one per parent UUID.
fn with_parent_tags(opts: &str, parents: &[String]) -> String {
    let mut parts: Vec<String> = opts
        .split(',')
        .filter(|o| !o.is_empty() && !o.starts_with("x-parent="))
        .map(str::to_string)
        .collect();
    parts.extend(parents.iter().map(|u| format!("x-parent={}", u)));
    parts.join(",")
}

fn missing(what: &str) -> StorageError {
    StorageError::Failed(format!("Missing {} parameter", what))
}

/// Locations of the persisted tables.
///
/// Clones share one lock; every mutation holds it from the read of a table
/// until the rewritten table has been renamed into place.
#[derive(Debug, Clone)]
pub struct ConfigTables {
    pub fstab_path: PathBuf,
    pub crypttab_path: PathBuf,
    /// Directory new crypttab key files may be created in.
    pub keys_dir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl ConfigTables {
    pub fn new(fstab_path: PathBuf, crypttab_path: PathBuf, keys_dir: PathBuf) -> Self {
        Self {
            fstab_path,
            crypttab_path,
            keys_dir,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            fstab: fstab::parse(&read_table_lossy(&self.fstab_path)),
            crypttab: crypttab::parse(&read_table_lossy(&self.crypttab_path)),
        }
    }

    fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records for a block. With `secrets`, crypttab records also carry the
    /// contents of their key files.
    pub fn configuration_for(
        &self,
        snapshot: &ConfigSnapshot,
        identity: &BlockIdentity,
        secrets: bool,
    ) -> Result<Vec<ConfigurationItem>, StorageError> {
        let mut items = snapshot.for_block(identity);
        if !secrets {
            return Ok(items);
        }
        for item in &mut items {
            if let ConfigurationItem::Crypttab(c) = item {
                let path = c.passphrase_path.clone().unwrap_or_default();
                let contents = if !path.is_empty() && !path.starts_with("/dev") {
                    fs::read_to_string(&path).map_err(|e| {
                        StorageError::Failed(format!(
                            "Error loading secrets from file `{}' referenced in {} entry: {}",
                            path,
                            self.crypttab_path.display(),
                            e
                        ))
                    })?
                } else {
                    String::new()
                };
                c.passphrase_contents = Some(contents);
            }
        }
        Ok(items)
    }

    pub fn add_item(
        &self,
        item: &ConfigurationItem,
        identity: &BlockIdentity,
        parents: &[String],
    ) -> Result<(), StorageError> {
        match item {
            ConfigurationItem::Fstab(i) => self.update_fstab(None, Some((i, identity, parents))),
            ConfigurationItem::Crypttab(i) => {
                self.update_crypttab(None, Some((i, identity, parents)))
            }
        }
    }

    pub fn remove_item(&self, item: &ConfigurationItem) -> Result<(), StorageError> {
        match item {
            ConfigurationItem::Fstab(i) => self.update_fstab(Some(i), None),
            ConfigurationItem::Crypttab(i) => self.update_crypttab(Some(i), None),
        }
    }

    /// Replace `old` with `new` in a single rewrite. Both must be the same kind.
    pub fn update_item(
        &self,
        old: &ConfigurationItem,
        new: &ConfigurationItem,
        identity: &BlockIdentity,
        parents: &[String],
    ) -> Result<(), StorageError> {
        match (old, new) {
            (ConfigurationItem::Fstab(o), ConfigurationItem::Fstab(n)) => {
                self.update_fstab(Some(o), Some((n, identity, parents)))
            }
            (ConfigurationItem::Crypttab(o), ConfigurationItem::Crypttab(n)) => {
                self.update_crypttab(Some(o), Some((n, identity, parents)))
            }
            _ => Err(StorageError::Failed(
                "old and new item are not of the same type".to_string(),
            )),
        }
    }

    fn update_fstab(
        &self,
        remove: Option<&FstabItem>,
        add: Option<(&FstabItem, &BlockIdentity, &[String])>,
    ) -> Result<(), StorageError> {
        let _guard = self.exclusive();
        let mut text = read_table(&self.fstab_path)?;

        if let Some(item) = remove {
            let entry = fstab_entry_to_remove(item)?;
            text = fstab::remove_entry(&text, &entry)?;
        }

        if let Some((item, identity, parents)) = add {
            let entry = fstab_entry_to_add(item, identity, parents)?;
            text = fstab::append_entry(&text, &entry);
        }

        write_table(&self.fstab_path, &text, 0o644)?;
        info!(path = %self.fstab_path.display(), "Updated mount table");
        Ok(())
    }

    fn update_crypttab(
        &self,
        remove: Option<&CrypttabItem>,
        add: Option<(&CrypttabItem, &BlockIdentity, &[String])>,
    ) -> Result<(), StorageError> {
        let _guard = self.exclusive();
        let mut text = read_table(&self.crypttab_path)?;

        let removed = match remove {
            Some(item) => {
                let entry = crypttab_entry_to_remove(item)?;
                text = crypttab::remove_entry(&text, &entry)?;
                Some(entry)
            }
            None => None,
        };

        let added = match add {
            Some((item, identity, parents)) => {
                let (entry, contents) = self.crypttab_entry_to_add(item, identity, parents)?;
                text = crypttab::append_entry(&text, &entry);
                Some((entry, contents))
            }
            None => None,
        };

        let old_key = removed
            .as_ref()
            .filter(|e| e.has_key_file())
            .map(|e| e.passphrase_path.clone());
        let new_key = added.as_ref().filter(|(e, _)| e.has_key_file());
        let replaces_old_key = matches!(
            (&old_key, new_key),
            (Some(old), Some((entry, _))) if *old == entry.passphrase_path
        );

        let mut created_key = None;
        if let Some((entry, contents)) = new_key {
            if !replaces_old_key {
                self.write_key_file(&entry.passphrase_path, contents)?;
                created_key = Some(entry.passphrase_path.as_str());
            }
        }

        if let Err(e) = write_table(&self.crypttab_path, &text, 0o600) {
            if let Some(path) = created_key {
                if let Err(err) = fs::remove_file(path) {
                    warn!(path, error = %err, "Failed to remove key file after table write failed");
                }
            }
            return Err(e);
        }
        info!(path = %self.crypttab_path.display(), "Updated unlock table");

        match (old_key, new_key) {
            (Some(_), Some((entry, contents))) if replaces_old_key => {
                self.replace_key_file(&entry.passphrase_path, contents)?;
            }
            (Some(old), _) => match fs::remove_file(&old) {
                Ok(()) => debug!(path = %old, "Removed key file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    warn!(path = %old, "Key file was already gone")
                }
                Err(e) => {
                    return Err(StorageError::io(format!("Error deleting {}", old), e));
                }
            },
            _ => {}
        }
        Ok(())
    }

    fn crypttab_entry_to_add(
        &self,
        item: &CrypttabItem,
        identity: &BlockIdentity,
        parents: &[String],
    ) -> Result<(CrypttabEntry, String), StorageError> {
        let name = match &item.name {
            Some(n) => n.clone(),
            None => {
                let uuid = identity.uuid.as_ref().ok_or_else(|| {
                    StorageError::Failed("Block device has no UUID".to_string())
                })?;
                format!("luks-{}", uuid)
            }
        };
        let device = match &item.device {
            Some(d) => d.clone(),
            None => identity
                .default_fsname()
                .ok_or_else(|| missing("device"))?,
        };
        let contents = item
            .passphrase_contents
            .clone()
            .ok_or_else(|| missing("passphrase-contents"))?;
        let passphrase_path = match &item.passphrase_path {
            Some(p) => p.clone(),
            None if contents.is_empty() => String::new(),
            None => self.keys_dir.join(&name).display().to_string(),
        };
        let mut options = item.options.clone().unwrap_or_default();
        if item.track_parents {
            options = with_parent_tags(&options, parents);
        }

        let entry = CrypttabEntry {
            name,
            device,
            passphrase_path,
            options,
        };
        entry.validate()?;
        Ok((entry, contents))
    }

    fn check_key_path<'a>(&self, path: &'a str) -> Result<&'a Path, StorageError> {
        let path = Path::new(path);
        if path.parent() != Some(self.keys_dir.as_path()) {
            return Err(StorageError::Failed(format!(
                "Crypttab passphrase file can only be created in the {} directory",
                self.keys_dir.display()
            )));
        }
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.keys_dir)
            .map_err(|e| StorageError::io(format!("Error creating {}", self.keys_dir.display()), e))?;
        Ok(path)
    }

    /// Overwrite the key file of a record that is being updated in place.
    fn replace_key_file(&self, path: &str, contents: &str) -> Result<(), StorageError> {
        let path = self.check_key_path(path)?;
        write_atomically(path, contents.as_bytes(), 0o600)
            .map_err(|e| StorageError::io(format!("Error writing {}", path.display()), e))
    }

    fn write_key_file(&self, path: &str, contents: &str) -> Result<(), StorageError> {
        let path = self.check_key_path(path)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    StorageError::Failed(format!(
                        "Refusing to overwrite existing file {}",
                        path.display()
                    ))
                } else {
                    StorageError::io(format!("Error writing {}", path.display()), e)
                }
            })?;
        file.write_all(contents.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| StorageError::io(format!("Error writing {}", path.display()), e))
    }
}

fn fstab_entry_to_remove(item: &FstabItem) -> Result<FstabEntry, StorageError> {
    match item {
        FstabItem {
            fsname: Some(fsname),
            dir: Some(dir),
            fs_type: Some(fs_type),
            opts: Some(opts),
            freq: Some(freq),
            passno: Some(passno),
            ..
        } => Ok(FstabEntry {
            fsname: fsname.clone(),
            dir: dir.clone(),
            fs_type: fs_type.clone(),
            opts: opts.clone(),
            freq: *freq,
            passno: *passno,
        }),
        _ => Err(missing("fsname, dir, type, opts, freq or passno")),
    }
}

fn fstab_entry_to_add(
    item: &FstabItem,
    identity: &BlockIdentity,
    parents: &[String],
) -> Result<FstabEntry, StorageError> {
    let fsname = match &item.fsname {
        Some(f) => f.clone(),
        None => identity.default_fsname().ok_or_else(|| missing("fsname"))?,
    };
    let (Some(dir), Some(fs_type), Some(opts), Some(freq), Some(passno)) = (
        &item.dir,
        &item.fs_type,
        &item.opts,
        item.freq,
        item.passno,
    ) else {
        return Err(missing("dir, type, opts, freq or passno"));
    };
    if opts.trim().is_empty() {
        return Err(StorageError::Failed("opts must not be blank".to_string()));
    }
    let opts = if item.track_parents {
        with_parent_tags(opts, parents)
    } else {
        opts.clone()
    };
    Ok(FstabEntry {
        fsname,
        dir: dir.clone(),
        fs_type: fs_type.clone(),
        opts,
        freq,
        passno,
    })
}

fn crypttab_entry_to_remove(item: &CrypttabItem) -> Result<CrypttabEntry, StorageError> {
    let (Some(name), Some(device), Some(passphrase_path), Some(options)) = (
        &item.name,
        &item.device,
        &item.passphrase_path,
        &item.options,
    ) else {
        return Err(missing("name, device, passphrase-path or options"));
    };
    Ok(CrypttabEntry {
        name: name.clone(),
        device: device.clone(),
        passphrase_path: if passphrase_path == "none" {
            String::new()
        } else {
            passphrase_path.clone()
        },
        options: options.clone(),
    })
}

/// Read a table that is about to be rewritten. Anything but a missing file
/// is an error, so a table that cannot be read intact is never replaced.
fn read_table(path: &Path) -> Result<String, StorageError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(StorageError::io(format!("Error reading {}", path.display()), e)),
    };
    String::from_utf8(bytes).map_err(|_| {
        StorageError::Failed(format!(
            "{} is not valid UTF-8, refusing to rewrite it",
            path.display()
        ))
    })
}

fn read_table_lossy(path: &Path) -> String {
    match fs::read(path) {
        Ok(b) => String::from_utf8_lossy(&b).into_owned(),
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read configuration table");
            String::new()
        }
    }
}

/// Write the whole table through a temporary file and rename it into place.
fn write_table(path: &Path, contents: &str, mode: u32) -> Result<(), StorageError> {
    write_atomically(path, contents.as_bytes(), mode)
        .map_err(|e| StorageError::io(format!("Error writing {}", path.display()), e))
}

fn write_atomically(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.as_file().set_permissions(fs::Permissions::from_mode(mode))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> BlockIdentity {
        BlockIdentity {
            device: Some("/dev/sdb1".into()),
            symlinks: vec!["/dev/disk/by-id/usb-ACME-part1".into()],
            uuid: Some("ABCD".into()),
            label: Some("DATA".into()),
            part_uuid: Some("1234-01".into()),
            part_name: Some("primary".into()),
        }
    }

    fn tables(dir: &Path) -> ConfigTables {
        ConfigTables::new(dir.join("fstab"), dir.join("crypttab"), dir.join("luks-keys"))
    }

    #[test]
    fn matching_rules() {
        let id = identity();
        assert!(id.fstab_matches("UUID=ABCD"));
        assert!(!id.fstab_matches("UUID=abcd"));
        assert!(id.fstab_matches("LABEL=DATA"));
        assert!(id.fstab_matches("PARTUUID=1234-01"));
        assert!(id.fstab_matches("PARTLABEL=primary"));
        assert!(id.fstab_matches("/dev/disk/by-id/usb-ACME-part1"));
        assert!(id.fstab_matches("/dev/sdb1"));
        assert!(!id.fstab_matches("sdb1"));
        assert!(!id.crypttab_matches("PARTUUID=1234-01"));
    }

    #[test]
    fn child_configuration_uses_parent_tag() {
        let snap = ConfigSnapshot {
            fstab: fstab::parse(
                "UUID=F1 /data ext4 defaults,x-parent=ABCD 0 2\nUUID=F2 /x ext4 defaults 0 0\n",
            ),
            crypttab: Vec::new(),
        };
        let children = snap.children_of("ABCD");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].kind(), "fstab");
    }

    #[test]
    fn add_fstab_fills_fsname_and_tracks_parents() {
        let dir = tempfile::tempdir().unwrap();
        let t = tables(dir.path());
        let item = ConfigurationItem::Fstab(FstabItem {
            dir: Some("/mnt/data".into()),
            fs_type: Some("ext4".into()),
            opts: Some("defaults,x-parent=OLD".into()),
            freq: Some(0),
            passno: Some(2),
            track_parents: true,
            ..Default::default()
        });
        t.add_item(&item, &identity(), &["P1".to_string()]).unwrap();

        let snap = t.snapshot();
        assert_eq!(snap.fstab.len(), 1);
        assert_eq!(snap.fstab[0].fsname, "UUID=ABCD");
        assert_eq!(snap.fstab[0].opts, "defaults,x-parent=P1");
        let published = snap.for_block(&identity());
        assert_eq!(published.len(), 1);
    }

    #[test]
    fn blank_opts_and_missing_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let t = tables(dir.path());
        let mut item = FstabItem {
            dir: Some("/mnt".into()),
            fs_type: Some("ext4".into()),
            opts: Some("  ".into()),
            freq: Some(0),
            passno: Some(0),
            ..Default::default()
        };
        let err = t
            .add_item(&ConfigurationItem::Fstab(item.clone()), &identity(), &[])
            .unwrap_err();
        assert!(err.to_string().contains("blank"));

        item.opts = None;
        assert!(t
            .add_item(&ConfigurationItem::Fstab(item), &identity(), &[])
            .is_err());
    }

    #[test]
    fn crypttab_add_writes_key_file_and_remove_deletes_it() {
        let dir = tempfile::tempdir().unwrap();
        let t = tables(dir.path());
        let item = ConfigurationItem::Crypttab(CrypttabItem {
            passphrase_contents: Some("hunter2".into()),
            options: Some("luks".into()),
            ..Default::default()
        });
        t.add_item(&item, &identity(), &[]).unwrap();

        let key = dir.path().join("luks-keys").join("luks-ABCD");
        assert_eq!(fs::read_to_string(&key).unwrap(), "hunter2");

        let snap = t.snapshot();
        let items = t.configuration_for(&snap, &identity(), true).unwrap();
        let ConfigurationItem::Crypttab(c) = &items[0] else {
            panic!("expected crypttab item");
        };
        assert_eq!(c.passphrase_contents.as_deref(), Some("hunter2"));
        assert_eq!(c.device.as_deref(), Some("UUID=ABCD"));

        let mut to_remove = c.clone();
        to_remove.passphrase_contents = None;
        t.remove_item(&ConfigurationItem::Crypttab(to_remove)).unwrap();
        assert!(!key.exists());
        assert!(t.snapshot().crypttab.is_empty());
    }

    #[test]
    fn crypttab_refuses_key_outside_keys_dir_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let t = tables(dir.path());
        let outside = ConfigurationItem::Crypttab(CrypttabItem {
            passphrase_path: Some("/tmp/evil".into()),
            passphrase_contents: Some("x".into()),
            ..Default::default()
        });
        assert!(t.add_item(&outside, &identity(), &[]).is_err());

        fs::create_dir_all(&t.keys_dir).unwrap();
        fs::write(t.keys_dir.join("luks-ABCD"), "old").unwrap();
        let item = ConfigurationItem::Crypttab(CrypttabItem {
            passphrase_contents: Some("new".into()),
            ..Default::default()
        });
        let err = t.add_item(&item, &identity(), &[]).unwrap_err();
        assert!(err.to_string().contains("Refusing to overwrite"));
    }

    #[test]
    fn update_rejects_kind_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let t = tables(dir.path());
        let err = t
            .update_item(
                &ConfigurationItem::Fstab(FstabItem::default()),
                &ConfigurationItem::Crypttab(CrypttabItem::default()),
                &identity(),
                &[],
            )
            .unwrap_err();
        assert!(err.to_string().contains("not of the same type"));
    }

    fn data_mount() -> ConfigurationItem {
        ConfigurationItem::Fstab(FstabItem {
            dir: Some("/mnt/new".into()),
            fs_type: Some("ext4".into()),
            opts: Some("defaults".into()),
            freq: Some(0),
            passno: Some(2),
            ..Default::default()
        })
    }

    #[test]
    fn unreadable_table_is_never_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let t = tables(dir.path());
        let original = b"UUID=ROOT / ext4 defaults 0 1\n# caf\xe9\nUUID=HOME /home ext4 defaults 0 2\n";
        fs::write(&t.fstab_path, original).unwrap();

        let err = t.add_item(&data_mount(), &identity(), &[]).unwrap_err();

        assert!(err.to_string().contains("not valid UTF-8"));
        assert_eq!(fs::read(&t.fstab_path).unwrap(), original.to_vec());
        let snap = t.snapshot();
        assert_eq!(snap.fstab.len(), 2);
        assert_eq!(snap.fstab[1].fsname, "UUID=HOME");
    }

    #[test]
    fn concurrent_adds_keep_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let t = tables(dir.path());

        let workers: Vec<_> = (0..32)
            .map(|i| {
                let t = t.clone();
                std::thread::spawn(move || {
                    let item = ConfigurationItem::Fstab(FstabItem {
                        fsname: Some(format!("UUID=V{}", i)),
                        dir: Some(format!("/mnt/v{}", i)),
                        fs_type: Some("ext4".into()),
                        opts: Some("defaults".into()),
                        freq: Some(0),
                        passno: Some(2),
                        ..Default::default()
                    });
                    t.add_item(&item, &identity(), &[]).unwrap();
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(t.snapshot().fstab.len(), 32);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "fstab")
            .collect();
        assert!(leftovers.is_empty(), "temporary files left: {:?}", leftovers);
    }

    #[test]
    fn failed_table_write_leaves_no_key_behind() {
        let dir = tempfile::tempdir().unwrap();
        // Readable but not writable: nothing can be created in procfs.
        let broken = ConfigTables::new(
            dir.path().join("fstab"),
            PathBuf::from("/proc/version"),
            dir.path().join("luks-keys"),
        );
        let item = ConfigurationItem::Crypttab(CrypttabItem {
            passphrase_contents: Some("hunter2".into()),
            options: Some("luks".into()),
            ..Default::default()
        });

        assert!(broken.add_item(&item, &identity(), &[]).is_err());
        let key = dir.path().join("luks-keys").join("luks-ABCD");
        assert!(!key.exists());

        let t = tables(dir.path());
        t.add_item(&item, &identity(), &[]).unwrap();
        assert_eq!(fs::read_to_string(&key).unwrap(), "hunter2");
    }

    #[test]
    fn updating_record_with_same_key_name_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let t = tables(dir.path());
        let item = ConfigurationItem::Crypttab(CrypttabItem {
            passphrase_contents: Some("old".into()),
            options: Some("luks".into()),
            ..Default::default()
        });
        t.add_item(&item, &identity(), &[]).unwrap();

        let snap = t.snapshot();
        let existing = t.configuration_for(&snap, &identity(), false).unwrap();
        let new = ConfigurationItem::Crypttab(CrypttabItem {
            passphrase_contents: Some("new".into()),
            options: Some("luks,discard".into()),
            ..Default::default()
        });
        t.update_item(&existing[0], &new, &identity(), &[]).unwrap();

        let key = dir.path().join("luks-keys").join("luks-ABCD");
        assert_eq!(fs::read_to_string(&key).unwrap(), "new");
        let snap = t.snapshot();
        assert_eq!(snap.crypttab.len(), 1);
        assert_eq!(snap.crypttab[0].options, "luks,discard");
    }
}
