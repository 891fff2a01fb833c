//! Encrypted volumes this daemon unlocked, remembered so teardown and busy
//! checks know who opened what. Persisted to the run directory so a daemon
//! restart keeps the knowledge while the mappings stay open.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockedEntry {
    pub cleartext_device: u64,
    pub crypto_device: u64,
    pub dm_uuid: String,
    pub unlocked_by_uid: u32,
}

#[derive(Debug, Default)]
pub struct UnlockRegistry {
    entries: Vec<UnlockedEntry>,
    state_file: Option<PathBuf>,
}

impl UnlockRegistry {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load previously persisted entries. A missing or corrupt file starts empty.
    pub fn load(state_file: &Path) -> Self {
        let entries = match std::fs::read(state_file) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %state_file.display(), error = %e, "Ignoring corrupt unlock state");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self {
            entries,
            state_file: Some(state_file.to_path_buf()),
        }
    }

    pub fn entries(&self) -> &[UnlockedEntry] {
        &self.entries
    }

    pub fn add(&mut self, entry: UnlockedEntry) {
        self.entries
            .retain(|e| e.cleartext_device != entry.cleartext_device);
        self.entries.push(entry);
        self.save();
    }

    pub fn remove_cleartext(&mut self, cleartext_device: u64) -> Option<UnlockedEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.cleartext_device == cleartext_device)?;
        let entry = self.entries.remove(idx);
        self.save();
        Some(entry)
    }

    pub fn find_by_cleartext(&self, cleartext_device: u64) -> Option<&UnlockedEntry> {
        self.entries
            .iter()
            .find(|e| e.cleartext_device == cleartext_device)
    }

    pub fn find_by_crypto_device(&self, crypto_device: u64) -> Option<&UnlockedEntry> {
        self.entries.iter().find(|e| e.crypto_device == crypto_device)
    }

    /// Drop every entry `is_live` rejects.
    pub fn prune(&mut self, is_live: impl Fn(&UnlockedEntry) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| {
            let live = is_live(e);
            if !live {
                debug!(cleartext = e.cleartext_device, "Dropping stale unlock entry");
            }
            live
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            self.save();
        }
        removed
    }

    fn save(&self) {
        let Some(path) = &self.state_file else {
            return;
        };
        let result = serde_json::to_vec_pretty(&self.entries)
            .map_err(std::io::Error::other)
            .and_then(|bytes| {
                let tmp = path.with_extension("tmp");
                std::fs::write(&tmp, bytes)?;
                std::fs::rename(&tmp, path)
            });
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to persist unlock state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(cleartext: u64, crypto: u64) -> UnlockedEntry {
        UnlockedEntry {
            cleartext_device: cleartext,
            crypto_device: crypto,
            dm_uuid: format!("CRYPT-LUKS2-{}", cleartext),
            unlocked_by_uid: 1000,
        }
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unlocked.json");

        let mut reg = UnlockRegistry::load(&path);
        reg.add(entry(10, 20));
        reg.add(entry(11, 21));
        assert!(reg.remove_cleartext(10).is_some());

        let reg = UnlockRegistry::load(&path);
        assert_eq!(reg.entries(), &[entry(11, 21)]);
        assert_eq!(reg.find_by_crypto_device(21).map(|e| e.cleartext_device), Some(11));
    }

    #[test]
    fn prune_drops_dead_mappings() {
        let mut reg = UnlockRegistry::in_memory();
        reg.add(entry(1, 2));
        reg.add(entry(3, 4));
        assert_eq!(reg.prune(|e| e.cleartext_device == 3), 1);
        assert!(reg.find_by_cleartext(1).is_none());
        assert!(reg.find_by_cleartext(3).is_some());
    }
}
