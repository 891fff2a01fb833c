//! Unlock table records (`/etc/crypttab` format).

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrypttabEntry {
    pub name: String,
    pub device: String,
    /// Empty when the table says `none` (or `-`).
    pub passphrase_path: String,
    pub options: String,
}

impl CrypttabEntry {
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut fields = line.split_whitespace();
        let name = fields.next()?.to_string();
        let device = fields.next()?.to_string();
        let passphrase_path = match fields.next() {
            None | Some("none") | Some("-") => String::new(),
            Some(p) => p.to_string(),
        };
        let options = fields.next().unwrap_or("").to_string();
        Some(Self {
            name,
            device,
            passphrase_path,
            options,
        })
    }

    pub fn to_line(&self) -> String {
        let path = if self.passphrase_path.is_empty() {
            "none"
        } else {
            self.passphrase_path.as_str()
        };
        if self.options.is_empty() {
            format!("{} {} {}", self.name, self.device, path)
        } else {
            format!("{} {} {} {}", self.name, self.device, path, self.options)
        }
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.split(',').any(|o| o == option)
    }

    /// A passphrase stored in a regular file (not a device or nothing at all).
    pub fn has_key_file(&self) -> bool {
        !self.passphrase_path.is_empty() && !self.passphrase_path.starts_with("/dev")
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        for (what, value) in [
            ("name", &self.name),
            ("device", &self.device),
            ("passphrase-path", &self.passphrase_path),
            ("options", &self.options),
        ] {
            if value.chars().any(char::is_whitespace) {
                return Err(StorageError::Failed(format!(
                    "Crypttab {} `{}` contains whitespace",
                    what, value
                )));
            }
        }
        Ok(())
    }
}

pub fn parse(text: &str) -> Vec<CrypttabEntry> {
    text.lines().filter_map(CrypttabEntry::parse_line).collect()
}

pub fn remove_entry(text: &str, entry: &CrypttabEntry) -> Result<String, StorageError> {
    let mut removed = false;
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if !removed && CrypttabEntry::parse_line(line).as_ref() == Some(entry) {
            removed = true;
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    if !removed {
        return Err(StorageError::Failed(
            "Didn't find entry to remove".to_string(),
        ));
    }
    Ok(out)
}

pub fn append_entry(text: &str, entry: &CrypttabEntry) -> String {
    let mut out = text.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&entry.to_line());
    out.push('\n');
    out
}
