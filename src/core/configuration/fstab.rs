//! Mount table records (`/etc/fstab` format).

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FstabEntry {
    pub fsname: String,
    pub dir: String,
    #[serde(rename = "type")]
    pub fs_type: String,
    pub opts: String,
    pub freq: i32,
    pub passno: i32,
}

impl FstabEntry {
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut fields = line.split_whitespace();
        let fsname = unescape(fields.next()?);
        let dir = unescape(fields.next()?);
        let fs_type = unescape(fields.next()?);
        let opts = unescape(fields.next().unwrap_or("defaults"));
        let freq = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        let passno = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        Some(Self {
            fsname,
            dir,
            fs_type,
            opts,
            freq,
            passno,
        })
    }

    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            escape(&self.fsname),
            escape(&self.dir),
            escape(&self.fs_type),
            escape(&self.opts),
            self.freq,
            self.passno
        )
    }

    /// True if the comma-separated options contain `option` exactly.
    pub fn has_option(&self, option: &str) -> bool {
        self.opts.split(',').any(|o| o == option)
    }
}

pub fn parse(text: &str) -> Vec<FstabEntry> {
    text.lines().filter_map(FstabEntry::parse_line).collect()
}

/// Escape the characters fstab uses as separators as `\ooo`.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' | '\t' | '\n' | '\\' => out.push_str(&format!("\\{:03o}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Undo `\ooo` octal escapes. Anything else passes through untouched.
pub fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|d| (b'0'..=b'7').contains(d)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                if let Ok(b) = u8::try_from(value) {
                    out.push(b);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Remove the first line whose parsed record equals `entry`; every other
/// line is kept verbatim.
pub fn remove_entry(text: &str, entry: &FstabEntry) -> Result<String, StorageError> {
    let mut removed = false;
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        if !removed && FstabEntry::parse_line(line).as_ref() == Some(entry) {
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

pub fn append_entry(text: &str, entry: &FstabEntry) -> String {
    let mut out = text.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&entry.to_line());
    out.push('\n');
    out
}
