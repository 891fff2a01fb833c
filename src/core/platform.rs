//! Side effects on the host: external tools, uevent triggers, ioctls, mounts.
//!
//! Operations never touch the system directly; they go through a
//! [`Platform`] so the same workflow runs against real hardware or the
//! simulator.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use nix::mount::{MntFlags, MsFlags};
use nix::unistd::{Gid, Uid};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::StorageError;

nix::ioctl_none!(blkrrpart, 0x12, 95);
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// How a raw device is opened for a client or for erasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Backup,
    Restore,
    Benchmark { writable: bool },
    Erase,
}

impl OpenMode {
    pub fn options(&self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        let flags = match self {
            OpenMode::Backup => {
                opts.read(true);
                libc::O_EXCL
            }
            OpenMode::Restore | OpenMode::Erase => {
                opts.write(true);
                libc::O_SYNC | libc::O_EXCL
            }
            OpenMode::Benchmark { writable } => {
                opts.read(true);
                let mut flags = libc::O_DIRECT | libc::O_SYNC;
                if *writable {
                    opts.write(true);
                    flags |= libc::O_EXCL;
                }
                flags
            }
        };
        opts.custom_flags(flags | libc::O_CLOEXEC);
        opts
    }
}

/// Quote `s` for `/bin/sh`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// First word of a shell command, for error messages.
pub fn tool_name(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or(command)
}

#[async_trait]
pub trait Platform: Send + Sync {
    /// Run a shell command, feeding `stdin` to it when given. Non-zero exit
    /// becomes [`StorageError::ExternalToolFailed`] carrying stderr.
    async fn run_tool(&self, command: &str, stdin: Option<&str>) -> Result<(), StorageError>;

    /// Ask the kernel to re-emit a `change` uevent for the device.
    fn trigger_uevent(&self, sysfs_path: &str) -> Result<(), StorageError>;

    fn reread_partition_table(&self, device: &Path) -> Result<(), StorageError>;

    fn mount(&self, device: &Path, target: &Path, fs_type: &str) -> Result<(), StorageError>;

    fn unmount(&self, target: &Path) -> Result<(), StorageError>;

    fn set_owner(&self, path: &Path, uid: u32, gid: u32, mode: u32) -> Result<(), StorageError>;

    fn open_device(&self, device: &Path, mode: OpenMode) -> Result<File, StorageError>;

    fn device_size(&self, file: &File) -> Result<u64, StorageError>;

    /// Write an empty partition table of `table_type` (`dos` or `gpt`).
    async fn create_partition_table(
        &self,
        device: &Path,
        table_type: &str,
    ) -> Result<(), StorageError> {
        let command = format!(
            "sfdisk --quiet --wipe always {}",
            shell_quote(&device.display().to_string())
        );
        let script = format!("label: {}\n", table_type);
        self.run_tool(&command, Some(&script)).await
    }
}

pub struct LinuxPlatform;

#[async_trait]
impl Platform for LinuxPlatform {
    async fn run_tool(&self, command: &str, stdin: Option<&str>) -> Result<(), StorageError> {
        let tool = tool_name(command).to_string();
        debug!(%command, "Running external tool");

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StorageError::io(format!("Failed to spawn {}", tool), e))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| StorageError::io(format!("Failed to write to {}", tool), e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StorageError::io(format!("Failed to wait for {}", tool), e))?;

        if output.status.success() {
            return Ok(());
        }
        Err(StorageError::ExternalToolFailed {
            tool,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn trigger_uevent(&self, sysfs_path: &str) -> Result<(), StorageError> {
        let path = Path::new(sysfs_path).join("uevent");
        std::fs::write(&path, "change")
            .map_err(|e| StorageError::io(format!("Error writing to {}", path.display()), e))
    }

    fn reread_partition_table(&self, device: &Path) -> Result<(), StorageError> {
        let file = File::open(device)
            .map_err(|e| StorageError::io(format!("Error opening {}", device.display()), e))?;
        // SAFETY: BLKRRPART takes no argument and the fd is valid for the call.
        unsafe { blkrrpart(file.as_raw_fd()) }.map_err(|e| {
            StorageError::Failed(format!(
                "Error issuing BLKRRPART to {}: {}",
                device.display(),
                e
            ))
        })?;
        Ok(())
    }

    fn mount(&self, device: &Path, target: &Path, fs_type: &str) -> Result<(), StorageError> {
        nix::mount::mount(
            Some(device),
            target,
            Some(fs_type),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| {
            StorageError::Failed(format!(
                "Cannot mount {} at {}: {}",
                device.display(),
                target.display(),
                e
            ))
        })
    }

    fn unmount(&self, target: &Path) -> Result<(), StorageError> {
        nix::mount::umount2(target, MntFlags::empty()).map_err(|e| {
            StorageError::Failed(format!("Cannot unmount {}: {}", target.display(), e))
        })
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32, mode: u32) -> Result<(), StorageError> {
        nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(
            |e| {
                StorageError::Failed(format!(
                    "Cannot chown {} to uid={} and gid={}: {}",
                    path.display(),
                    uid,
                    gid,
                    e
                ))
            },
        )?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
            StorageError::io(
                format!("Cannot chmod {} to mode {:04o}", path.display(), mode),
                e,
            )
        })
    }

    fn open_device(&self, device: &Path, mode: OpenMode) -> Result<File, StorageError> {
        mode.options()
            .open(device)
            .map_err(|e| StorageError::io(format!("Error opening {}", device.display()), e))
    }

    fn device_size(&self, file: &File) -> Result<u64, StorageError> {
        let meta = file
            .metadata()
            .map_err(|e| StorageError::io("Error reading device metadata", e))?;
        if !meta.file_type().is_block_device() {
            return Ok(meta.len());
        }
        let mut size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes one u64 through the pointer.
        unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }.map_err(|e| {
            warn!(error = %e, "BLKGETSIZE64 failed");
            StorageError::Failed(format!("Error doing BLKGETSIZE64 ioctl: {}", e))
        })?;
        Ok(size)
    }
}
