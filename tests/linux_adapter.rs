//! udev adapter tests against the running system.
//!
//! Loop device tests need root and losetup/mkfs.ext4:
//! `sudo cargo test --test linux_adapter -- --ignored`

#![cfg(target_os = "linux")]

use std::process::Command;
use std::time::Duration;

use nix::unistd::Uid;
use stord::adapters::{LinuxAdapter, LinuxAdapterConfig};
use stord::core::{HardwareEvent, HardwareMonitor, UeventAction};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn has_tool(tool: &str, arg: &str) -> bool {
    Command::new(tool).arg(arg).output().is_ok()
}

fn attach_loop(file: &NamedTempFile, size_mb: u64) -> Option<String> {
    file.as_file().set_len(size_mb * 1024 * 1024).ok()?;
    let path = file.path().to_string_lossy().to_string();
    let mkfs = Command::new("mkfs.ext4")
        .args(["-F", "-q", "-L", "stordtest", &path])
        .output()
        .ok()?;
    if !mkfs.status.success() {
        eprintln!("mkfs.ext4 failed: {}", String::from_utf8_lossy(&mkfs.stderr));
        return None;
    }
    let out = Command::new("losetup")
        .args(["--find", "--show", &path])
        .output()
        .ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
}

fn detach_loop(device: &str) {
    let _ = Command::new("losetup").args(["-d", device]).output();
}

#[test]
fn coldplug_lists_block_devices_parents_first() {
    let adapter = LinuxAdapter::with_defaults();
    let Ok(devices) = adapter.coldplug() else {
        eprintln!("Skipping: udev enumeration unavailable");
        return;
    };
    for d in &devices {
        assert_eq!(d.subsystem, "block");
        assert!(!d.sysfs_path.is_empty());
    }
    if let Some(first_partition) = devices.iter().position(|d| d.is_partition()) {
        assert!(devices[first_partition..].iter().all(|d| !d.is_disk()));
    }
}

#[tokio::test]
async fn start_then_stop_returns_promptly() {
    let adapter = LinuxAdapter::new(LinuxAdapterConfig {
        poll_timeout_ms: 100,
        ..Default::default()
    });
    let (tx, _rx) = mpsc::channel(32);

    adapter.start(tx);
    tokio::time::sleep(Duration::from_millis(50)).await;
    adapter.stop();
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
#[ignore = "requires root privileges and losetup/mkfs.ext4"]
async fn loop_device_add_is_reported_with_probe_results() {
    if !Uid::effective().is_root() || !has_tool("losetup", "--version") || !has_tool("mkfs.ext4", "-V") {
        eprintln!("Skipping: requires root, losetup and mkfs.ext4");
        return;
    }

    let adapter = LinuxAdapter::with_defaults();
    let (tx, mut rx) = mpsc::channel(64);
    adapter.start(tx);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let file = NamedTempFile::new().unwrap();
    let Some(loop_device) = attach_loop(&file, 32) else {
        adapter.stop();
        eprintln!("Failed to set up loop device");
        return;
    };

    let mut seen = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while let Ok(Some(event)) = timeout(deadline.saturating_duration_since(tokio::time::Instant::now()), rx.recv()).await {
        if let HardwareEvent::Uevent(u) = event {
            let ours = u.device.device_file.as_deref().map(|p| p.to_string_lossy().to_string())
                == Some(loop_device.clone());
            if ours && u.action != UeventAction::Remove && u.device.fs_type().is_some() {
                seen = Some(u);
                break;
            }
        }
    }

    detach_loop(&loop_device);
    adapter.stop();

    let event = seen.expect("no probed uevent for the loop device");
    assert_eq!(event.device.fs_type(), Some("ext4"));
    assert_eq!(event.device.fs_label(), Some("stordtest"));
    assert!(event.device.size() > 0);
}
