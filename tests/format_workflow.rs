mod common;

use std::path::Path;

use common::{Harness, MIB, user};
use stord::core::configuration::{ConfigurationItem, FstabItem};
use stord::core::{Caller, JobState, ObjectPath};
use stord::db;
use stord::error::{FormatStep, StorageError};
use stord::ops::{FormatOptions, format};

fn labelled(label: &str) -> FormatOptions {
    FormatOptions {
        label: Some(label.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn formats_partition_with_label() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;

    format(&h.ctx, &part.path, "ext4", labelled("DATA"), &Caller::root())
        .await
        .unwrap();

    let block = h.block("sdb1").await;
    assert_eq!(block.device.fs_type(), Some("ext4"));
    assert_eq!(block.device.fs_label(), Some("DATA"));

    let commands = h.sim.commands();
    assert_eq!(
        commands,
        vec![
            "wipefs -a '/dev/sdb1'".to_string(),
            "mkfs.ext4 -F -L 'DATA' '/dev/sdb1'".to_string(),
        ]
    );
}

#[tokio::test]
async fn unknown_type_is_rejected_before_touching_the_device() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;

    let err = format(&h.ctx, &part.path, "reiserfs", FormatOptions::default(), &Caller::root())
        .await
        .unwrap_err();

    assert_eq!(err.step, FormatStep::Validate);
    assert!(matches!(err.source, StorageError::NotSupported(_)));
    assert!(h.sim.commands().is_empty());
}

#[tokio::test]
async fn label_on_type_without_labels_is_rejected() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;

    let err = format(&h.ctx, &part.path, "empty", labelled("X"), &Caller::root())
        .await
        .unwrap_err();

    assert_eq!(err.step, FormatStep::Validate);
}

#[tokio::test]
async fn missing_block_fails_validation() {
    let h = Harness::new().await;

    let err = format(
        &h.ctx,
        &ObjectPath::block("sdz"),
        "ext4",
        FormatOptions::default(),
        &Caller::root(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.step, FormatStep::Validate);
    assert!(matches!(err.source, StorageError::NotFound(_)));
}

#[tokio::test]
async fn partition_at_offset_zero_is_refused() {
    let h = Harness::new().await;
    h.sim.add_disk("sdc", 64 * MIB);
    h.sim.add_partition("sdc", 1, 0, 16 * MIB, "0x0", "dos");
    let part = h.block("sdc1").await;

    let err = format(&h.ctx, &part.path, "vfat", FormatOptions::default(), &Caller::root())
        .await
        .unwrap_err();

    assert_eq!(err.step, FormatStep::Validate);
    assert!(err.source.to_string().contains("contains a partition table"));
}

#[tokio::test]
async fn tool_failure_reports_step_and_stderr() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    h.sim.fail_tool("mkfs.ext4", "mkfs.ext4: Device size reported to be zero");

    let err = format(&h.ctx, &part.path, "ext4", FormatOptions::default(), &Caller::root())
        .await
        .unwrap_err();

    assert_eq!(err.step, FormatStep::Create);
    assert!(matches!(err.source, StorageError::ExternalToolFailed { .. }));
    assert!(err.to_string().contains("Device size reported to be zero"));
}

#[tokio::test]
async fn wipe_that_never_shows_up_times_out() {
    let h = Harness::with_config(|c| c.timeouts.wipe_secs = 1).await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    h.sim
        .set_properties("sdb1", &[("ID_FS_TYPE", "xfs"), ("ID_FS_USAGE", "filesystem")]);
    h.until(|g| {
        g.block(&part.path)
            .filter(|b| b.device.fs_type() == Some("xfs"))
            .map(|_| ())
    })
    .await;
    h.sim.silence_tool("wipefs");

    let err = format(&h.ctx, &part.path, "ext4", FormatOptions::default(), &Caller::root())
        .await
        .unwrap_err();

    assert_eq!(err.step, FormatStep::Wipe);
    assert!(matches!(err.source, StorageError::Timeout(_)));
    assert!(!h.sim.commands().iter().any(|c| c.starts_with("mkfs")));
}

#[tokio::test]
async fn user_gets_ownership_of_new_filesystem() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    let options = FormatOptions {
        take_ownership: true,
        ..Default::default()
    };

    format(&h.ctx, &part.path, "ext4", options, &user()).await.unwrap();

    let changes = h.sim.owner_changes();
    assert_eq!(changes.len(), 1);
    assert_eq!((changes[0].uid, changes[0].gid, changes[0].mode), (1000, 1000, 0o700));
    assert!(changes[0].path.starts_with(&h.ctx.config.run_dir));
    // The private mount point is gone again.
    assert!(!changes[0].path.exists());
}

#[tokio::test]
async fn ownership_is_skipped_for_filesystems_without_owners() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x0c").await;
    let options = FormatOptions {
        take_ownership: true,
        ..Default::default()
    };

    format(&h.ctx, &part.path, "vfat", options, &user()).await.unwrap();

    assert!(h.sim.owner_changes().is_empty());
}

#[tokio::test]
async fn encrypted_format_unlocks_and_formats_cleartext() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    let options = FormatOptions {
        encrypt_passphrase: Some("hunter2".to_string()),
        ..Default::default()
    };

    format(&h.ctx, &part.path, "ext4", options, &user()).await.unwrap();

    let backing = h.block("sdb1").await;
    let cleartext = h.block("dm-0").await;
    assert_eq!(backing.device.fs_type(), Some("crypto_LUKS"));
    assert_eq!(cleartext.device.fs_type(), Some("ext4"));

    let (unlocked_by, crypto_device) = h.ctx.manager.read(|g| {
        let entry = g
            .unlocked
            .find_by_cleartext(cleartext.device.devnum)
            .expect("cleartext was not recorded as unlocked");
        (entry.unlocked_by_uid, entry.crypto_device)
    });
    assert_eq!(unlocked_by, 1000);
    assert_eq!(crypto_device, backing.device.devnum);

    let commands = h.sim.commands();
    let uuid = backing.device.fs_uuid().unwrap();
    assert!(commands.contains(&"cryptsetup luksFormat '/dev/sdb1'".to_string()));
    assert!(commands.contains(&format!("cryptsetup luksOpen '/dev/sdb1' 'luks-{}'", uuid)));
    assert_eq!(commands.last().unwrap(), "mkfs.ext4 -F -L '' '/dev/dm-0'");
}

#[tokio::test]
async fn mounted_block_refuses_teardown() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    h.sim.mount("sdb1", Path::new("/media/data"));
    let options = FormatOptions {
        tear_down: true,
        ..Default::default()
    };

    let err = format(&h.ctx, &part.path, "ext4", options, &Caller::root())
        .await
        .unwrap_err();

    assert_eq!(err.step, FormatStep::TearDown);
    assert!(matches!(err.source, StorageError::DeviceBusy(_)));
    assert!(h.sim.commands().is_empty());
}

#[tokio::test]
async fn teardown_needs_system_configuration_rights() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    let options = FormatOptions {
        tear_down: true,
        ..Default::default()
    };

    let err = format(&h.ctx, &part.path, "ext4", options, &user())
        .await
        .unwrap_err();

    assert_eq!(err.step, FormatStep::Authorize);
    assert!(matches!(err.source, StorageError::Unauthorized(_)));
}

#[tokio::test]
async fn teardown_locks_cleartext_before_reformatting() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    let encrypted = FormatOptions {
        encrypt_passphrase: Some("hunter2".to_string()),
        ..Default::default()
    };
    format(&h.ctx, &part.path, "ext4", encrypted, &Caller::root())
        .await
        .unwrap();
    h.block("dm-0").await;

    let options = FormatOptions {
        tear_down: true,
        ..Default::default()
    };
    format(&h.ctx, &part.path, "xfs", options, &Caller::root())
        .await
        .unwrap();

    let dm = ObjectPath::block("dm-0");
    h.until(|g| g.block(&dm).is_none().then_some(())).await;
    assert!(h.ctx.manager.read(|g| g.unlocked.entries().is_empty()));
    assert!(h.sim.commands().contains(&"cryptsetup luksClose '/dev/dm-0'".to_string()));
    assert_eq!(h.block("sdb1").await.device.fs_type(), Some("xfs"));
}

#[tokio::test]
async fn whole_disk_gets_partition_table() {
    let h = Harness::new().await;
    h.sim.add_disk("sdd", 64 * MIB);
    let disk = h.block("sdd").await;

    format(&h.ctx, &disk.path, "gpt", FormatOptions::default(), &Caller::root())
        .await
        .unwrap();

    let disk = h.block("sdd").await;
    assert_eq!(disk.device.partition_table_type(), Some("gpt"));
    assert!(
        h.sim
            .commands()
            .contains(&"sfdisk --quiet --wipe always '/dev/sdd'".to_string())
    );
}

#[tokio::test]
async fn formatting_partitioned_disk_drops_its_partitions() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    let disk = h.block("sdb").await;

    format(&h.ctx, &disk.path, "ext4", FormatOptions::default(), &Caller::root())
        .await
        .unwrap();

    h.until(|g| g.block(&part.path).is_none().then_some(())).await;
    assert_eq!(h.block("sdb").await.device.fs_type(), Some("ext4"));
    assert!(h.sim.device("sdb1").is_none());
}

#[tokio::test]
async fn partition_type_follows_new_content() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    let options = FormatOptions {
        update_partition_type: true,
        ..Default::default()
    };

    format(&h.ctx, &part.path, "vfat", options, &Caller::root())
        .await
        .unwrap();

    assert!(
        h.sim
            .commands()
            .contains(&"sfdisk --part-type '/dev/sdb' 1 '0x0c'".to_string())
    );
    h.until(|g| {
        g.block(&part.path)
            .filter(|b| b.device.property("ID_PART_ENTRY_TYPE") == Some("0x0c"))
            .map(|_| ())
    })
    .await;
}

#[tokio::test]
async fn matching_partition_type_is_left_alone() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    let options = FormatOptions {
        update_partition_type: true,
        ..Default::default()
    };

    format(&h.ctx, &part.path, "ext4", options, &Caller::root())
        .await
        .unwrap();

    assert!(!h.sim.commands().iter().any(|c| c.contains("--part-type")));
}

#[tokio::test]
async fn no_block_returns_after_wipe_and_finishes_in_background() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    let options = FormatOptions {
        no_block: true,
        ..labelled("LATER")
    };

    format(&h.ctx, &part.path, "ext4", options, &Caller::root())
        .await
        .unwrap();

    let label = h
        .until(|g| {
            g.block(&part.path)
                .filter(|b| b.device.fs_type() == Some("ext4"))
                .and_then(|b| b.device.fs_label().map(str::to_string))
        })
        .await;
    assert_eq!(label, "LATER");
}

#[tokio::test]
async fn zero_erase_runs_as_recorded_job() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    let options = FormatOptions {
        erase: Some("zero".to_string()),
        ..Default::default()
    };

    format(&h.ctx, &part.path, "ext4", options, &Caller::root())
        .await
        .unwrap();

    let jobs = db::jobs::list(&h.ctx.db, 10, 0, None).await.unwrap();
    let erase = jobs
        .iter()
        .find(|j| j.operation == "format-erase")
        .expect("no erase job recorded");
    assert_eq!(erase.status, JobState::Completed.as_str());
    assert_eq!(erase.object_path, part.path.as_str());
    assert!(jobs.iter().any(|j| j.operation == "format-mkfs"));
    assert_eq!(h.ctx.jobs.active_count().await, 0);
}

#[tokio::test]
async fn unknown_erase_mode_fails_validation() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    let options = FormatOptions {
        erase: Some("shred".to_string()),
        ..Default::default()
    };

    let err = format(&h.ctx, &part.path, "ext4", options, &Caller::root())
        .await
        .unwrap_err();

    assert_eq!(err.step, FormatStep::Validate);
}

#[tokio::test]
async fn configuration_items_are_written_for_new_filesystem() {
    let h = Harness::new().await;
    let part = h.disk_with_partition("sdb", "0x83").await;
    let options = FormatOptions {
        config_items: vec![ConfigurationItem::Fstab(FstabItem {
            dir: Some("/mnt/data".to_string()),
            fs_type: Some("ext4".to_string()),
            opts: Some("defaults".to_string()),
            freq: Some(0),
            passno: Some(2),
            ..Default::default()
        })],
        ..Default::default()
    };

    format(&h.ctx, &part.path, "ext4", options, &Caller::root())
        .await
        .unwrap();

    let uuid = h.block("sdb1").await.device.fs_uuid().unwrap().to_string();
    let fstab = std::fs::read_to_string(&h.ctx.config.fstab_path).unwrap();
    assert!(fstab.contains(&format!("UUID={}", uuid)));
    assert!(fstab.contains("/mnt/data"));
}
