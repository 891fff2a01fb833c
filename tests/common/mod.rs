//! A daemon context wired to the simulator, with the event pump running.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use stord::adapters::{SimulatedMonitor, Simulator};
use stord::config::{AppConfig, Timeouts};
use stord::context::AppContext;
use stord::core::{BlockObject, Caller, HardwareMonitor, ObjectGraph, ObjectPath};
use stord::db;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const MIB: u64 = 1024 * 1024;

pub struct Harness {
    pub ctx: AppContext,
    pub sim: Simulator,
    pub dir: TempDir,
    pump: JoinHandle<()>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

pub fn test_config(dir: &TempDir) -> AppConfig {
    let root = dir.path();
    AppConfig {
        socket_path: root.join("stord.sock"),
        state_dir: root.join("state"),
        run_dir: root.join("run"),
        database_path: root.join("jobs.db"),
        fstab_path: root.join("fstab"),
        crypttab_path: root.join("crypttab"),
        luks_keys_dir: root.join("luks-keys"),
        simulation: true,
        timeouts: Timeouts {
            wipe_secs: 2,
            mkfs_secs: 2,
            encryption_secs: 2,
        },
        erase_chunk_size: 4096,
        ..AppConfig::default()
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sim_dir = dir.path().join("devices");
        std::fs::create_dir_all(&sim_dir).unwrap();

        let mut config = test_config(&dir);
        adjust(&mut config);

        let (monitor, sim) = SimulatedMonitor::new(&sim_dir);
        let db = db::init_in_memory().await.unwrap();
        let ctx = AppContext::from_config(
            config,
            db,
            Arc::new(sim.platform()),
            Arc::new(sim.mount_source()),
        );

        let (tx, mut rx) = mpsc::channel(256);
        monitor.start(tx);
        let manager = ctx.manager.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                manager.handle_event(&event);
            }
        });

        Self { ctx, sim, dir, pump }
    }

    /// Wait until the graph satisfies `predicate`.
    pub async fn until<T>(&self, predicate: impl FnMut(&ObjectGraph) -> Option<T>) -> T {
        self.ctx
            .manager
            .wait_for(Duration::from_secs(5), predicate)
            .await
            .expect("graph never reached the expected state")
    }

    /// Wait for the block with kernel name `name` to be published.
    pub async fn block(&self, name: &str) -> BlockObject {
        let path = ObjectPath::block(name);
        self.until(|g| g.block(&path).cloned()).await
    }

    /// Plug in `disk` with one partition of `part_type` on a `dos` table.
    pub async fn disk_with_partition(&self, disk: &str, part_type: &str) -> BlockObject {
        self.sim.add_disk(disk, 64 * MIB);
        self.sim
            .add_partition(disk, 1, MIB, 16 * MIB, part_type, "dos");
        self.block(&format!("{}1", disk)).await
    }
}

pub fn user() -> Caller {
    Caller {
        uid: 1000,
        gid: 1000,
        pid: 4242,
    }
}
