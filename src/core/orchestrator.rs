use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::core::device::{HardwareEvent, Uevent, UeventAction};
use crate::core::dispatcher::FollowUp;
use crate::core::hardware::HardwareMonitor;
use crate::ops;
use crate::rpc::RpcServer;

/// Ties the hardware monitor, the object manager and the RPC server
/// together for the lifetime of the daemon.
pub struct Orchestrator {
    ctx: AppContext,
    monitor: Box<dyn HardwareMonitor>,
}

impl Orchestrator {
    pub fn new(ctx: AppContext, monitor: Box<dyn HardwareMonitor>) -> Self {
        Self { ctx, monitor }
    }

    /// Replay the devices present at startup as `add` events.
    fn coldplug(&self) -> Vec<FollowUp> {
        let devices = match self.monitor.coldplug() {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Coldplug enumeration failed");
                return Vec::new();
            }
        };
        let count = devices.len();
        let followups = devices
            .into_iter()
            .flat_map(|d| {
                self.ctx
                    .manager
                    .handle_uevent(&Uevent::new(UeventAction::Add, d))
            })
            .collect();
        let stale = self.ctx.manager.prune_unlocked();
        info!(devices = count, stale_unlocks = stale, "Coldplug complete");
        followups
    }

    pub async fn start(self) -> Result<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            simulation = self.ctx.config.simulation,
            "stord starting"
        );

        for followup in self.coldplug() {
            spawn_followup(&self.ctx, followup);
        }

        let (tx, rx) = mpsc::channel(256);
        self.monitor.start(tx);
        let dispatch = tokio::spawn(dispatch_loop(self.ctx.clone(), rx));

        let server = Arc::new(RpcServer::new(
            self.ctx.clone(),
            self.ctx.config.socket_path.clone(),
        ));
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.start().await })
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received interrupt, shutting down"),
            result = serving => match result {
                Ok(Err(e)) => warn!(error = %e, "RPC server stopped"),
                Err(e) => warn!(error = %e, "RPC server task panicked"),
                Ok(Ok(())) => {}
            },
        }

        server.shutdown();
        self.monitor.stop();
        dispatch.abort();
        info!("stord stopped");
        Ok(())
    }
}

/// Serialize hardware events into dispatch cycles.
async fn dispatch_loop(ctx: AppContext, mut rx: mpsc::Receiver<HardwareEvent>) {
    while let Some(event) = rx.recv().await {
        if let HardwareEvent::Uevent(u) = &event {
            debug!(action = u.action.as_str(), sysfs_path = %u.device.sysfs_path, "Dispatching");
        }
        for followup in ctx.manager.handle_event(&event) {
            spawn_followup(&ctx, followup);
        }
    }
    debug!("Hardware event stream closed");
}

fn spawn_followup(ctx: &AppContext, followup: FollowUp) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        match followup {
            FollowUp::ApplyDriveConfiguration(path) => {
                if let Err(e) = ops::drive::apply_configuration(&ctx, &path).await {
                    warn!(drive = %path, error = %e, "Failed to apply drive configuration");
                }
            }
        }
    });
}
