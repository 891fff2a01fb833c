//! Optional capability modules.
//!
//! A module contributes extra capability kinds for drives and blocks. They
//! are reconciled with exactly the same protocol as the built-in kinds but
//! published in the objects' module-capability tables.

use serde::Serialize;
use tracing::{info, warn};

use super::capability::{CapabilityDef, Representation};
use super::objects::{BlockObject, DriveObject};

pub trait StorageModule: Send + Sync {
    fn name(&self) -> &'static str;

    fn drive_capabilities(&self) -> Vec<CapabilityDef<DriveObject>> {
        Vec::new()
    }

    fn block_capabilities(&self) -> Vec<CapabilityDef<BlockObject>> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
pub struct ModuleManager {
    names: Vec<&'static str>,
    drive_capabilities: Vec<CapabilityDef<DriveObject>>,
    block_capabilities: Vec<CapabilityDef<BlockObject>>,
}

impl ModuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the built-in modules named in the configuration. Unknown names
    /// are logged and skipped.
    pub fn from_names(names: &[String]) -> Self {
        let mut manager = Self::new();
        for name in names {
            match builtin(name) {
                Some(module) => manager.register(module.as_ref()),
                None => warn!(module = %name, "Unknown module, skipping"),
            }
        }
        manager
    }

    pub fn register(&mut self, module: &dyn StorageModule) {
        info!(module = module.name(), "Loading module");
        self.names.push(module.name());
        self.drive_capabilities.extend(module.drive_capabilities());
        self.block_capabilities.extend(module.block_capabilities());
    }

    pub fn names(&self) -> &[&'static str] {
        &self.names
    }

    pub fn drive_capabilities(&self) -> &[CapabilityDef<DriveObject>] {
        &self.drive_capabilities
    }

    pub fn block_capabilities(&self) -> &[CapabilityDef<BlockObject>] {
        &self.block_capabilities
    }
}

fn builtin(name: &str) -> Option<Box<dyn StorageModule>> {
    match name {
        "bcache" => Some(Box::new(BcacheModule)),
        _ => None,
    }
}

/// Exposes bcache backing/caching devices.
pub struct BcacheModule;

#[derive(Serialize)]
struct BcacheProps<'a> {
    state: &'a str,
    cache_mode: &'a str,
    dirty_data: &'a str,
}

impl StorageModule for BcacheModule {
    fn name(&self) -> &'static str {
        "bcache"
    }

    fn block_capabilities(&self) -> Vec<CapabilityDef<BlockObject>> {
        vec![CapabilityDef::new(
            "bcache",
            |block: &BlockObject, _| {
                block.device.name.starts_with("bcache") || block.device.fs_type() == Some("bcache")
            },
            |block: &BlockObject, _, _, rep: &mut Representation| {
                let d = &block.device;
                rep.set(BcacheProps {
                    state: d.attribute("bcache/state").unwrap_or_default(),
                    cache_mode: d.attribute("bcache/cache_mode").unwrap_or_default(),
                    dirty_data: d.attribute("bcache/dirty_data").unwrap_or_default(),
                });
                false
            },
        )]
    }
}
