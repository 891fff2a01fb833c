use std::sync::Arc;

use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::core::configuration::ConfigTables;
use crate::core::mounts::MountSource;
use crate::core::unlock::UnlockRegistry;
use crate::core::{
    Authority, Dispatcher, GroupPolicy, JobTracker, ObjectGraph, ObjectManager, Platform,
    modules::ModuleManager,
};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub jobs: JobTracker,
    pub manager: ObjectManager,
    pub platform: Arc<dyn Platform>,
    pub authority: Arc<dyn Authority>,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        db: Connection,
        manager: ObjectManager,
        platform: Arc<dyn Platform>,
        authority: Arc<dyn Authority>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            db,
            jobs: JobTracker::new(),
            manager,
            platform,
            authority,
        }
    }

    /// Wire up the object manager and the group policy from `config`.
    pub fn from_config(
        config: AppConfig,
        db: Connection,
        platform: Arc<dyn Platform>,
        mounts: Arc<dyn MountSource>,
    ) -> Self {
        let unlocked = if config.simulation {
            UnlockRegistry::in_memory()
        } else {
            UnlockRegistry::load(&config.unlock_state_file())
        };
        let tables = ConfigTables::new(
            config.fstab_path.clone(),
            config.crypttab_path.clone(),
            config.luks_keys_dir.clone(),
        );
        let manager = ObjectManager::new(
            ObjectGraph::with_unlock_registry(unlocked),
            Dispatcher::new(ModuleManager::from_names(&config.modules)),
            tables,
            mounts,
            config.drives.clone(),
        );
        let authority = Arc::new(GroupPolicy::new(config.authorization.clone()));
        Self::new(config, db, manager, platform, authority)
    }
}
