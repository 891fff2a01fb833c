use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/stord/config.toml";

/// Daemon configuration.
///
/// Layered as: built-in defaults, then the TOML file, then `STORD_*`
/// environment variables (nested keys separated by `__`), then CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub socket_path: PathBuf,
    pub state_dir: PathBuf,
    /// Scratch space for private mounts and the unlock registry.
    pub run_dir: PathBuf,
    pub database_path: PathBuf,
    pub fstab_path: PathBuf,
    pub crypttab_path: PathBuf,
    pub luks_keys_dir: PathBuf,
    pub simulation: bool,
    pub verbose: bool,
    pub json_logs: bool,
    /// Optional capability modules to load, by name.
    pub modules: Vec<String>,
    pub timeouts: Timeouts,
    /// Bytes written per iteration when zero-filling a device.
    pub erase_chunk_size: usize,
    pub authorization: AuthorizationConfig,
    /// Per-drive settings keyed by drive id (`VENDOR-MODEL-SERIAL`).
    pub drives: HashMap<String, DriveSettings>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/stord/stord.sock"),
            state_dir: PathBuf::from("/var/lib/stord"),
            run_dir: PathBuf::from("/run/stord"),
            database_path: PathBuf::from("/var/lib/stord/jobs.db"),
            fstab_path: PathBuf::from("/etc/fstab"),
            crypttab_path: PathBuf::from("/etc/crypttab"),
            luks_keys_dir: PathBuf::from("/etc/luks-keys"),
            simulation: false,
            verbose: false,
            json_logs: false,
            modules: Vec::new(),
            timeouts: Timeouts::default(),
            erase_chunk_size: 1024 * 1024,
            authorization: AuthorizationConfig::default(),
            drives: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub wipe_secs: u64,
    pub mkfs_secs: u64,
    pub encryption_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            wipe_secs: 15,
            mkfs_secs: 30,
            encryption_secs: 30,
        }
    }
}

impl Timeouts {
    pub fn wipe(&self) -> Duration {
        Duration::from_secs(self.wipe_secs)
    }

    pub fn mkfs(&self) -> Duration {
        Duration::from_secs(self.mkfs_secs)
    }

    pub fn encryption(&self) -> Duration {
        Duration::from_secs(self.encryption_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Members of this group may perform administrative actions.
    pub admin_group: Option<String>,
    /// Let unprivileged callers modify devices attached to other seats.
    pub allow_other_seats: bool,
}

/// Settings applied to a drive whenever it appears.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveSettings {
    pub standby_timeout: Option<u8>,
    pub apm_level: Option<u8>,
    pub aam_level: Option<u8>,
    pub write_cache_enabled: Option<bool>,
}

impl DriveSettings {
    pub fn is_empty(&self) -> bool {
        self == &DriveSettings::default()
    }
}

impl AppConfig {
    /// Load configuration from the default file location, merging `cli_args`
    /// on top when given.
    pub fn new<T: Serialize>(cli_args: Option<&T>) -> Result<Self> {
        let path = std::env::var_os("STORD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path, cli_args)
    }

    pub fn load_from<T: Serialize>(path: &Path, cli_args: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("STORD_").ignore(&["CONFIG"]).split("__"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    pub fn unlock_state_file(&self) -> PathBuf {
        self.run_dir.join("unlocked-crypto-dev.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[derive(Serialize)]
    struct Args {
        verbose: bool,
    }

    #[test]
    fn layers_file_env_and_args() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                    socket_path = "/tmp/stord.sock"
                    modules = ["bcache"]

                    [timeouts]
                    mkfs_secs = 60

                    [drives.ACME-Disk-1]
                    standby_timeout = 12
                "#,
            )?;
            jail.set_env("STORD_TIMEOUTS__WIPE_SECS", "5");

            let path = jail.directory().join("config.toml");
            let config = AppConfig::load_from(&path, Some(&Args { verbose: true }))
                .map_err(|e| e.to_string())?;

            assert_eq!(config.socket_path, PathBuf::from("/tmp/stord.sock"));
            assert_eq!(config.modules, vec!["bcache".to_string()]);
            assert_eq!(config.timeouts.mkfs_secs, 60);
            assert_eq!(config.timeouts.wipe_secs, 5);
            assert_eq!(config.timeouts.encryption_secs, 30);
            assert!(config.verbose);
            assert_eq!(
                config.drives["ACME-Disk-1"].standby_timeout,
                Some(12)
            );
            Ok(())
        });
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config =
            AppConfig::load_from(Path::new("/nonexistent/stord.toml"), None::<&Args>).unwrap();
        assert_eq!(config.erase_chunk_size, 1024 * 1024);
        assert_eq!(config.fstab_path, PathBuf::from("/etc/fstab"));
    }
}
