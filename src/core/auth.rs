//! Caller identity and authorization.
//!
//! Every privileged operation names an [`Action`]. The daemon asks its
//! [`Authority`] whether the calling process may perform it before touching
//! anything.

use std::fmt;

use async_trait::async_trait;
use nix::unistd::{Gid, Group, Uid, User};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AuthorizationConfig;
use crate::error::StorageError;

/// Credentials of the process on the other end of an RPC connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

impl Caller {
    pub fn root() -> Self {
        Self {
            uid: 0,
            gid: 0,
            pid: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ModifyDevice,
    ModifyDeviceSystem,
    ModifyDeviceOtherSeat,
    OpenDevice,
    OpenDeviceSystem,
    ModifySystemConfiguration,
    ReadSystemConfigurationSecrets,
    AtaSecureErase,
    Rescan,
}

impl Action {
    pub fn id(&self) -> &'static str {
        match self {
            Action::ModifyDevice => "org.stord.modify-device",
            Action::ModifyDeviceSystem => "org.stord.modify-device-system",
            Action::ModifyDeviceOtherSeat => "org.stord.modify-device-other-seat",
            Action::OpenDevice => "org.stord.open-device",
            Action::OpenDeviceSystem => "org.stord.open-device-system",
            Action::ModifySystemConfiguration => "org.stord.modify-system-configuration",
            Action::ReadSystemConfigurationSecrets => {
                "org.stord.read-system-configuration-secrets"
            }
            Action::AtaSecureErase => "org.stord.ata-secure-erase",
            Action::Rescan => "org.stord.rescan",
        }
    }

    /// Actions an ordinary local user may perform without administrative rights.
    fn is_unprivileged(&self) -> bool {
        matches!(
            self,
            Action::ModifyDevice | Action::OpenDevice | Action::Rescan
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[async_trait]
pub trait Authority: Send + Sync {
    /// `Ok(())` when `caller` may perform `action`. `message` describes the
    /// request for logs.
    async fn check(
        &self,
        caller: &Caller,
        action: Action,
        message: &str,
    ) -> Result<(), StorageError>;
}

/// Root and members of the configured admin group may do everything; other
/// users only get the unprivileged actions.
pub struct GroupPolicy {
    config: AuthorizationConfig,
}

impl GroupPolicy {
    pub fn new(config: AuthorizationConfig) -> Self {
        Self { config }
    }

    fn is_admin(&self, caller: &Caller) -> bool {
        if caller.uid == 0 {
            return true;
        }
        let Some(group_name) = self.config.admin_group.as_deref() else {
            return false;
        };
        let Some(group) = Group::from_name(group_name).ok().flatten() else {
            debug!(group = group_name, "Admin group does not exist");
            return false;
        };
        if group.gid == Gid::from_raw(caller.gid) {
            return true;
        }
        User::from_uid(Uid::from_raw(caller.uid))
            .ok()
            .flatten()
            .is_some_and(|user| group.mem.iter().any(|m| *m == user.name))
    }

    fn allows(&self, caller: &Caller, action: Action) -> bool {
        if self.is_admin(caller) {
            return true;
        }
        match action {
            Action::ModifyDeviceOtherSeat => self.config.allow_other_seats,
            a => a.is_unprivileged(),
        }
    }
}

#[async_trait]
impl Authority for GroupPolicy {
    async fn check(
        &self,
        caller: &Caller,
        action: Action,
        message: &str,
    ) -> Result<(), StorageError> {
        if self.allows(caller, action) {
            debug!(uid = caller.uid, action = %action, "Authorized");
            return Ok(());
        }
        info!(uid = caller.uid, pid = caller.pid, action = %action, %message, "Authorization denied");
        Err(StorageError::Unauthorized(action.id().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(uid: u32) -> Caller {
        Caller {
            uid,
            gid: uid,
            pid: 1,
        }
    }

    #[tokio::test]
    async fn root_may_do_anything() {
        let policy = GroupPolicy::new(AuthorizationConfig::default());
        policy
            .check(&Caller::root(), Action::ModifyDeviceSystem, "format")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ordinary_users_get_unprivileged_actions_only() {
        let policy = GroupPolicy::new(AuthorizationConfig::default());
        let caller = user(4242);
        policy
            .check(&caller, Action::ModifyDevice, "format")
            .await
            .unwrap();
        let err = policy
            .check(&caller, Action::ModifyDeviceSystem, "format")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unauthorized");
        assert!(err.to_string().contains("org.stord.modify-device-system"));
        assert!(
            policy
                .check(&caller, Action::ModifyDeviceOtherSeat, "format")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn other_seats_can_be_allowed() {
        let policy = GroupPolicy::new(AuthorizationConfig {
            allow_other_seats: true,
            ..Default::default()
        });
        policy
            .check(&user(4242), Action::ModifyDeviceOtherSeat, "format")
            .await
            .unwrap();
    }

    #[test]
    fn unknown_admin_group_grants_nothing() {
        let policy = GroupPolicy::new(AuthorizationConfig {
            admin_group: Some("no-such-group-stord".to_string()),
            ..Default::default()
        });
        assert!(!policy.is_admin(&user(4242)));
    }
}
