//! Dropping root privileges once the adapter and firewall are in place.

use nix::unistd::{Gid, Group, Uid, User};
use thiserror::Error;
use tracing::{debug, info};

pub type PrivilegeResult<T> = Result<T, PrivilegeError>;

#[derive(Error, Debug)]
pub enum PrivilegeError {
    #[error("Unknown user {0}")]
    UnknownUser(String),

    #[error("Unknown group {0}")]
    UnknownGroup(String),

    #[error("Failed to {action}: {source}")]
    Syscall {
        action: &'static str,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("Process can still regain root after dropping privileges")]
    StillPrivileged,
}

/// One-shot privilege drop. Called once during startup.
pub trait PrivilegeManager: Send + Sync {
    fn drop_privileges(&self) -> PrivilegeResult<()>;
}

/// Switches to a configured user and group with `setgroups`, `setgid`
/// and `setuid`. Without a configured user it keeps the current identity.
#[derive(Debug, Clone, Default)]
pub struct UnixPrivilegeDropper {
    user: Option<String>,
    group: Option<String>,
}

impl UnixPrivilegeDropper {
    pub fn new(user: Option<String>, group: Option<String>) -> Self {
        Self { user, group }
    }

    fn resolve(&self, user: &str) -> PrivilegeResult<(Uid, Gid)> {
        let syscall = |action| move |source| PrivilegeError::Syscall { action, source };

        let account = User::from_name(user)
            .map_err(syscall("look up user"))?
            .ok_or_else(|| PrivilegeError::UnknownUser(user.to_string()))?;

        let gid = match &self.group {
            Some(group) => {
                Group::from_name(group)
                    .map_err(syscall("look up group"))?
                    .ok_or_else(|| PrivilegeError::UnknownGroup(group.clone()))?
                    .gid
            }
            None => account.gid,
        };
        Ok((account.uid, gid))
    }
}

impl PrivilegeManager for UnixPrivilegeDropper {
    fn drop_privileges(&self) -> PrivilegeResult<()> {
        let Some(user) = &self.user else {
            debug!("No run_as_user configured, keeping current privileges");
            return Ok(());
        };

        let (uid, gid) = self.resolve(user)?;
        let syscall = |action| move |source| PrivilegeError::Syscall { action, source };

        #[cfg(target_os = "linux")]
        nix::unistd::setgroups(&[gid]).map_err(syscall("set supplementary groups"))?;
        nix::unistd::setgid(gid).map_err(syscall("set group id"))?;
        nix::unistd::setuid(uid).map_err(syscall("set user id"))?;

        if !uid.is_root() && nix::unistd::setuid(Uid::from_raw(0)).is_ok() {
            return Err(PrivilegeError::StillPrivileged);
        }

        info!(uid = uid.as_raw(), gid = gid.as_raw(), "Dropped privileges to {}", user);
        Ok(())
    }
}
