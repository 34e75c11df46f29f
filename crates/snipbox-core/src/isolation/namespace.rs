//! Linux namespace isolation

use nix::sched::CloneFlags;
use std::io;

/// Configuration for namespace isolation
#[derive(Debug, Clone)]
pub struct NamespaceConfig {
    /// Create new user namespace (makes the others possible without root)
    pub user: bool,
    /// Create new network namespace
    pub net: bool,
    /// Create new IPC namespace
    pub ipc: bool,
    /// Create new UTS namespace
    pub uts: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            user: true,
            net: true,
            ipc: true,
            uts: true,
        }
    }
}

impl NamespaceConfig {
    /// Convert to nix CloneFlags
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }

        flags
    }

    /// Precompute everything the child needs to enter the namespaces
    ///
    /// `uid`/`gid` are the ids the child runs as when it unshares; they are
    /// mapped onto themselves so files it creates keep a valid owner.
    #[must_use]
    pub fn prepare(&self, uid: u32, gid: u32) -> NamespaceSetup {
        NamespaceSetup {
            flags: self.to_clone_flags(),
            uid_map: format!("{uid} {uid} 1\n").into_bytes(),
            gid_map: format!("{gid} {gid} 1\n").into_bytes(),
        }
    }
}

/// Namespace entry prepared in the parent, executed in the child
#[derive(Debug, Clone)]
pub struct NamespaceSetup {
    flags: CloneFlags,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
}

impl NamespaceSetup {
    /// Unshare and, for a user namespace, write the identity id maps
    ///
    /// Must run single-threaded (after fork): unshare(CLONE_NEWUSER) is
    /// refused for multi-threaded callers.
    pub fn enter(&self) -> io::Result<()> {
        if self.flags.is_empty() {
            return Ok(());
        }
        nix::sched::unshare(self.flags).map_err(io::Error::from)?;

        if self.flags.contains(CloneFlags::CLONE_NEWUSER) {
            super::write_path(c"/proc/self/setgroups", b"deny")?;
            super::write_path(c"/proc/self/uid_map", &self.uid_map)?;
            super::write_path(c"/proc/self/gid_map", &self.gid_map)?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn flags(&self) -> CloneFlags {
        self.flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_isolates_network() {
        let flags = NamespaceConfig::default().to_clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn identity_maps() {
        let setup = NamespaceConfig::default().prepare(1000, 100);
        assert_eq!(setup.uid_map, b"1000 1000 1\n");
        assert_eq!(setup.gid_map, b"100 100 1\n");
    }

    #[test]
    fn empty_config_is_a_no_op() {
        let config = NamespaceConfig {
            user: false,
            net: false,
            ipc: false,
            uts: false,
        };
        let setup = config.prepare(0, 0);
        assert!(setup.flags().is_empty());
        setup.enter().unwrap();
    }
}
