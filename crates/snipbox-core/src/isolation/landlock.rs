//! Landlock filesystem sandboxing

use crate::{Result, SnipboxError};
use landlock::{
    ABI, Access, AccessFs, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreated,
    RulesetCreatedAttr,
};
use std::io;
use std::path::PathBuf;

const TARGET_ABI: ABI = ABI::V2;

/// Configuration for Landlock filesystem restrictions
#[derive(Debug, Clone, Default)]
pub struct LandlockConfig {
    /// Paths with read and execute access
    pub ro_paths: Vec<PathBuf>,
    /// Paths with full access
    pub rw_paths: Vec<PathBuf>,
}

impl LandlockConfig {
    /// Add a read-only path
    #[must_use]
    pub fn ro(mut self, path: impl Into<PathBuf>) -> Self {
        self.ro_paths.push(path.into());
        self
    }

    /// Add a read-write path
    #[must_use]
    pub fn rw(mut self, path: impl Into<PathBuf>) -> Self {
        self.rw_paths.push(path.into());
        self
    }

    /// Build the ruleset in the parent
    ///
    /// Paths that do not exist on this host are skipped. On kernels without
    /// Landlock the ruleset is created in best-effort mode and restricting
    /// becomes a no-op.
    pub fn build(&self) -> Result<PreparedLandlock> {
        let ll = |e: &dyn std::fmt::Display| SnipboxError::Landlock(e.to_string());

        let mut ruleset = Ruleset::default()
            .handle_access(AccessFs::from_all(TARGET_ABI))
            .map_err(|e| ll(&e))?
            .create()
            .map_err(|e| ll(&e))?;

        let rules = self
            .ro_paths
            .iter()
            .map(|p| (p, AccessFs::from_read(TARGET_ABI)))
            .chain(self.rw_paths.iter().map(|p| (p, AccessFs::from_all(TARGET_ABI))));

        let mut added = 0usize;
        for (path, access) in rules {
            let Ok(meta) = path.metadata() else {
                continue;
            };
            // Directory-only rights are rejected on file rules
            let access = if meta.is_dir() {
                access
            } else {
                access & AccessFs::from_file(TARGET_ABI)
            };
            let fd = PathFd::new(path).map_err(|e| ll(&e))?;
            ruleset = ruleset
                .add_rule(PathBeneath::new(fd, access))
                .map_err(|e| ll(&e))?;
            added += 1;
        }

        tracing::debug!(rules = added, "landlock ruleset prepared");
        Ok(PreparedLandlock { ruleset })
    }
}

/// A ruleset ready to be enforced by the child
pub struct PreparedLandlock {
    ruleset: RulesetCreated,
}

impl PreparedLandlock {
    /// Enforce the ruleset on the calling process and everything it executes
    pub fn restrict(self) -> io::Result<()> {
        self.ruleset
            .restrict_self()
            .map(|_| ())
            .map_err(|_| io::Error::from_raw_os_error(libc::EPERM))
    }
}
