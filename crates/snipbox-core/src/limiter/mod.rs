//! Resource limits and isolation for one execution
//!
//! [`ResourceLimiter`] is built once per service. For every execution it
//! produces a [`SpawnConstraints`] descriptor that installs a pre-exec hook
//! on the interpreter command; after spawn, a [`ProcessGroup`] enforces the
//! limits the kernel cannot enforce on its own (wall clock, group RSS,
//! process count) and tears the group down.

pub mod group;
pub mod usage;

pub use self::group::ProcessGroup;
pub use self::usage::GroupUsage;

use crate::isolation::cgroups::{CgroupLeaf, CgroupLimits};
use crate::isolation::landlock::PreparedLandlock;
use crate::isolation::namespace::NamespaceSetup;
use crate::isolation::{
    self, LandlockConfig, NamespaceConfig, SANDBOX_SETUP_ERRNO, SeccompConfig,
};
use crate::workspace::Workspace;
use crate::{ExecutionLimits, IsolationConfig, Result, SandboxConfig, SnipboxError};
use nix::sched::CloneFlags;
use nix::sys::resource::{Resource, getrlimit, setrlimit};
use nix::unistd::{Gid, Uid};
use parking_lot::Mutex;
use seccompiler::BpfProgram;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

/// Builds per-execution spawn constraints from service configuration
pub struct ResourceLimiter {
    isolation: IsolationConfig,
    rlimits: RlimitSet,
    seccomp: Option<Arc<BpfProgram>>,
    ro_paths: Vec<PathBuf>,
    ids: (u32, u32),
}

impl ResourceLimiter {
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let isolation = config.isolation.clone();

        let seccomp = if isolation.seccomp {
            match SeccompConfig::default().compile() {
                Ok(program) => Some(Arc::new(program)),
                Err(e) if isolation.strict => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "seccomp unavailable, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        let mut ro_paths = isolation.ro_paths.clone();
        if let Some(prefix) = interpreter_prefix(&config.interpreter) {
            ro_paths.push(prefix);
        }

        let ids = match (isolation.run_as_uid, isolation.run_as_gid) {
            (Some(uid), Some(gid)) => (uid, gid),
            _ => (
                nix::unistd::getuid().as_raw(),
                nix::unistd::getgid().as_raw(),
            ),
        };

        tracing::info!(
            network_isolation = isolation.network,
            landlock = isolation.landlock,
            seccomp = seccomp.is_some(),
            cgroup = ?isolation.cgroup_parent,
            strict = isolation.strict,
            "resource limiter ready"
        );

        Ok(Self {
            rlimits: RlimitSet::new(config),
            isolation,
            seccomp,
            ro_paths,
            ids,
        })
    }

    /// Prepare the constraints for one execution in `workspace`
    ///
    /// Layers that fail here are dropped with a warning unless the
    /// isolation config is strict.
    pub fn prepare(&self, workspace: &Workspace, limits: &ExecutionLimits) -> Result<SpawnConstraints> {
        let strict = self.isolation.strict;

        let run_as = match (self.isolation.run_as_uid, self.isolation.run_as_gid) {
            (Some(uid), Some(gid)) => {
                hand_over(workspace, uid, gid)?;
                Some((uid, gid))
            }
            _ => None,
        };

        let cgroup = match &self.isolation.cgroup_parent {
            Some(parent) => {
                let cg_limits = CgroupLimits {
                    memory_max: limits.max_memory_bytes,
                    pids_max: self.isolation.cgroup_pids_max,
                };
                match CgroupLeaf::create(parent, workspace.id(), cg_limits) {
                    Ok(leaf) => Some(leaf),
                    Err(e) if strict => return Err(e),
                    Err(e) => {
                        tracing::warn!(error = %e, "cgroup unavailable, relying on sampling");
                        None
                    }
                }
            }
            None => None,
        };

        let landlock = if self.isolation.landlock {
            let config = self
                .ro_paths
                .iter()
                .fold(LandlockConfig::default(), |config, path| config.ro(path))
                .rw(workspace.root())
                .rw("/dev/null");
            match config.build() {
                Ok(prepared) => Some(prepared),
                Err(e) if strict => return Err(e),
                Err(e) => {
                    tracing::warn!(error = %e, "landlock not available");
                    None
                }
            }
        } else {
            None
        };

        let namespaces = self
            .isolation
            .network
            .then(|| NamespaceConfig::default().prepare(self.ids.0, self.ids.1));

        let max_tasks = u64::from(limits.max_processes) + 1 + u64::from(self.isolation.thread_allowance);

        Ok(SpawnConstraints {
            strict,
            rlimits: self.rlimits,
            max_tasks,
            run_as,
            namespaces,
            landlock,
            seccomp: self.seccomp.clone(),
            cgroup,
        })
    }
}

/// Opaque per-execution constraint descriptor
pub struct SpawnConstraints {
    strict: bool,
    rlimits: RlimitSet,
    max_tasks: u64,
    run_as: Option<(u32, u32)>,
    namespaces: Option<NamespaceSetup>,
    landlock: Option<PreparedLandlock>,
    seccomp: Option<Arc<BpfProgram>>,
    cgroup: Option<CgroupLeaf>,
}

impl SpawnConstraints {
    /// Attach the pre-exec hook to `cmd`
    ///
    /// Returns the cgroup leaf, if any, which must outlive the spawn.
    pub fn install(self, cmd: &mut Command) -> Option<CgroupLeaf> {
        let hook = ChildHook {
            strict: self.strict,
            rlimits: self.rlimits,
            max_tasks: self.max_tasks,
            run_as: self.run_as,
            namespaces: self.namespaces,
            landlock: Mutex::new(self.landlock),
            seccomp: self.seccomp,
            cgroup_procs: self.cgroup.as_ref().map(CgroupLeaf::procs_fd),
        };

        // SAFETY: the hook runs between fork and exec and only issues
        // syscalls on state prepared by the parent
        unsafe {
            cmd.pre_exec(move || hook.run());
        }
        self.cgroup
    }
}

/// State moved into the forked child
struct ChildHook {
    strict: bool,
    rlimits: RlimitSet,
    max_tasks: u64,
    run_as: Option<(u32, u32)>,
    namespaces: Option<NamespaceSetup>,
    landlock: Mutex<Option<PreparedLandlock>>,
    seccomp: Option<Arc<BpfProgram>>,
    cgroup_procs: Option<RawFd>,
}

impl ChildHook {
    fn run(&self) -> io::Result<()> {
        nix::unistd::setsid().map_err(io::Error::from)?;

        // Mandatory layers: failing any of them fails the spawn
        if let Some(fd) = self.cgroup_procs {
            isolation::write_fd(fd, b"0").map_err(|_| sandbox_error())?;
        }
        self.rlimits.apply().map_err(|_| sandbox_error())?;
        if let Some((uid, gid)) = self.run_as {
            drop_credentials(uid, gid).map_err(|_| sandbox_error())?;
        }

        // Best-effort layers unless strict
        if let Some(namespaces) = &self.namespaces {
            let entered = namespaces.enter();
            let own_user_ns =
                entered.is_ok() && namespaces.flags().contains(CloneFlags::CLONE_NEWUSER);
            self.layer(entered)?;
            // NPROC is counted per user namespace, so only here does it
            // bound this execution alone
            if own_user_ns {
                self.layer(limit_tasks(self.max_tasks))?;
            }
        }
        self.layer(isolation::clear_capabilities())?;
        let landlock = self.landlock.lock().take();
        if let Some(landlock) = landlock {
            self.layer(landlock.restrict())?;
        }
        if let Some(program) = &self.seccomp {
            self.layer(isolation::seccomp::apply(program))?;
        }
        Ok(())
    }

    fn layer(&self, result: io::Result<()>) -> io::Result<()> {
        match result {
            Err(_) if self.strict => Err(sandbox_error()),
            _ => Ok(()),
        }
    }
}

fn sandbox_error() -> io::Error {
    io::Error::from_raw_os_error(SANDBOX_SETUP_ERRNO)
}

/// Kernel ceiling on tasks (processes and threads) owned by the sandbox uid
///
/// Has no effect when the sandbox runs as root.
fn limit_tasks(max: u64) -> io::Result<()> {
    setrlimit(Resource::RLIMIT_NPROC, max, max).map_err(io::Error::from)
}

fn drop_credentials(uid: u32, gid: u32) -> nix::Result<()> {
    nix::unistd::setgroups(&[])?;
    nix::unistd::setgid(Gid::from_raw(gid))?;
    nix::unistd::setuid(Uid::from_raw(uid))
}

/// Give the workspace to the unprivileged sandbox user
fn hand_over(workspace: &Workspace, uid: u32, gid: u32) -> Result<()> {
    let paths = std::iter::once(workspace.root()).chain(workspace.source_file());
    for path in paths {
        std::os::unix::fs::chown(path, Some(uid), Some(gid)).map_err(|e| {
            SnipboxError::Workspace(format!("failed to chown {}: {e}", path.display()))
        })?;
    }
    Ok(())
}

/// Install prefix of the interpreter, e.g. `/opt/node` for `/opt/node/bin/node`
fn interpreter_prefix(interpreter: &Path) -> Option<PathBuf> {
    let real = std::fs::canonicalize(interpreter).ok()?;
    let bin = real.parent()?;
    match bin.parent() {
        Some(prefix) if prefix != Path::new("/") => Some(prefix.to_path_buf()),
        _ => Some(bin.to_path_buf()),
    }
}

/// rlimits applied in the child, clamped to what the parent may grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RlimitSet {
    cpu_soft: u64,
    cpu_hard: u64,
    fsize: u64,
    nofile: u64,
}

impl RlimitSet {
    fn new(config: &SandboxConfig) -> Self {
        let cpu = config.limits.cpu_seconds();
        Self {
            cpu_soft: clamp_to_hard(Resource::RLIMIT_CPU, cpu),
            cpu_hard: clamp_to_hard(Resource::RLIMIT_CPU, cpu + 1),
            fsize: clamp_to_hard(Resource::RLIMIT_FSIZE, config.max_file_bytes),
            nofile: clamp_to_hard(Resource::RLIMIT_NOFILE, config.max_open_files),
        }
    }

    fn apply(&self) -> nix::Result<()> {
        setrlimit(Resource::RLIMIT_CPU, self.cpu_soft, self.cpu_hard)?;
        setrlimit(Resource::RLIMIT_FSIZE, self.fsize, self.fsize)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        setrlimit(Resource::RLIMIT_NOFILE, self.nofile, self.nofile)
    }
}

fn clamp_to_hard(resource: Resource, wanted: u64) -> u64 {
    getrlimit(resource).map_or(wanted, |(_, hard)| wanted.min(hard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rlimits_follow_config() {
        let config = SandboxConfig::builder().cpu_ms(2_500).build();
        let rlimits = RlimitSet::new(&config);
        assert!(rlimits.cpu_soft <= 3);
        assert!(rlimits.cpu_hard <= 4);
        assert!(rlimits.cpu_soft <= rlimits.cpu_hard);
        assert!(rlimits.nofile <= config.max_open_files);
    }

    #[test]
    fn prefix_of_system_binary() {
        let prefix = interpreter_prefix(Path::new("/bin/sh")).unwrap();
        assert_ne!(prefix, Path::new("/"));
    }

    #[test]
    fn missing_interpreter_has_no_prefix() {
        assert_eq!(interpreter_prefix(Path::new("/snipbox/missing/bin/node")), None);
    }

    #[test]
    fn limiter_without_isolation_layers() {
        let isolation = IsolationConfig {
            network: false,
            landlock: false,
            seccomp: false,
            ..IsolationConfig::default()
        };
        let config = SandboxConfig::builder()
            .interpreter("/bin/sh")
            .isolation(isolation)
            .build();
        let limiter = ResourceLimiter::new(&config).unwrap();
        assert!(limiter.seccomp.is_none());
    }
}
