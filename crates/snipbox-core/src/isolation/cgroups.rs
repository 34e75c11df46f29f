//! Cgroups v2 resource limits

use crate::{Result, SnipboxError};
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// Limits written into a fresh leaf cgroup
#[derive(Debug, Clone, Copy)]
pub struct CgroupLimits {
    /// memory.max
    pub memory_max: u64,
    /// pids.max (tasks, so threads count too)
    pub pids_max: u32,
}

/// One cgroup v2 directory owned by a single execution
///
/// The child attaches itself by writing `0` to `cgroup.procs` through a
/// descriptor opened here, before it execs.
#[derive(Debug)]
pub struct CgroupLeaf {
    path: PathBuf,
    procs: File,
    removed: bool,
}

impl CgroupLeaf {
    /// Create `parent/name` and apply `limits`
    pub fn create(parent: &Path, name: &str, limits: CgroupLimits) -> Result<Self> {
        let path = parent.join(name);
        fs::create_dir(&path).map_err(|e| {
            SnipboxError::Cgroup(format!("failed to create {}: {e}", path.display()))
        })?;

        match Self::configure(&path, limits) {
            Ok(procs) => {
                tracing::debug!(
                    cgroup = ?path,
                    memory = limits.memory_max,
                    pids = limits.pids_max,
                    "cgroup created"
                );
                Ok(Self {
                    path,
                    procs,
                    removed: false,
                })
            }
            Err(e) => {
                let _ = fs::remove_dir(&path);
                Err(e)
            }
        }
    }

    fn configure(path: &Path, limits: CgroupLimits) -> Result<File> {
        write_knob(path, "memory.max", &limits.memory_max.to_string())?;
        write_knob(path, "pids.max", &limits.pids_max.to_string())?;
        // Absent without swap accounting
        if path.join("memory.swap.max").exists() {
            write_knob(path, "memory.swap.max", "0")?;
        }
        if path.join("memory.oom.group").exists() {
            write_knob(path, "memory.oom.group", "1")?;
        }

        OpenOptions::new()
            .write(true)
            .open(path.join("cgroup.procs"))
            .map_err(|e| SnipboxError::Cgroup(format!("failed to open cgroup.procs: {e}")))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Descriptor the child writes `0` into to join this cgroup
    #[must_use]
    pub fn procs_fd(&self) -> RawFd {
        self.procs.as_raw_fd()
    }

    /// Get current memory usage
    pub fn memory_current(&self) -> Result<u64> {
        let raw = self.read_knob("memory.current")?;
        raw.trim()
            .parse()
            .map_err(|e| SnipboxError::Cgroup(format!("bad memory.current {raw:?}: {e}")))
    }

    /// Pids of processes currently in the cgroup
    pub fn procs(&self) -> Result<Vec<i32>> {
        let raw = self.read_knob("cgroup.procs")?;
        Ok(raw.lines().filter_map(|l| l.trim().parse().ok()).collect())
    }

    /// Check if the kernel OOM killer fired inside this cgroup
    pub fn was_oom_killed(&self) -> Result<bool> {
        Ok(event_count(&self.read_knob("memory.events")?, "oom_kill") > 0)
    }

    /// Check if a fork was refused because of pids.max
    pub fn hit_pids_limit(&self) -> Result<bool> {
        Ok(event_count(&self.read_knob("pids.events")?, "max") > 0)
    }

    /// SIGKILL everything in the cgroup
    ///
    /// Uses `cgroup.kill` (Linux 5.14+) and falls back to signalling each
    /// listed pid.
    pub fn kill(&self) {
        if fs::write(self.path.join("cgroup.kill"), "1").is_ok() {
            return;
        }
        if let Ok(pids) = self.procs() {
            for pid in pids {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }
    }

    /// Kill remaining processes and remove the directory
    ///
    /// Idempotent; the directory can only be removed once it is empty, so a
    /// failure here is logged and left for the next sweep of the parent.
    pub fn destroy(&mut self) {
        if self.removed {
            return;
        }
        self.kill();
        for _ in 0..50 {
            match fs::remove_dir(&self.path) {
                Ok(()) => {
                    self.removed = true;
                    tracing::debug!(cgroup = ?self.path, "cgroup destroyed");
                    return;
                }
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    std::thread::sleep(std::time::Duration::from_millis(2));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.removed = true;
                    return;
                }
                Err(e) => {
                    tracing::warn!(cgroup = ?self.path, error = %e, "failed to remove cgroup");
                    return;
                }
            }
        }
        tracing::warn!(cgroup = ?self.path, "cgroup still busy, leaving it behind");
    }

    fn read_knob(&self, knob: &str) -> Result<String> {
        fs::read_to_string(self.path.join(knob))
            .map_err(|e| SnipboxError::Cgroup(format!("failed to read {knob}: {e}")))
    }
}

impl Drop for CgroupLeaf {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn write_knob(path: &Path, knob: &str, value: &str) -> Result<()> {
    fs::write(path.join(knob), value)
        .map_err(|e| SnipboxError::Cgroup(format!("failed to set {knob}={value}: {e}")))
}

/// Value of `key` in a flat-keyed file such as memory.events
fn event_count(contents: &str, key: &str) -> u64 {
    contents
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memory_events() {
        let events = "low 0\nhigh 0\nmax 12\noom 1\noom_kill 1\noom_group_kill 0\n";
        assert_eq!(event_count(events, "oom_kill"), 1);
        assert_eq!(event_count(events, "max"), 12);
        assert_eq!(event_count(events, "missing"), 0);
    }

    #[test]
    fn create_fails_without_parent() {
        let dir = tempfile::tempdir().unwrap();
        let limits = CgroupLimits {
            memory_max: 1024,
            pids_max: 4,
        };
        let err = CgroupLeaf::create(&dir.path().join("missing"), "leaf", limits).unwrap_err();
        assert!(matches!(err, SnipboxError::Cgroup(_)));
    }
}
