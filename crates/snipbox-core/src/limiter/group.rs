//! Supervision of a spawned process group

use super::usage::{self, GroupUsage};
use crate::isolation::CgroupLeaf;
use crate::{ExecutionLimits, ResourceKind};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;

/// The interpreter's process group plus its optional cgroup leaf
///
/// The interpreter calls `setsid` before exec, so its pid doubles as the
/// process-group id. Dropping the guard SIGKILLs whatever is left, which
/// keeps a cancelled execution from leaking processes.
#[derive(Debug)]
pub struct ProcessGroup {
    pgid: Pid,
    cgroup: Option<CgroupLeaf>,
    limits: ExecutionLimits,
    cleaned: bool,
}

impl ProcessGroup {
    #[must_use]
    pub fn new(pid: u32, cgroup: Option<CgroupLeaf>, limits: ExecutionLimits) -> Self {
        let pgid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
        Self {
            pgid,
            cgroup,
            limits,
            cleaned: false,
        }
    }

    #[must_use]
    pub const fn pgid(&self) -> Pid {
        self.pgid
    }

    /// Current footprint, from the cgroup when there is one
    #[must_use]
    pub fn sample(&self) -> GroupUsage {
        let Some(cgroup) = &self.cgroup else {
            return usage::sample_process_group(self.pgid.as_raw());
        };
        let pids = cgroup.procs().unwrap_or_default();
        let mut usage = usage::sample_pids(&pids);
        if let Ok(current) = cgroup.memory_current() {
            usage.rss_bytes = usage.rss_bytes.max(current);
        }
        usage
    }

    /// Limit the group is currently over, if any
    #[must_use]
    pub fn check(&self) -> Option<ResourceKind> {
        let usage = self.sample();
        if usage.rss_bytes > self.limits.max_memory_bytes {
            tracing::debug!(rss = usage.rss_bytes, "memory limit exceeded");
            return Some(ResourceKind::Memory);
        }
        let allowed = usize::try_from(self.limits.max_processes).unwrap_or(usize::MAX);
        if usage.extra_processes() > allowed {
            tracing::debug!(processes = usage.processes, "process limit exceeded");
            return Some(ResourceKind::Processes);
        }
        None
    }

    /// Send `signal` to every member of the group
    pub fn signal(&self, signal: Signal) {
        match killpg(self.pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pgid = %self.pgid, ?signal, error = %e, "killpg failed"),
        }
    }

    /// SIGTERM the group, then SIGKILL once `grace` has passed
    pub async fn terminate(&self, child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
        self.signal(Signal::SIGTERM);
        if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
            return status;
        }
        tracing::debug!(pgid = %self.pgid, "grace period elapsed, escalating to SIGKILL");
        self.kill(child).await
    }

    /// SIGKILL the group and reap the interpreter
    pub async fn kill(&self, child: &mut Child) -> io::Result<ExitStatus> {
        self.signal(Signal::SIGKILL);
        child.wait().await
    }

    /// Kill anything still alive in the group or cgroup
    ///
    /// Called once the interpreter has been reaped, to take down orphans it
    /// left running in the background.
    pub fn kill_all(&mut self) {
        if self.cleaned {
            return;
        }
        self.signal(Signal::SIGKILL);
        if let Some(cgroup) = &self.cgroup {
            cgroup.kill();
        }
        self.cleaned = true;
    }

    /// Classify an exit the kernel forced on the interpreter
    #[must_use]
    pub fn violation_after_exit(&self, status: ExitStatus) -> Option<ResourceKind> {
        if status.signal() == Some(Signal::SIGXCPU as i32) {
            return Some(ResourceKind::Cpu);
        }
        let cgroup = self.cgroup.as_ref()?;
        if cgroup.was_oom_killed().unwrap_or(false) {
            return Some(ResourceKind::Memory);
        }
        // A refused fork only matters if the program failed because of it
        if !status.success() && cgroup.hit_pids_limit().unwrap_or(false) {
            return Some(ResourceKind::Processes);
        }
        None
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if !self.cleaned {
            tracing::debug!(pgid = %self.pgid, "process group dropped while running, killing");
        }
        self.kill_all();
    }
}

/// Exit code as a shell reports it: 128 + signal for signalled exits
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_group_leader(script: &str) -> Child {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script).stdin(Stdio::null()).kill_on_drop(true);
        // SAFETY: setsid is async-signal-safe
        unsafe {
            cmd.pre_exec(|| nix::unistd::setsid().map(|_| ()).map_err(io::Error::from));
        }
        cmd.spawn().unwrap()
    }

    #[test]
    fn signalled_exit_codes() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(libc::SIGKILL)), 137);
    }

    #[tokio::test]
    async fn terminate_escalates_past_ignored_sigterm() {
        let mut child = spawn_group_leader("trap '' TERM; while :; do :; done");
        let group = ProcessGroup::new(child.id().unwrap(), None, ExecutionLimits::default());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = group
            .terminate(&mut child, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn kill_all_takes_down_the_group() {
        let mut child = spawn_group_leader("sleep 30 & wait");
        let pid = child.id().unwrap();
        let mut group = ProcessGroup::new(pid, None, ExecutionLimits::default());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(group.sample().processes >= 2);

        group.kill_all();
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn process_limit_is_detected() {
        let mut child = spawn_group_leader("sleep 5 & sleep 5 & sleep 5 & wait");
        let limits = ExecutionLimits {
            max_processes: 1,
            ..ExecutionLimits::default()
        };
        let group = ProcessGroup::new(child.id().unwrap(), None, limits);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(group.check(), Some(ResourceKind::Processes));
        group.kill(&mut child).await.unwrap();
    }
}
