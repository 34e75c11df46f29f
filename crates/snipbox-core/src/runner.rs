//! Spawn and supervise one interpreter process

use crate::capture::{Capture, OutputBudget};
use crate::isolation::SANDBOX_SETUP_ERRNO;
use crate::limiter::group::{ProcessGroup, exit_code};
use crate::limiter::ResourceLimiter;
use crate::workspace::Workspace;
use crate::{ExecutionLimits, ExecutionOutcome, InternalErrorKind, ResourceKind, Result, SandboxConfig};
use std::fmt;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Lifecycle of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Created,
    Spawning,
    Running,
    Terminating,
    Finished,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Spawning => "spawning",
            Self::Running => "running",
            Self::Terminating => "terminating",
            Self::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Tracks the state of a single run; transitions only move forward
#[derive(Debug)]
struct Lifecycle {
    state: RunState,
    started: Instant,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: RunState::Created,
            started: Instant::now(),
        }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(next > self.state, "{} -> {next}", self.state);
        tracing::trace!(
            from = %self.state,
            to = %next,
            elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "run state"
        );
        self.state = next;
    }
}

/// Why supervision stopped
#[derive(Debug)]
enum Stop {
    Exited(ExitStatus),
    TimedOut,
    Exceeded(ResourceKind),
    WaitFailed(io::Error),
}

/// Runs the interpreter on a prepared workspace
pub struct Runner {
    config: Arc<SandboxConfig>,
    limiter: ResourceLimiter,
}

impl Runner {
    pub fn new(config: Arc<SandboxConfig>) -> Result<Self> {
        let limiter = ResourceLimiter::new(&config)?;
        Ok(Self { config, limiter })
    }

    /// Run the source file in `workspace` to a terminal outcome
    ///
    /// Never fails: every error is folded into the outcome. When this returns,
    /// no process started for the execution is still alive.
    pub async fn run(&self, workspace: &Workspace, limits: &ExecutionLimits) -> ExecutionOutcome {
        let mut lifecycle = Lifecycle::new();

        // Relative to the workspace so host paths stay out of error output
        let Some(source) = workspace.source_file().and_then(Path::file_name) else {
            return ExecutionOutcome::internal(
                InternalErrorKind::WorkspaceWriteFailed,
                "workspace has no source file",
            );
        };

        let constraints = match self.limiter.prepare(workspace, limits) {
            Ok(constraints) => constraints,
            Err(e) => {
                tracing::error!(error = %e, "failed to prepare sandbox");
                return ExecutionOutcome::internal(InternalErrorKind::Sandbox, e.to_string());
            }
        };

        lifecycle.advance(RunState::Spawning);
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.interpreter_args)
            .arg(source)
            .current_dir(workspace.root())
            .env_clear()
            .envs(self.environment(workspace))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let cgroup = constraints.install(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return spawn_failure(&e),
        };
        let Some(pid) = child.id() else {
            return ExecutionOutcome::internal(InternalErrorKind::Supervisor, "child exited before supervision");
        };
        let mut group = ProcessGroup::new(pid, cgroup, limits.clone());
        lifecycle.advance(RunState::Running);
        tracing::debug!(pid, "interpreter started");

        let budget = OutputBudget::new(limits.max_output_bytes);
        let stdout = child.stdout.take().map(|out| Capture::spawn(out, Arc::clone(&budget)));
        let stderr = child.stderr.take().map(|err| Capture::spawn(err, Arc::clone(&budget)));

        let stop = self.supervise(&mut child, &group, &budget, limits).await;

        let stop = match stop {
            Stop::Exited(status) => Stop::Exited(status),
            other => {
                lifecycle.advance(RunState::Terminating);
                self.stop_group(&mut child, &group, other).await
            }
        };
        group.kill_all();

        let drain = self.config.drain_timeout();
        let stdout = match stdout {
            Some(capture) => capture.finish(drain).await,
            None => Vec::new(),
        };
        let stderr = match stderr {
            Some(capture) => capture.finish(drain).await,
            None => Vec::new(),
        };
        lifecycle.advance(RunState::Finished);

        match stop {
            Stop::Exited(status) => {
                let violation = group
                    .violation_after_exit(status)
                    .or_else(|| budget.is_exceeded().then_some(ResourceKind::Output));
                match violation {
                    Some(kind) => ExecutionOutcome::ResourceExceeded {
                        kind,
                        partial_stdout: stdout,
                        partial_stderr: stderr,
                    },
                    None => ExecutionOutcome::Completed {
                        exit_code: exit_code(status),
                        stdout,
                        stderr,
                    },
                }
            }
            Stop::TimedOut => ExecutionOutcome::TimedOut {
                partial_stdout: stdout,
                partial_stderr: stderr,
            },
            Stop::Exceeded(kind) => ExecutionOutcome::ResourceExceeded {
                kind,
                partial_stdout: stdout,
                partial_stderr: stderr,
            },
            Stop::WaitFailed(e) => {
                tracing::error!(error = %e, "failed to wait on interpreter");
                ExecutionOutcome::internal(InternalErrorKind::Supervisor, e.to_string())
            }
        }
    }

    /// Wait for exit, the deadline, or a limit violation, whichever comes first
    async fn supervise(
        &self,
        child: &mut Child,
        group: &ProcessGroup,
        budget: &OutputBudget,
        limits: &ExecutionLimits,
    ) -> Stop {
        let deadline = tokio::time::sleep(limits.wall_clock());
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.config.sample_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(status) => Stop::Exited(status),
                        Err(e) => Stop::WaitFailed(e),
                    };
                }
                () = &mut deadline => return Stop::TimedOut,
                () = budget.exceeded() => return Stop::Exceeded(ResourceKind::Output),
                _ = ticker.tick() => {
                    if let Some(kind) = group.check() {
                        return Stop::Exceeded(kind);
                    }
                }
            }
        }
    }

    /// Bring a still-running group down and reap the interpreter
    ///
    /// Timeouts get SIGTERM and a grace period; limit violations are killed
    /// outright.
    async fn stop_group(&self, child: &mut Child, group: &ProcessGroup, stop: Stop) -> Stop {
        let reaped = match &stop {
            Stop::TimedOut => {
                tracing::info!(pgid = %group.pgid(), "wall-clock limit reached, terminating");
                group.terminate(child, self.config.kill_grace()).await
            }
            Stop::Exceeded(kind) => {
                tracing::info!(pgid = %group.pgid(), %kind, "resource limit reached, killing");
                group.kill(child).await
            }
            Stop::Exited(_) | Stop::WaitFailed(_) => group.kill(child).await,
        };
        match reaped {
            Ok(_) => stop,
            Err(e) => Stop::WaitFailed(e),
        }
    }

    /// The interpreter's entire environment
    fn environment(&self, workspace: &Workspace) -> Vec<(String, String)> {
        let home = workspace.root().to_string_lossy().into_owned();
        let mut env = vec![
            ("PATH".to_owned(), DEFAULT_PATH.to_owned()),
            ("HOME".to_owned(), home.clone()),
            ("TMPDIR".to_owned(), home),
            ("LANG".to_owned(), "C.UTF-8".to_owned()),
        ];
        env.extend(self.config.env.iter().cloned());
        env
    }
}

fn spawn_failure(e: &io::Error) -> ExecutionOutcome {
    if e.raw_os_error() == Some(SANDBOX_SETUP_ERRNO) {
        tracing::error!("isolation layer failed in strict mode");
        return ExecutionOutcome::internal(
            InternalErrorKind::Sandbox,
            "failed to apply sandbox restrictions",
        );
    }
    tracing::error!(error = %e, "failed to spawn interpreter");
    ExecutionOutcome::SpawnFailed {
        reason: e.to_string(),
    }
}
