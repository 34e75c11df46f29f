//! Execution outcome types

use crate::SuccessPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which ceiling an execution ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Resident memory of the process group went over the limit
    Memory,
    /// Combined stdout + stderr went over the limit
    Output,
    /// Too many processes in the group
    Processes,
    /// CPU time budget exhausted (SIGXCPU)
    Cpu,
    /// Submitted source was larger than accepted
    SourceTooLarge,
    /// No execution slot became free in time
    ServerBusy,
}

impl ResourceKind {
    /// Human-readable description shown to callers
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Memory => "memory limit exceeded",
            Self::Output => "output limit exceeded",
            Self::Processes => "process limit exceeded",
            Self::Cpu => "cpu time limit exceeded",
            Self::SourceTooLarge => "source code too large",
            Self::ServerBusy => "server busy, try again later",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Category of a failure that is the service's fault, not the program's
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InternalErrorKind {
    WorkspaceCreateFailed,
    WorkspaceWriteFailed,
    /// An isolation layer could not be applied in strict mode
    Sandbox,
    /// I/O failure while supervising the child
    Supervisor,
    /// The execution task panicked or was cancelled
    TaskFailed,
}

/// Terminal result of one execution request
///
/// Exactly one variant is produced per request. Byte buffers hold what the
/// program wrote; they are converted to text only at the response boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The interpreter exited on its own
    Completed {
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    /// Wall-clock deadline elapsed
    TimedOut {
        partial_stdout: Vec<u8>,
        partial_stderr: Vec<u8>,
    },
    /// A resource ceiling was hit
    ResourceExceeded {
        kind: ResourceKind,
        partial_stdout: Vec<u8>,
        partial_stderr: Vec<u8>,
    },
    /// The interpreter could not be started
    SpawnFailed { reason: String },
    /// Something went wrong on the service side
    InternalError {
        kind: InternalErrorKind,
        reason: String,
    },
}

impl ExecutionOutcome {
    /// Shorthand for a rejection that never produced output
    #[must_use]
    pub const fn rejected(kind: ResourceKind) -> Self {
        Self::ResourceExceeded {
            kind,
            partial_stdout: Vec::new(),
            partial_stderr: Vec::new(),
        }
    }

    #[must_use]
    pub fn internal(kind: InternalErrorKind, reason: impl Into<String>) -> Self {
        Self::InternalError {
            kind,
            reason: reason.into(),
        }
    }

    /// Whether the program ran to completion successfully under `policy`
    #[must_use]
    pub fn is_success(&self, policy: SuccessPolicy) -> bool {
        match self {
            Self::Completed {
                exit_code, stderr, ..
            } => {
                *exit_code == 0
                    && (policy == SuccessPolicy::ExitCodeOnly || stderr.is_empty())
            }
            _ => false,
        }
    }

    /// Captured stdout, partial or complete, if any was collected
    #[must_use]
    pub fn stdout(&self) -> &[u8] {
        match self {
            Self::Completed { stdout, .. } => stdout,
            Self::TimedOut { partial_stdout, .. }
            | Self::ResourceExceeded { partial_stdout, .. } => partial_stdout,
            Self::SpawnFailed { .. } | Self::InternalError { .. } => &[],
        }
    }

    /// Get stdout as UTF-8 string, lossy conversion
    #[must_use]
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(self.stdout()).into_owned()
    }

    /// Short label for logs
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::TimedOut { .. } => "timed_out",
            Self::ResourceExceeded { .. } => "resource_exceeded",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::InternalError { .. } => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(exit_code: i32, stderr: &str) -> ExecutionOutcome {
        ExecutionOutcome::Completed {
            exit_code,
            stdout: b"out".to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn stderr_counts_as_failure_by_default() {
        assert!(completed(0, "").is_success(SuccessPolicy::ExitCodeAndStderr));
        assert!(!completed(0, "warning").is_success(SuccessPolicy::ExitCodeAndStderr));
        assert!(!completed(1, "").is_success(SuccessPolicy::ExitCodeAndStderr));
    }

    #[test]
    fn exit_code_only_ignores_stderr() {
        assert!(completed(0, "warning").is_success(SuccessPolicy::ExitCodeOnly));
        assert!(!completed(2, "").is_success(SuccessPolicy::ExitCodeOnly));
    }

    #[test]
    fn non_completed_outcomes_never_succeed() {
        let timed_out = ExecutionOutcome::TimedOut {
            partial_stdout: Vec::new(),
            partial_stderr: Vec::new(),
        };
        assert!(!timed_out.is_success(SuccessPolicy::ExitCodeOnly));
        assert!(!ExecutionOutcome::rejected(ResourceKind::ServerBusy)
            .is_success(SuccessPolicy::ExitCodeOnly));
    }

    #[test]
    fn serializes_with_tag() {
        let json = serde_json::to_value(ExecutionOutcome::rejected(ResourceKind::Memory)).unwrap();
        assert_eq!(json["outcome"], "resource_exceeded");
        assert_eq!(json["kind"], "memory");
    }
}
