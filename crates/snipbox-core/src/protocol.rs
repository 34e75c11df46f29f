//! Wire types for the HTTP front end
//!
//! The editor posts `{ "code": ... }` and renders `success`, `output` and
//! `error` from the response. Everything the engine knows is folded into
//! those three fields here.

use crate::{ExecutionOutcome, ResourceKind, SuccessPolicy};
use serde::{Deserialize, Serialize};

/// Opaque message returned for failures that are the service's fault
pub const SERVER_ERROR: &str = "Server error";

/// Message for a timed out run
pub const TIMED_OUT: &str = "execution timed out";

/// Body of `POST /run`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub code: String,
}

/// Response to `POST /run`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResponse {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl RunResponse {
    /// Fold an outcome into the three fields the editor renders
    ///
    /// Spawn and internal failures carry no detail; host paths and reasons
    /// stay in the server log.
    #[must_use]
    pub fn from_outcome(outcome: &ExecutionOutcome, policy: SuccessPolicy) -> Self {
        let success = outcome.is_success(policy);
        match outcome {
            ExecutionOutcome::Completed {
                exit_code,
                stdout,
                stderr,
            } => {
                let error = if success {
                    None
                } else if stderr.is_empty() {
                    Some(exit_reason(*exit_code))
                } else {
                    Some(String::from_utf8_lossy(stderr).into_owned())
                };
                Self {
                    success,
                    output: String::from_utf8_lossy(stdout).into_owned(),
                    error,
                }
            }
            ExecutionOutcome::TimedOut { partial_stdout, .. } => Self {
                success: false,
                output: String::from_utf8_lossy(partial_stdout).into_owned(),
                error: Some(TIMED_OUT.into()),
            },
            ExecutionOutcome::ResourceExceeded {
                kind,
                partial_stdout,
                ..
            } => Self {
                success: false,
                output: String::from_utf8_lossy(partial_stdout).into_owned(),
                error: Some(kind.description().into()),
            },
            ExecutionOutcome::SpawnFailed { .. } | ExecutionOutcome::InternalError { .. } => {
                Self::server_error()
            }
        }
    }

    #[must_use]
    pub fn server_error() -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(SERVER_ERROR.into()),
        }
    }

    /// Response for a body that is not a valid `RunRequest`
    #[must_use]
    pub fn invalid_request() -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some("invalid request body".into()),
        }
    }
}

/// HTTP status code for an outcome
#[must_use]
pub const fn status_code(outcome: &ExecutionOutcome) -> u16 {
    match outcome {
        ExecutionOutcome::Completed { .. } | ExecutionOutcome::TimedOut { .. } => 200,
        ExecutionOutcome::ResourceExceeded { kind, .. } => match kind {
            ResourceKind::SourceTooLarge => 413,
            ResourceKind::ServerBusy => 503,
            _ => 200,
        },
        ExecutionOutcome::SpawnFailed { .. } | ExecutionOutcome::InternalError { .. } => 500,
    }
}

/// Body of `GET /status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub slots_total: usize,
    pub slots_available: usize,
    pub slots_busy: usize,
    pub active_workspaces: usize,
}

/// Describe a non-zero exit when the program said nothing on stderr
fn exit_reason(exit_code: i32) -> String {
    if exit_code > 128 {
        format!("process terminated by signal {}", exit_code - 128)
    } else {
        format!("process exited with code {exit_code}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InternalErrorKind;

    const POLICY: SuccessPolicy = SuccessPolicy::ExitCodeAndStderr;

    #[test]
    fn clean_exit_maps_to_success() {
        let outcome = ExecutionOutcome::Completed {
            exit_code: 0,
            stdout: b"hi\n".to_vec(),
            stderr: Vec::new(),
        };
        let response = RunResponse::from_outcome(&outcome, POLICY);
        assert_eq!(
            response,
            RunResponse {
                success: true,
                output: "hi\n".into(),
                error: None,
            }
        );
        assert_eq!(status_code(&outcome), 200);
    }

    #[test]
    fn stderr_becomes_error() {
        let outcome = ExecutionOutcome::Completed {
            exit_code: 1,
            stdout: b"partial".to_vec(),
            stderr: b"Error: boom".to_vec(),
        };
        let response = RunResponse::from_outcome(&outcome, POLICY);
        assert!(!response.success);
        assert_eq!(response.output, "partial");
        assert_eq!(response.error.as_deref(), Some("Error: boom"));
    }

    #[test]
    fn silent_failure_reports_exit_code() {
        let outcome = ExecutionOutcome::Completed {
            exit_code: 3,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        let response = RunResponse::from_outcome(&outcome, POLICY);
        assert_eq!(response.error.as_deref(), Some("process exited with code 3"));

        let killed = ExecutionOutcome::Completed {
            exit_code: 137,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        let response = RunResponse::from_outcome(&killed, POLICY);
        assert_eq!(response.error.as_deref(), Some("process terminated by signal 9"));
    }

    #[test]
    fn stderr_warning_with_exit_code_only_policy() {
        let outcome = ExecutionOutcome::Completed {
            exit_code: 0,
            stdout: b"ok".to_vec(),
            stderr: b"DeprecationWarning".to_vec(),
        };
        assert!(!RunResponse::from_outcome(&outcome, POLICY).success);
        let response = RunResponse::from_outcome(&outcome, SuccessPolicy::ExitCodeOnly);
        assert!(response.success);
        assert_eq!(response.error, None);
    }

    #[test]
    fn timeout_keeps_partial_output() {
        let outcome = ExecutionOutcome::TimedOut {
            partial_stdout: b"tick\n".to_vec(),
            partial_stderr: Vec::new(),
        };
        let response = RunResponse::from_outcome(&outcome, POLICY);
        assert_eq!(response.output, "tick\n");
        assert_eq!(response.error.as_deref(), Some(TIMED_OUT));
    }

    #[test]
    fn resource_kinds_map_to_status() {
        let busy = ExecutionOutcome::rejected(ResourceKind::ServerBusy);
        assert_eq!(status_code(&busy), 503);
        assert_eq!(
            RunResponse::from_outcome(&busy, POLICY).error.as_deref(),
            Some("server busy, try again later")
        );
        assert_eq!(
            status_code(&ExecutionOutcome::rejected(ResourceKind::SourceTooLarge)),
            413
        );
        assert_eq!(status_code(&ExecutionOutcome::rejected(ResourceKind::Memory)), 200);
    }

    #[test]
    fn internal_detail_is_not_leaked() {
        let outcome = ExecutionOutcome::internal(
            InternalErrorKind::WorkspaceCreateFailed,
            "mkdir /var/tmp/snipbox/abc: permission denied",
        );
        let response = RunResponse::from_outcome(&outcome, POLICY);
        assert_eq!(response, RunResponse::server_error());
        assert_eq!(status_code(&outcome), 500);

        let spawn = ExecutionOutcome::SpawnFailed {
            reason: "/usr/bin/node: not found".into(),
        };
        assert_eq!(RunResponse::from_outcome(&spawn, POLICY), RunResponse::server_error());
    }

    #[test]
    fn response_serializes_null_error() {
        let json = serde_json::to_string(&RunResponse {
            success: true,
            output: "x".into(),
            error: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"success":true,"output":"x","error":null}"#);
    }
}
