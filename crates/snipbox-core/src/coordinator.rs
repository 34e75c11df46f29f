//! Single entry point for executing a snippet

use crate::gate::ConcurrencyGate;
use crate::protocol::StatusReport;
use crate::runner::Runner;
use crate::workspace::{ExecutionRequest, WorkspaceManager};
use crate::{ExecutionOutcome, InternalErrorKind, ResourceKind, Result, SandboxConfig, SuccessPolicy};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Admission, workspace, execution and cleanup for every request
///
/// Shared across requests behind an `Arc`; all methods take `&self`.
pub struct Coordinator {
    config: Arc<SandboxConfig>,
    gate: ConcurrencyGate,
    workspaces: WorkspaceManager,
    runner: Runner,
}

impl Coordinator {
    /// Validate `config` and set up the workspace root and sandbox layers
    pub fn new(mut config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        config.resolve_interpreter();

        let workspaces = WorkspaceManager::new(&config.workspace_root)?;
        let gate = ConcurrencyGate::new(config.max_concurrent, config.queue_wait());
        let config = Arc::new(config);
        let runner = Runner::new(Arc::clone(&config))?;

        tracing::info!(
            interpreter = ?config.interpreter,
            workspace_root = ?config.workspace_root,
            slots = config.max_concurrent,
            "coordinator ready"
        );

        Ok(Self {
            config,
            gate,
            workspaces,
            runner,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    #[must_use]
    pub fn policy(&self) -> SuccessPolicy {
        self.config.success_policy
    }

    /// Execute `source_code` and return its outcome
    ///
    /// Never fails. The workspace is gone and the concurrency slot released
    /// by the time this returns.
    pub async fn execute(&self, source_code: &str) -> ExecutionOutcome {
        if source_code.len() > self.config.max_source_bytes {
            tracing::warn!(
                size = source_code.len(),
                limit = self.config.max_source_bytes,
                "source rejected"
            );
            return ExecutionOutcome::rejected(ResourceKind::SourceTooLarge);
        }

        let request = ExecutionRequest::new(source_code);
        let span = tracing::info_span!("execute", request_id = %request.id());
        self.execute_request(request).instrument(span).await
    }

    /// Like [`execute`](Self::execute), but on its own task
    ///
    /// A panic inside the execution is reported as an internal error
    /// instead of unwinding into the caller.
    pub async fn execute_detached(self: &Arc<Self>, source_code: String) -> ExecutionOutcome {
        let this = Arc::clone(self);
        match tokio::spawn(async move { this.execute(&source_code).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "execution task failed");
                ExecutionOutcome::internal(InternalErrorKind::TaskFailed, e.to_string())
            }
        }
    }

    async fn execute_request(&self, request: ExecutionRequest) -> ExecutionOutcome {
        let started = Instant::now();

        let Ok(slot) = self.gate.acquire().await else {
            return ExecutionOutcome::rejected(ResourceKind::ServerBusy);
        };

        let mut workspace = match self.workspaces.create(&request) {
            Ok(workspace) => workspace,
            Err(e) => {
                tracing::error!(error = %e, "failed to create workspace");
                return ExecutionOutcome::internal(InternalErrorKind::WorkspaceCreateFailed, e.to_string());
            }
        };

        if let Err(e) = workspace.write_source(&self.config.source_file_name, request.source_code()) {
            tracing::error!(error = %e, "failed to write source file");
            return ExecutionOutcome::internal(InternalErrorKind::WorkspaceWriteFailed, e.to_string());
        }

        let outcome = self.runner.run(&workspace, &self.config.limits).await;

        workspace.destroy();
        self.gate.release(slot);

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &outcome {
            ExecutionOutcome::SpawnFailed { reason } | ExecutionOutcome::InternalError { reason, .. } => {
                tracing::error!(outcome = outcome.label(), %reason, elapsed_ms, "execution failed");
            }
            _ => tracing::info!(outcome = outcome.label(), elapsed_ms, "execution finished"),
        }
        outcome
    }

    /// Snapshot of slot usage and live workspaces
    #[must_use]
    pub fn status(&self) -> StatusReport {
        let gate = self.gate.status();
        StatusReport {
            slots_total: gate.total,
            slots_available: gate.available,
            slots_busy: gate.busy,
            active_workspaces: self.workspaces.active_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IsolationConfig;

    fn builder(root: &std::path::Path) -> crate::config::SandboxConfigBuilder {
        SandboxConfig::builder()
            .interpreter("/bin/sh")
            .source_file_name("main.sh")
            .workspace_root(root)
            .isolation(IsolationConfig {
                network: false,
                landlock: false,
                seccomp: false,
                ..IsolationConfig::default()
            })
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = builder(dir.path()).build();
        cfg.max_concurrent = 0;
        assert!(Coordinator::new(cfg).is_err());
    }

    #[tokio::test]
    async fn oversized_source_never_touches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::new(builder(dir.path()).max_source_bytes(8).build()).unwrap();

        let outcome = coordinator.execute("echo 0123456789").await;
        assert_eq!(outcome, ExecutionOutcome::rejected(ResourceKind::SourceTooLarge));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn status_reflects_idle_service() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Coordinator::new(builder(dir.path()).build()).unwrap();
        let status = coordinator.status();
        assert_eq!(status.slots_total, 4);
        assert_eq!(status.slots_available, 4);
        assert_eq!(status.slots_busy, 0);
        assert_eq!(status.active_workspaces, 0);
    }
}
