//! Sandbox configuration

use crate::{Result, SnipboxError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Per-execution resource ceilings, constant for the lifetime of the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionLimits {
    /// Wall-clock deadline before the process group is terminated
    pub max_wall_clock_ms: u64,

    /// CPU time budget, enforced with RLIMIT_CPU
    pub max_cpu_ms: u64,

    /// Resident memory ceiling for the whole process group
    pub max_memory_bytes: u64,

    /// Combined stdout + stderr capture ceiling
    pub max_output_bytes: usize,

    /// Processes the interpreter may create beyond itself
    pub max_processes: u32,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_wall_clock_ms: 5_000,
            max_cpu_ms: 5_000,
            max_memory_bytes: 256 * 1024 * 1024, // 256MB
            max_output_bytes: 64 * 1024,
            max_processes: 16,
        }
    }
}

impl ExecutionLimits {
    #[must_use]
    pub const fn wall_clock(&self) -> Duration {
        Duration::from_millis(self.max_wall_clock_ms)
    }

    /// CPU budget rounded up to whole seconds, the granularity of RLIMIT_CPU
    #[must_use]
    pub const fn cpu_seconds(&self) -> u64 {
        self.max_cpu_ms.div_ceil(1000)
    }
}

/// OS-level isolation applied to every spawned interpreter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Run the child in fresh user + network namespaces
    pub network: bool,

    /// Restrict filesystem access with Landlock
    pub landlock: bool,

    /// Install the seccomp deny-list
    pub seccomp: bool,

    /// Fail the execution if any isolation layer cannot be applied
    pub strict: bool,

    /// Switch to this uid before exec (requires root)
    pub run_as_uid: Option<u32>,

    /// Switch to this gid before exec (requires root)
    pub run_as_gid: Option<u32>,

    /// Delegated cgroup v2 directory; one leaf is created per execution
    pub cgroup_parent: Option<PathBuf>,

    /// Hard task (process + thread) cap written to pids.max
    pub cgroup_pids_max: u32,

    /// Tasks beyond `max_processes` tolerated by the RLIMIT_NPROC ceiling,
    /// which counts the interpreter's threads as well as its children
    pub thread_allowance: u32,

    /// Paths readable (and executable) inside the sandbox
    pub ro_paths: Vec<PathBuf>,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            network: true,
            landlock: true,
            seccomp: true,
            strict: false,
            run_as_uid: None,
            run_as_gid: None,
            cgroup_parent: None,
            cgroup_pids_max: 128,
            thread_allowance: 32,
            ro_paths: [
                "/usr", "/lib", "/lib32", "/lib64", "/bin", "/sbin", "/etc", "/dev", "/proc",
                "/sys",
            ]
            .into_iter()
            .map(PathBuf::from)
            .collect(),
        }
    }
}

/// How a completed run is judged successful
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessPolicy {
    /// Exit code 0 and nothing written to stderr
    #[default]
    ExitCodeAndStderr,
    /// Exit code 0, stderr ignored
    ExitCodeOnly,
}

/// Configuration for the execution engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter binary; bare names are looked up on PATH
    pub interpreter: PathBuf,

    /// Arguments placed before the source file path
    pub interpreter_args: Vec<String>,

    /// Name of the source file inside each workspace
    pub source_file_name: String,

    /// Directory under which per-request workspaces are created
    pub workspace_root: PathBuf,

    /// Extra environment variables passed to the interpreter
    pub env: Vec<(String, String)>,

    /// Resource ceilings
    pub limits: ExecutionLimits,

    /// Isolation layers
    pub isolation: IsolationConfig,

    /// Largest file the interpreter may write (RLIMIT_FSIZE)
    pub max_file_bytes: u64,

    /// Open file descriptor ceiling (RLIMIT_NOFILE)
    pub max_open_files: u64,

    /// Delay between SIGTERM and SIGKILL
    pub kill_grace_ms: u64,

    /// How often the process group is sampled for memory and process count
    pub sample_interval_ms: u64,

    /// How long to wait for output pipes to close after the process exits
    pub drain_timeout_ms: u64,

    /// Largest accepted source snippet
    pub max_source_bytes: usize,

    /// Simultaneous executions allowed host-wide
    pub max_concurrent: usize,

    /// How long a request may wait for a free slot
    pub queue_wait_ms: u64,

    /// Success definition exposed to callers
    pub success_policy: SuccessPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("node"),
            interpreter_args: Vec::new(),
            source_file_name: "main.js".into(),
            workspace_root: std::env::temp_dir().join("snipbox"),
            env: Vec::new(),
            limits: ExecutionLimits::default(),
            isolation: IsolationConfig::default(),
            max_file_bytes: 1024 * 1024,
            max_open_files: 256,
            kill_grace_ms: 500,
            sample_interval_ms: 25,
            drain_timeout_ms: 1_000,
            max_source_bytes: 16 * 1024,
            max_concurrent: 4,
            queue_wait_ms: 10_000,
            success_policy: SuccessPolicy::default(),
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    #[must_use]
    pub const fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    #[must_use]
    pub const fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    #[must_use]
    pub const fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }

    /// Reject configurations that would make every request fail or hang
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        let zero = [
            ("limits.max_wall_clock_ms", limits.max_wall_clock_ms == 0),
            ("limits.max_cpu_ms", limits.max_cpu_ms == 0),
            ("limits.max_memory_bytes", limits.max_memory_bytes == 0),
            ("limits.max_output_bytes", limits.max_output_bytes == 0),
            ("max_source_bytes", self.max_source_bytes == 0),
            ("max_concurrent", self.max_concurrent == 0),
            ("sample_interval_ms", self.sample_interval_ms == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(SnipboxError::Config(format!("{name} must be greater than zero")));
        }

        if !is_plain_file_name(&self.source_file_name) {
            return Err(SnipboxError::Config(format!(
                "source_file_name {:?} must be a single path component",
                self.source_file_name
            )));
        }

        if self.isolation.run_as_uid.is_some() != self.isolation.run_as_gid.is_some() {
            return Err(SnipboxError::Config(
                "run_as_uid and run_as_gid must be set together".into(),
            ));
        }

        Ok(())
    }

    /// Resolve a bare interpreter name against PATH
    ///
    /// Leaves the config untouched when the binary cannot be found, so
    /// executions report a spawn failure instead of the service refusing to start.
    pub fn resolve_interpreter(&mut self) {
        if self.interpreter.is_absolute() {
            return;
        }
        match which::which(&self.interpreter) {
            Ok(path) => {
                tracing::debug!(interpreter = ?path, "resolved interpreter");
                self.interpreter = path;
            }
            Err(e) => {
                tracing::warn!(interpreter = ?self.interpreter, error = %e, "interpreter not found on PATH");
            }
        }
    }
}

/// A file name that stays inside the directory it is joined to
pub(crate) fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\0')
}

/// Builder for SandboxConfig
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    #[must_use]
    pub fn interpreter(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.interpreter = path.into();
        self
    }

    #[must_use]
    pub fn interpreter_arg(mut self, arg: impl Into<String>) -> Self {
        self.config.interpreter_args.push(arg.into());
        self
    }

    #[must_use]
    pub fn source_file_name(mut self, name: impl Into<String>) -> Self {
        self.config.source_file_name = name.into();
        self
    }

    #[must_use]
    pub fn workspace_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.workspace_root = path.into();
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: ExecutionLimits) -> Self {
        self.config.limits = limits;
        self
    }

    #[must_use]
    pub fn wall_clock_ms(mut self, ms: u64) -> Self {
        self.config.limits.max_wall_clock_ms = ms;
        self
    }

    #[must_use]
    pub fn cpu_ms(mut self, ms: u64) -> Self {
        self.config.limits.max_cpu_ms = ms;
        self
    }

    #[must_use]
    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.config.limits.max_memory_bytes = bytes;
        self
    }

    #[must_use]
    pub fn memory_limit_mb(self, mb: u64) -> Self {
        self.memory_limit(mb * 1024 * 1024)
    }

    #[must_use]
    pub fn output_limit(mut self, bytes: usize) -> Self {
        self.config.limits.max_output_bytes = bytes;
        self
    }

    #[must_use]
    pub fn max_processes(mut self, count: u32) -> Self {
        self.config.limits.max_processes = count;
        self
    }

    #[must_use]
    pub fn isolation(mut self, isolation: IsolationConfig) -> Self {
        self.config.isolation = isolation;
        self
    }

    #[must_use]
    pub fn allow_network(mut self, allow: bool) -> Self {
        self.config.isolation.network = !allow;
        self
    }

    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.config.isolation.strict = strict;
        self
    }

    #[must_use]
    pub fn cgroup_parent(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.isolation.cgroup_parent = Some(path.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn kill_grace_ms(mut self, ms: u64) -> Self {
        self.config.kill_grace_ms = ms;
        self
    }

    #[must_use]
    pub fn max_source_bytes(mut self, bytes: usize) -> Self {
        self.config.max_source_bytes = bytes;
        self
    }

    #[must_use]
    pub fn max_concurrent(mut self, slots: usize) -> Self {
        self.config.max_concurrent = slots;
        self
    }

    #[must_use]
    pub fn queue_wait_ms(mut self, ms: u64) -> Self {
        self.config.queue_wait_ms = ms;
        self
    }

    #[must_use]
    pub fn success_policy(mut self, policy: SuccessPolicy) -> Self {
        self.config.success_policy = policy;
        self
    }

    #[must_use]
    pub fn build(self) -> SandboxConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SandboxConfig::default().validate().unwrap();
    }

    #[test]
    fn cpu_seconds_rounds_up() {
        let limits = ExecutionLimits {
            max_cpu_ms: 1_001,
            ..ExecutionLimits::default()
        };
        assert_eq!(limits.cpu_seconds(), 2);

        let limits = ExecutionLimits {
            max_cpu_ms: 3_000,
            ..ExecutionLimits::default()
        };
        assert_eq!(limits.cpu_seconds(), 3);
    }

    #[test]
    fn zero_slots_rejected() {
        let config = SandboxConfig::builder().max_concurrent(0).build();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_concurrent"));
    }

    #[test]
    fn source_file_name_must_be_single_component() {
        for bad in ["", "..", "a/b.js", "/etc/passwd"] {
            let config = SandboxConfig::builder().source_file_name(bad).build();
            assert!(config.validate().is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{"limits": {"max_wall_clock_ms": 2000}, "max_concurrent": 2}"#)
                .unwrap();
        assert_eq!(config.limits.max_wall_clock_ms, 2000);
        assert_eq!(config.limits.max_output_bytes, 64 * 1024);
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.success_policy, SuccessPolicy::ExitCodeAndStderr);
    }

    #[test]
    fn success_policy_uses_snake_case() {
        let policy: SuccessPolicy = serde_json::from_str(r#""exit_code_only""#).unwrap();
        assert_eq!(policy, SuccessPolicy::ExitCodeOnly);
    }
}
