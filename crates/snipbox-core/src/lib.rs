//! # snipbox-core
//!
//! Sandboxed execution engine for untrusted code snippets.
//!
//! A request flows through these pieces in order:
//! - `gate` - admission control bounding simultaneous executions
//! - `workspace` - one randomly named scratch directory per request
//! - `limiter` - rlimits, cgroup leaf, namespaces, Landlock and seccomp for the child
//! - `runner` - spawns the interpreter and supervises it to a terminal state
//! - `coordinator` - the single entry point that ties them together

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod capture;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod isolation;
pub mod limiter;
pub mod outcome;
pub mod protocol;
pub mod runner;
pub mod workspace;

pub use config::{ExecutionLimits, IsolationConfig, SandboxConfig, SuccessPolicy};
pub use coordinator::Coordinator;
pub use error::SnipboxError;
pub use outcome::{ExecutionOutcome, InternalErrorKind, ResourceKind};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, SnipboxError>;
