//! Error types for snipbox-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnipboxError {
    #[error("seccomp error: {0}")]
    Seccomp(String),

    #[error("landlock error: {0}")]
    Landlock(String),

    #[error("cgroup error: {0}")]
    Cgroup(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
