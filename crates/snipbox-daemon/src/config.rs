//! Daemon configuration

use serde::{Deserialize, Serialize};
use snipbox_core::{SandboxConfig, SnipboxError};
use std::net::{AddrParseError, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Env var overriding the listen address
pub const LISTEN_ENV: &str = "SNIPBOX_LISTEN";

/// Env var naming the single origin allowed by CORS
pub const ORIGIN_ENV: &str = "FRONTEND_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid {LISTEN_ENV} {value:?}: {source}")]
    Listen {
        value: String,
        source: AddrParseError,
    },

    #[error(transparent)]
    Sandbox(#[from] SnipboxError),
}

/// Configuration for the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the HTTP server binds
    pub listen: SocketAddr,

    /// Origin allowed to call the API from a browser
    pub allowed_origin: Option<String>,

    /// Built editor assets served for every unmatched path
    pub static_dir: Option<PathBuf>,

    /// Execution engine configuration
    pub sandbox: SandboxConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
            allowed_origin: None,
            static_dir: None,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Read `path` if given, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply overrides looked up through `get`
    pub fn apply_overrides(
        &mut self,
        get: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = get(LISTEN_ENV) {
            self.listen = value
                .parse()
                .map_err(|source| ConfigError::Listen { value, source })?;
        }
        if let Some(origin) = get(ORIGIN_ENV).filter(|o| !o.is_empty()) {
            self.allowed_origin = Some(origin);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sandbox.validate()?;
        Ok(())
    }

    /// Largest request body accepted before JSON parsing
    ///
    /// Leaves room for JSON escaping; the exact source bound is enforced
    /// by the coordinator.
    #[must_use]
    pub const fn body_limit(&self) -> usize {
        self.sandbox.max_source_bytes.saturating_mul(4).saturating_add(1024)
    }
}
