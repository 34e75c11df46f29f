//! Per-request scratch directories

use crate::config::is_plain_file_name;
use crate::{Result, SnipboxError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{DirBuilder, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// An accepted request
///
/// The id is generated here, never taken from the caller.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    request_id: String,
    source_code: String,
}

impl ExecutionRequest {
    #[must_use]
    pub fn new(source_code: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().simple().to_string(),
            source_code: source_code.into(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub fn source_code(&self) -> &str {
        &self.source_code
    }
}

/// Creates and tracks workspaces under one root directory
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    active: Arc<Mutex<HashSet<String>>>,
}

impl WorkspaceManager {
    /// Create the manager, making the root directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&root)
            .map_err(|e| {
                SnipboxError::Workspace(format!(
                    "failed to create workspace root {}: {e}",
                    root.display()
                ))
            })?;

        Ok(Self {
            root,
            active: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Allocate a fresh directory for `request`
    ///
    /// The name combines the request id with an independent random token and
    /// is created exclusively, so an existing directory is never reused.
    pub fn create(&self, request: &ExecutionRequest) -> Result<Workspace> {
        let token = Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", request.id(), &token[..12]);
        let path = self.root.join(&id);

        DirBuilder::new().mode(0o700).create(&path).map_err(|e| {
            SnipboxError::Workspace(format!("failed to create {}: {e}", path.display()))
        })?;

        self.active.lock().insert(id.clone());
        tracing::debug!(workspace = %id, "workspace created");

        Ok(Workspace {
            id,
            root: path,
            source_file: None,
            destroyed: false,
            active: Arc::clone(&self.active),
        })
    }

    /// Number of workspaces not yet destroyed
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }
}

/// A scratch directory owned by exactly one request
///
/// Removed by [`Workspace::destroy`] or, failing that, on drop.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    root: PathBuf,
    source_file: Option<PathBuf>,
    destroyed: bool,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Workspace {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the source file, once written
    #[must_use]
    pub fn source_file(&self) -> Option<&Path> {
        self.source_file.as_deref()
    }

    /// Write a file directly inside the workspace
    ///
    /// `name` must be a single path component; anything that could resolve
    /// outside the root is rejected before touching the filesystem.
    pub fn write_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        if !is_plain_file_name(name) {
            return Err(SnipboxError::Workspace(format!(
                "refusing to write {name:?} outside workspace"
            )));
        }

        let path = self.root.join(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&path)
            .map_err(|e| {
                SnipboxError::Workspace(format!("failed to create {}: {e}", path.display()))
            })?;
        file.write_all(contents)?;
        file.sync_data()?;

        Ok(path)
    }

    /// Write the request's source code as the file the interpreter runs
    pub fn write_source(&mut self, name: &str, source: &str) -> Result<&Path> {
        let path = self.write_file(name, source.as_bytes())?;
        Ok(self.source_file.insert(path).as_path())
    }

    /// Remove the directory and everything in it
    ///
    /// Idempotent. Failures are logged and swallowed so that a broken cleanup
    /// never replaces the execution's real outcome.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.active.lock().remove(&self.id);

        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => tracing::debug!(workspace = %self.id, "workspace destroyed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(workspace = %self.id, path = ?self.root, error = %e, "failed to remove workspace");
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, WorkspaceManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path().join("ws")).unwrap();
        (dir, manager)
    }

    #[test]
    fn workspaces_are_unique_per_request() {
        let (_dir, manager) = manager();
        let request = ExecutionRequest::new("1");
        let a = manager.create(&request).unwrap();
        let b = manager.create(&request).unwrap();

        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with(request.id()));
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn request_ids_are_generated() {
        let a = ExecutionRequest::new("same");
        let b = ExecutionRequest::new("same");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.source_code(), "same");
    }

    #[test]
    fn destroy_is_idempotent() {
        let (_dir, manager) = manager();
        let mut ws = manager.create(&ExecutionRequest::new("x")).unwrap();
        ws.write_source("main.js", "console.log(1)").unwrap();
        let root = ws.root().to_path_buf();

        ws.destroy();
        assert!(!root.exists());
        ws.destroy();
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn drop_removes_directory() {
        let (_dir, manager) = manager();
        let root = {
            let ws = manager.create(&ExecutionRequest::new("x")).unwrap();
            ws.root().to_path_buf()
        };
        assert!(!root.exists());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn source_is_written_inside_root() {
        let (_dir, manager) = manager();
        let mut ws = manager.create(&ExecutionRequest::new("x")).unwrap();
        let path = ws.write_source("main.js", "console.log('hi')").unwrap().to_path_buf();

        assert_eq!(path.parent(), Some(ws.root()));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "console.log('hi')");
        assert_eq!(ws.source_file(), Some(path.as_path()));
    }

    #[test]
    fn traversal_names_are_rejected() {
        let (dir, manager) = manager();
        let ws = manager.create(&ExecutionRequest::new("x")).unwrap();

        for name in ["../escape.js", "/tmp/escape.js", "..", "", "a/b"] {
            assert!(ws.write_file(name, b"x").is_err(), "{name:?} accepted");
        }
        assert!(!dir.path().join("ws").join("escape.js").exists());
    }

    #[test]
    fn existing_file_is_not_overwritten() {
        let (_dir, manager) = manager();
        let ws = manager.create(&ExecutionRequest::new("x")).unwrap();
        ws.write_file("main.js", b"first").unwrap();
        assert!(ws.write_file("main.js", b"second").is_err());
    }

    #[test]
    fn unwritable_root_fails_create() {
        let err = WorkspaceManager::new("/proc/snipbox-cannot-exist").unwrap_err();
        assert!(matches!(err, SnipboxError::Workspace(_)));
    }
}
