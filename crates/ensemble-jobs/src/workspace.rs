// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-job scratch directories.
//!
//! Every job owns `<root>/<job-id>/` from install until it reaches a terminal
//! status. [`Workspace`] is a guard: dropping it removes the directory, so a
//! job releases its workspace on every exit path, panics included.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use ensemble_cache::JobId;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Workspace I/O failure.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// Filesystem failure.
    #[error("workspace i/o error at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A file could not be serialized into the workspace.
    #[error("failed to serialize {file}: {source}")]
    Serialize {
        /// File name inside the workspace.
        file: String,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// Directory under which job workspaces are created.
#[derive(Debug, Clone)]
pub struct WorkspaceRoot {
    root: PathBuf,
}

impl WorkspaceRoot {
    /// Use `root`, creating it if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| WorkspaceError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    /// The root directory.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Create a fresh, empty workspace for `job`.
    pub fn create(&self, job: JobId) -> Result<Workspace, WorkspaceError> {
        let path = self.root.join(job.to_string());
        if path.exists() {
            remove_tree(&path)?;
        }
        fs::create_dir_all(&path).map_err(|source| WorkspaceError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(%job, path = %path.display(), "workspace created");
        Ok(Workspace { path })
    }

    /// Remove every workspace under the root.
    ///
    /// Only call this when no job is active: at startup, workspaces found on
    /// disk belong to jobs of a previous process and can never complete.
    pub fn sweep(&self) -> Result<usize, WorkspaceError> {
        let listing = match fs::read_dir(&self.root) {
            Ok(listing) => listing,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(WorkspaceError::Io {
                    path: self.root.clone(),
                    source,
                })
            }
        };
        let mut removed = 0;
        for entry in listing {
            let entry = entry.map_err(|source| WorkspaceError::Io {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_dir() {
                remove_tree(&path)?;
                removed += 1;
            }
        }
        info!(root = %self.root.display(), removed, "swept stale workspaces");
        Ok(removed)
    }
}

/// A job's scratch directory, removed on drop.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
}

impl Workspace {
    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize `value` as pretty JSON into `file` inside the workspace.
    pub fn write_json<T: Serialize + ?Sized>(
        &self,
        file: &str,
        value: &T,
    ) -> Result<PathBuf, WorkspaceError> {
        let bytes =
            serde_json::to_vec_pretty(value).map_err(|source| WorkspaceError::Serialize {
                file: file.to_owned(),
                source,
            })?;
        let path = self.path.join(file);
        fs::write(&path, bytes).map_err(|source| WorkspaceError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        match remove_tree(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "workspace released"),
            Err(err) => warn!(error = %err, "failed to release workspace"),
        }
    }
}

fn remove_tree(path: &Path) -> Result<(), WorkspaceError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn drop_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::open(dir.path().join("jobs")).unwrap();
        let ws = root.create(JobId::new()).unwrap();
        let path = ws.path().to_path_buf();
        ws.write_json("request.json", &serde_json::json!({"k": 1}))
            .unwrap();
        assert!(path.join("request.json").exists());
        drop(ws);
        assert!(!path.exists());
    }

    #[test]
    fn sweep_removes_leftovers_only_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::open(dir.path()).unwrap();
        fs::create_dir_all(dir.path().join("stale-a/nested")).unwrap();
        fs::create_dir_all(dir.path().join("stale-b")).unwrap();
        fs::write(dir.path().join("README"), b"keep").unwrap();
        assert_eq!(root.sweep().unwrap(), 2);
        assert!(dir.path().join("README").exists());
        assert_eq!(root.sweep().unwrap(), 0);
    }

    #[test]
    fn create_resets_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = WorkspaceRoot::open(dir.path()).unwrap();
        let job = JobId::new();
        let stale = dir.path().join(job.to_string());
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("old.json"), b"{}").unwrap();
        let ws = root.create(job).unwrap();
        assert!(!ws.path().join("old.json").exists());
    }
}
