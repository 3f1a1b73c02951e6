//! Workspace layout and per-project write locking.
//!
//! Workspaces live under `<workspaces_root>/<project_id>/`. Worker artifact
//! writes take the shared side of a project's lock; checkpoint restore (and
//! project deletion) take the exclusive side, so a restore can never
//! interleave with a worker flush.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::RwLock;

use crate::types::Id;

// ---------------------------------------------------------------------------
// WorkspaceLayout
// ---------------------------------------------------------------------------

/// Maps project ids to workspace directories under a configured root.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, project_id: Id) -> PathBuf {
        self.root.join(project_id.to_string())
    }

    /// Create the workspace directory for a project.
    pub async fn create(&self, project_id: Id) -> std::io::Result<PathBuf> {
        let path = self.path_for(project_id);
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    /// Remove a project's workspace directory, if present.
    pub async fn remove(&self, project_id: Id) -> std::io::Result<()> {
        let path = self.path_for(project_id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkspaceLocks
// ---------------------------------------------------------------------------

/// Registry of per-project read/write locks.
///
/// Workers hold the read side while flushing artifacts (multiple tasks may
/// write concurrently, each confined to its own files); checkpoint restore
/// holds the write side and therefore excludes every worker write.
pub struct WorkspaceLocks {
    locks: Mutex<HashMap<Id, Arc<RwLock<()>>>>,
}

impl WorkspaceLocks {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_project(&self, project_id: Id) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().expect("workspace lock registry poisoned");
        locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Drop a project's lock entry (used on project delete).
    pub fn forget(&self, project_id: Id) {
        let mut locks = self.locks.lock().expect("workspace lock registry poisoned");
        locks.remove(&project_id);
    }
}

impl Default for WorkspaceLocks {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
