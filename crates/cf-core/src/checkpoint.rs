//! Workspace snapshots via libgit2.
//!
//! Each project workspace is a git working tree; a checkpoint is a named
//! commit in its object store plus a row in the store. `restore` rewrites
//! the working tree and is mutually exclusive with worker writes (the
//! caller holds the workspace's exclusive lock) and forbidden while a
//! session is live.

use std::path::Path;
use std::sync::Arc;

use crate::store::{Store, StoreError};
use crate::types::{Checkpoint, Id};
use crate::workspace::WorkspaceLocks;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("git error: {0}")]
    Git(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("conflict: {0}")]
    Conflict(String),
}

#[cfg(feature = "libgit2")]
impl From<git2::Error> for CheckpointError {
    fn from(e: git2::Error) -> Self {
        CheckpointError::Git(e.message().to_string())
    }
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

// ---------------------------------------------------------------------------
// Git operations
// ---------------------------------------------------------------------------

/// Stateless git operations against a workspace working tree. Opens the
/// repository fresh per call; cheap for local repos and avoids stale-index
/// surprises.
#[cfg(feature = "libgit2")]
pub struct WorkspaceGit;

#[cfg(feature = "libgit2")]
impl WorkspaceGit {
    fn open(workdir: &Path) -> Result<git2::Repository> {
        git2::Repository::open(workdir).map_err(Into::into)
    }

    fn signature() -> Result<git2::Signature<'static>> {
        git2::Signature::now("codeframe", "codeframe@localhost").map_err(Into::into)
    }

    /// Initialize a repository in the workspace if none exists, creating an
    /// empty initial commit so later snapshots always have a parent.
    pub fn ensure_repo(workdir: &Path) -> Result<String> {
        if let Ok(repo) = git2::Repository::open(workdir) {
            if let Ok(head) = repo.head() {
                if let Some(oid) = head.target() {
                    return Ok(oid.to_string());
                }
            }
        }
        let repo = git2::Repository::init(workdir)?;
        let sig = Self::signature()?;
        let tree_id = {
            let mut index = repo.index()?;
            index.write_tree()?
        };
        let tree = repo.find_tree(tree_id)?;
        let oid = repo.commit(Some("HEAD"), &sig, &sig, "workspace initialized", &tree, &[])?;
        Ok(oid.to_string())
    }

    /// Stage everything and commit, returning the new commit SHA. A clean
    /// tree returns the current HEAD instead of an empty commit.
    pub fn snapshot(workdir: &Path, message: &str) -> Result<String> {
        let repo = Self::open(workdir)?;

        let mut status_opts = git2::StatusOptions::new();
        status_opts.include_untracked(true).recurse_untracked_dirs(true);
        let dirty = !repo.statuses(Some(&mut status_opts))?.is_empty();

        let head = repo.head()?;
        let head_commit = head.peel_to_commit()?;
        if !dirty {
            return Ok(head_commit.id().to_string());
        }

        let mut index = repo.index()?;
        index.add_all(["*"], git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature()?;
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&head_commit])?;
        Ok(oid.to_string())
    }

    /// Unified diff text between a checkpoint SHA and the current working
    /// tree (including untracked files).
    pub fn diff_against(workdir: &Path, sha: &str) -> Result<String> {
        let repo = Self::open(workdir)?;
        let commit = repo
            .revparse_single(sha)?
            .peel_to_commit()
            .map_err(CheckpointError::from)?;
        let tree = commit.tree()?;

        let mut opts = git2::DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff = repo.diff_tree_to_workdir_with_index(Some(&tree), Some(&mut opts))?;

        let mut out = String::new();
        diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
            match line.origin() {
                '+' | '-' | ' ' => out.push(line.origin()),
                _ => {}
            }
            out.push_str(std::str::from_utf8(line.content()).unwrap_or(""));
            true
        })?;
        Ok(out)
    }

    /// Hard-reset the working tree to a checkpoint SHA. Destructive.
    pub fn restore(workdir: &Path, sha: &str) -> Result<()> {
        let repo = Self::open(workdir)?;
        let object = repo.revparse_single(sha)?;
        let mut builder = git2::build::CheckoutBuilder::new();
        builder.force().remove_untracked(true);
        repo.reset(&object, git2::ResetType::Hard, Some(&mut builder))?;
        Ok(())
    }

    /// Current HEAD SHA, if the workspace has one.
    pub fn current_commit(workdir: &Path) -> Result<Option<String>> {
        let repo = Self::open(workdir)?;
        let result = match repo.head() {
            Ok(head) => Ok(head.target().map(|oid| oid.to_string())),
            Err(_) => Ok(None),
        };
        result
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Named workspace snapshots: create, list, diff, restore.
#[cfg(feature = "libgit2")]
pub struct CheckpointManager {
    store: Arc<Store>,
    locks: Arc<WorkspaceLocks>,
}

#[cfg(feature = "libgit2")]
impl CheckpointManager {
    pub fn new(store: Arc<Store>, locks: Arc<WorkspaceLocks>) -> Self {
        Self { store, locks }
    }

    /// Snapshot the workspace and persist the checkpoint row. Name
    /// collisions surface as `Conflict` from the store.
    pub async fn create(
        &self,
        project_id: Id,
        name: &str,
        description: Option<String>,
    ) -> Result<Checkpoint> {
        let project = self.store.get_project(project_id).await?;
        let workdir = std::path::PathBuf::from(&project.workspace_path);
        let message = format!("checkpoint: {}", name);
        let sha = tokio::task::spawn_blocking(move || WorkspaceGit::snapshot(&workdir, &message))
            .await
            .map_err(|e| CheckpointError::Git(e.to_string()))??;
        self.store.set_project_commit(project_id, &sha).await?;
        let checkpoint = self
            .store
            .create_checkpoint(project_id, name, description, &sha)
            .await?;
        tracing::info!(project_id, checkpoint = %checkpoint.name, sha = %checkpoint.git_sha, "checkpoint created");
        Ok(checkpoint)
    }

    pub async fn list(&self, project_id: Id) -> Result<Vec<Checkpoint>> {
        self.store.list_checkpoints(project_id).await.map_err(Into::into)
    }

    pub async fn diff(&self, project_id: Id, checkpoint_id: Id) -> Result<String> {
        let project = self.store.get_project(project_id).await?;
        let checkpoint = self.store.get_checkpoint(checkpoint_id).await?;
        if checkpoint.project_id != project_id {
            return Err(CheckpointError::Store(StoreError::NotFound(format!(
                "checkpoint {}",
                checkpoint_id
            ))));
        }
        let workdir = std::path::PathBuf::from(&project.workspace_path);
        let sha = checkpoint.git_sha;
        tokio::task::spawn_blocking(move || WorkspaceGit::diff_against(&workdir, &sha))
            .await
            .map_err(|e| CheckpointError::Git(e.to_string()))?
    }

    /// Restore the working tree to a checkpoint. Fails fast with `Conflict`
    /// while the project has a live session, and takes the workspace's
    /// exclusive lock so no worker write can interleave.
    pub async fn restore(&self, project_id: Id, checkpoint_id: Id) -> Result<()> {
        if let Some(session) = self.store.live_session(project_id).await? {
            return Err(CheckpointError::Conflict(format!(
                "session {} is live; stop it before restoring",
                session.id
            )));
        }
        let project = self.store.get_project(project_id).await?;
        let checkpoint = self.store.get_checkpoint(checkpoint_id).await?;
        if checkpoint.project_id != project_id {
            return Err(CheckpointError::Store(StoreError::NotFound(format!(
                "checkpoint {}",
                checkpoint_id
            ))));
        }

        let lock = self.locks.for_project(project_id);
        let _exclusive = lock.write().await;

        let workdir = std::path::PathBuf::from(&project.workspace_path);
        let sha = checkpoint.git_sha.clone();
        tokio::task::spawn_blocking(move || WorkspaceGit::restore(&workdir, &sha))
            .await
            .map_err(|e| CheckpointError::Git(e.to_string()))??;
        self.store
            .set_project_commit(project_id, &checkpoint.git_sha)
            .await?;
        tracing::info!(project_id, checkpoint = %checkpoint.name, "workspace restored");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
