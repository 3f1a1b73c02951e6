//! Command seam between the HTTP surface and the per-project coordinators.
//!
//! The router only knows this trait; the agent engine implements it and the
//! daemon injects the implementation at startup. Queries bypass the seam
//! and read the store directly — commands are the only calls that mutate
//! orchestration state.

use async_trait::async_trait;

use cf_core::types::{Id, Project, ProjectPhase, SessionRecord, SourceType};

use crate::api_error::ApiError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Wrong phase, stale status, or a competing session.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// Decomposition contained a dependency cycle.
    #[error("cyclic decomposition: {0}")]
    Cyclic(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<cf_core::store::StoreError> for CommandError {
    fn from(e: cf_core::store::StoreError) -> Self {
        use cf_core::store::StoreError;
        match e {
            StoreError::NotFound(msg) => CommandError::NotFound(msg),
            StoreError::Conflict(msg) => CommandError::Conflict(msg),
            StoreError::Persistence(msg) => CommandError::Internal(msg),
        }
    }
}

impl From<CommandError> for ApiError {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Validation(msg) => ApiError::validation(msg),
            CommandError::NotFound(msg) => ApiError::NotFound(msg),
            CommandError::Conflict(msg) => ApiError::Conflict(msg),
            CommandError::Forbidden(msg) => ApiError::Forbidden(msg),
            CommandError::Cyclic(msg) => ApiError::Cyclic {
                message: msg,
                details: None,
            },
            CommandError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

// ---------------------------------------------------------------------------
// Command payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CreateProject {
    pub name: String,
    pub description: String,
    pub source_type: SourceType,
    pub source_location: Option<String>,
    pub source_branch: Option<String>,
}

/// Result of `tasks.approve`.
#[derive(Debug, Clone)]
pub struct ApprovalOutcome {
    pub phase: ProjectPhase,
    pub approved_count: usize,
    pub excluded_count: usize,
    /// Set when the project was already approved; no state changed.
    pub already_approved: bool,
}

// ---------------------------------------------------------------------------
// Orchestrator trait
// ---------------------------------------------------------------------------

/// Commands the API exposes against a project's lifecycle. Accepted phases
/// per command are enforced by the implementation.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Create the project row and its workspace. Hosted deployments refuse
    /// `source_type=local_path`.
    async fn create_project(&self, req: CreateProject) -> Result<Project, CommandError>;

    /// Delete a project, its rows, and its workspace. Refused while a
    /// session is live.
    async fn delete_project(&self, project_id: Id) -> Result<(), CommandError>;

    /// Enter the discovery loop and ask the first question.
    /// Phase: `discovery` with discovery not yet started.
    async fn start_discovery(&self, project_id: Id) -> Result<(), CommandError>;

    /// Answer the pending discovery question; asks the next one or
    /// concludes and generates the PRD. Phase: `discovery`.
    async fn answer_discovery(&self, project_id: Id, text: String) -> Result<(), CommandError>;

    /// Decompose the PRD into tasks in the background. Phase: `planning`.
    async fn generate_tasks(&self, project_id: Id) -> Result<(), CommandError>;

    /// Approve the decomposition, excluding the given tasks, and ignite the
    /// execution loop. Phase: `planning`; idempotent once `active`.
    async fn approve_tasks(
        &self,
        project_id: Id,
        approved: bool,
        excluded_task_ids: Vec<Id>,
    ) -> Result<ApprovalOutcome, CommandError>;

    /// Record guidance on a blocked task and return it to `ready`.
    /// Phase: `active`.
    async fn unblock_task(
        &self,
        project_id: Id,
        task_id: Id,
        guidance: String,
    ) -> Result<(), CommandError>;

    async fn start_session(&self, project_id: Id) -> Result<SessionRecord, CommandError>;
    async fn pause_session(&self, project_id: Id) -> Result<(), CommandError>;
    async fn resume_session(&self, project_id: Id) -> Result<(), CommandError>;
    async fn stop_session(&self, project_id: Id) -> Result<(), CommandError>;
}
