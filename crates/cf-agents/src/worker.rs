//! Role-specialized worker agents.
//!
//! One trait, four implementations. A worker executes exactly one task:
//! build the role prompt, call the completion provider (the suspension
//! point, cancellable), apply the returned artifacts atomically, and report
//! progress frames around the call. Workers share no mutable state; every
//! collaborator arrives through the factory.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use cf_bridge::event_bus::ProjectBus;
use cf_bridge::protocol::{EventKind, WorkerStage};
use cf_core::store::NewFinding;
use cf_core::types::{AgentRole, GateKind, Id, Task};
use cf_core::workspace::WorkspaceLocks;
use cf_harness::cancel::CancelToken;
use cf_harness::provider::{
    ChatMessage, CompletionError, CompletionProvider, CompletionRequest,
};

use crate::artifacts;
use crate::prompts;

// ---------------------------------------------------------------------------
// Task context & outcome
// ---------------------------------------------------------------------------

/// Everything a worker needs to execute one task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: Task,
    pub project_id: Id,
    pub workspace: PathBuf,
    /// Operator guidance recorded by `unblock`, oldest first.
    pub guidance: Vec<String>,
    pub model: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Completed,
    Failed,
}

/// Result of one task execution.
#[derive(Debug)]
pub struct Outcome {
    pub status: OutcomeStatus,
    /// Workspace-relative paths written.
    pub artifacts: Vec<String>,
    /// Findings produced by the review role.
    pub findings: Vec<NewFinding>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_cents: i64,
    pub error: Option<String>,
    pub retryable: bool,
    /// Set when the worker signalled it needs operator input.
    pub needs_human: Option<String>,
    /// Set when the execution was cancelled (pause/stop/timeout).
    pub cancelled: bool,
}

impl Outcome {
    fn completed(artifacts: Vec<String>, findings: Vec<NewFinding>, usage: Usage) -> Self {
        Self {
            status: OutcomeStatus::Completed,
            artifacts,
            findings,
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            cost_cents: usage.cost_cents,
            error: None,
            retryable: false,
            needs_human: None,
            cancelled: false,
        }
    }

    fn failed(error: impl Into<String>, retryable: bool, usage: Usage) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            artifacts: Vec::new(),
            findings: Vec::new(),
            tokens_in: usage.tokens_in,
            tokens_out: usage.tokens_out,
            cost_cents: usage.cost_cents,
            error: Some(error.into()),
            retryable,
            needs_human: None,
            cancelled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    tokens_in: u64,
    tokens_out: u64,
    cost_cents: i64,
}

// ---------------------------------------------------------------------------
// WorkerAgent trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WorkerAgent: Send + Sync {
    fn role(&self) -> AgentRole;

    /// Execute one task against the workspace. Must observe `cancel` and
    /// never leave partially-applied artifacts behind.
    async fn execute_task(&self, agent_id: Id, ctx: &TaskContext, cancel: &CancelToken) -> Outcome;
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

/// Collaborators common to every worker role.
#[derive(Clone)]
pub struct WorkerCore {
    pub provider: Arc<dyn CompletionProvider>,
    pub bus: Arc<ProjectBus>,
    pub locks: Arc<WorkspaceLocks>,
}

impl WorkerCore {
    fn progress(&self, ctx: &TaskContext, agent_id: Id, stage: WorkerStage) {
        self.bus.publish(
            ctx.project_id,
            EventKind::WorkerProgress {
                task_id: ctx.task.id,
                agent_id,
                stage,
            },
        );
    }

    /// Run the completion call with cancellation. Returns the raw reply
    /// text plus usage, or a terminal `Outcome` on failure.
    async fn run_completion(
        &self,
        role: AgentRole,
        ctx: &TaskContext,
        agent_id: Id,
        cancel: &CancelToken,
    ) -> Result<(String, Usage), Outcome> {
        let workspace_files = ctx.task.artifacts.clone();
        let request = CompletionRequest {
            messages: vec![
                ChatMessage::system(prompts::system_prompt(role)),
                ChatMessage::user(prompts::task_prompt(
                    role,
                    &ctx.task,
                    &ctx.guidance,
                    &workspace_files,
                )),
            ],
            model: ctx.model.clone(),
            max_tokens: ctx.max_tokens,
        };

        self.progress(ctx, agent_id, WorkerStage::PromptSent);

        let result = tokio::select! {
            result = self.provider.complete(request, cancel) => result,
            _ = cancel.cancelled() => Err(CompletionError::Cancelled),
        };

        match result {
            Ok(completion) => {
                self.progress(ctx, agent_id, WorkerStage::CompletionReceived);
                let usage = Usage {
                    tokens_in: completion.tokens_in,
                    tokens_out: completion.tokens_out,
                    cost_cents: completion.cost_cents,
                };
                Ok((completion.text, usage))
            }
            Err(CompletionError::Cancelled) => {
                let mut outcome = Outcome::failed("cancelled", false, Usage::default());
                outcome.cancelled = true;
                Err(outcome)
            }
            Err(e) => {
                let retryable = e.is_retryable();
                tracing::warn!(
                    task_id = ctx.task.id,
                    role = %role,
                    error = %e,
                    retryable,
                    "completion call failed"
                );
                Err(Outcome::failed(e.to_string(), retryable, Usage::default()))
            }
        }
    }

    /// Common body for the coding roles (backend, frontend, test): parse
    /// the artifact list and flush it under the workspace's shared lock.
    async fn execute_coding_task(
        &self,
        role: AgentRole,
        agent_id: Id,
        ctx: &TaskContext,
        cancel: &CancelToken,
    ) -> Outcome {
        let (text, usage) = match self.run_completion(role, ctx, agent_id, cancel).await {
            Ok(ok) => ok,
            Err(outcome) => return outcome,
        };

        if let Some(reason) = artifacts::needs_human_reason(&text) {
            let mut outcome = Outcome::failed("needs human input", false, usage);
            outcome.needs_human = Some(reason);
            return outcome;
        }

        let files = match artifacts::parse_artifacts(&text) {
            Ok(files) => files,
            // Malformed model output: worth another attempt.
            Err(e) => return Outcome::failed(e.to_string(), true, usage),
        };

        if cancel.is_cancelled() {
            let mut outcome = Outcome::failed("cancelled", false, usage);
            outcome.cancelled = true;
            return outcome;
        }

        let lock = self.locks.for_project(ctx.project_id);
        let _shared = lock.read().await;
        match artifacts::apply_artifacts(&ctx.workspace, &files).await {
            Ok(written) => {
                self.progress(ctx, agent_id, WorkerStage::ArtifactsApplied);
                Outcome::completed(written, Vec::new(), usage)
            }
            // Anything that failed mid-flush was rolled back; the task
            // fails hard rather than retrying into a dirty state.
            Err(e) => Outcome::failed(e.to_string(), false, usage),
        }
    }
}

// ---------------------------------------------------------------------------
// Role implementations
// ---------------------------------------------------------------------------

pub struct BackendWorker {
    core: WorkerCore,
}

#[async_trait]
impl WorkerAgent for BackendWorker {
    fn role(&self) -> AgentRole {
        AgentRole::Backend
    }

    async fn execute_task(&self, agent_id: Id, ctx: &TaskContext, cancel: &CancelToken) -> Outcome {
        self.core
            .execute_coding_task(AgentRole::Backend, agent_id, ctx, cancel)
            .await
    }
}

pub struct FrontendWorker {
    core: WorkerCore,
}

#[async_trait]
impl WorkerAgent for FrontendWorker {
    fn role(&self) -> AgentRole {
        AgentRole::Frontend
    }

    async fn execute_task(&self, agent_id: Id, ctx: &TaskContext, cancel: &CancelToken) -> Outcome {
        self.core
            .execute_coding_task(AgentRole::Frontend, agent_id, ctx, cancel)
            .await
    }
}

pub struct TestWorker {
    core: WorkerCore,
}

#[async_trait]
impl WorkerAgent for TestWorker {
    fn role(&self) -> AgentRole {
        AgentRole::Test
    }

    async fn execute_task(&self, agent_id: Id, ctx: &TaskContext, cancel: &CancelToken) -> Outcome {
        self.core
            .execute_coding_task(AgentRole::Test, agent_id, ctx, cancel)
            .await
    }
}

/// The review role produces findings instead of files.
pub struct ReviewWorker {
    core: WorkerCore,
}

#[async_trait]
impl WorkerAgent for ReviewWorker {
    fn role(&self) -> AgentRole {
        AgentRole::Review
    }

    async fn execute_task(&self, agent_id: Id, ctx: &TaskContext, cancel: &CancelToken) -> Outcome {
        let (text, usage) = match self
            .core
            .run_completion(AgentRole::Review, ctx, agent_id, cancel)
            .await
        {
            Ok(ok) => ok,
            Err(outcome) => return outcome,
        };

        if let Some(reason) = artifacts::needs_human_reason(&text) {
            let mut outcome = Outcome::failed("needs human input", false, usage);
            outcome.needs_human = Some(reason);
            return outcome;
        }

        match artifacts::parse_findings(&text) {
            Ok(parsed) => {
                let findings = parsed
                    .into_iter()
                    .map(|f| f.into_new_finding(GateKind::Review))
                    .collect();
                Outcome::completed(Vec::new(), findings, usage)
            }
            Err(e) => Outcome::failed(e.to_string(), true, usage),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerFactory
// ---------------------------------------------------------------------------

/// Construction seam for workers. Tests inject their own factory so mocks
/// replace the correct role deterministically.
pub trait WorkerFactory: Send + Sync {
    fn create(&self, role: AgentRole) -> Arc<dyn WorkerAgent>;
}

pub struct DefaultWorkerFactory {
    core: WorkerCore,
}

impl DefaultWorkerFactory {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        bus: Arc<ProjectBus>,
        locks: Arc<WorkspaceLocks>,
    ) -> Self {
        Self {
            core: WorkerCore {
                provider,
                bus,
                locks,
            },
        }
    }
}

impl WorkerFactory for DefaultWorkerFactory {
    fn create(&self, role: AgentRole) -> Arc<dyn WorkerAgent> {
        let core = self.core.clone();
        match role {
            AgentRole::Frontend => Arc::new(FrontendWorker { core }),
            AgentRole::Test => Arc::new(TestWorker { core }),
            AgentRole::Review => Arc::new(ReviewWorker { core }),
            AgentRole::Lead | AgentRole::Backend => Arc::new(BackendWorker { core }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::types::{QualityGateStatus, Severity, TaskStatus, DEFAULT_MAX_ATTEMPTS};
    use cf_harness::provider::{ScriptStep, ScriptedProvider};
    use chrono::Utc;

    fn context(workspace: PathBuf) -> TaskContext {
        let now = Utc::now();
        TaskContext {
            task: Task {
                id: 1,
                project_id: 1,
                task_number: "1".into(),
                title: "GET /hello endpoint".into(),
                description: "returns a greeting".into(),
                status: TaskStatus::InProgress,
                depends_on: vec![],
                assigned_role: None,
                assigned_agent_id: Some(1),
                attempt_count: 1,
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                quality_gate_status: QualityGateStatus::NotRun,
                artifacts: vec![],
                created_at: now,
                updated_at: now,
                started_at: Some(now),
                completed_at: None,
            },
            project_id: 1,
            workspace,
            guidance: vec![],
            model: "m-large".into(),
            max_tokens: 4096,
        }
    }

    fn factory(provider: ScriptedProvider) -> (DefaultWorkerFactory, Arc<ProjectBus>) {
        let bus = Arc::new(ProjectBus::new(64, 3));
        let factory = DefaultWorkerFactory::new(
            Arc::new(provider),
            bus.clone(),
            Arc::new(WorkspaceLocks::new()),
        );
        (factory, bus)
    }

    #[tokio::test]
    async fn backend_worker_applies_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![ScriptStep::reply(
            r#"[{"path": "src/hello.rs", "content": "pub fn hello() {}"}]"#,
        )]);
        let (factory, bus) = factory(provider);
        let rx = bus.subscribe(1);
        let worker = factory.create(AgentRole::Backend);

        let outcome = worker
            .execute_task(1, &context(dir.path().to_path_buf()), &CancelToken::new())
            .await;

        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert_eq!(outcome.artifacts, vec!["src/hello.rs".to_string()]);
        assert!(dir.path().join("src/hello.rs").exists());
        assert!(outcome.tokens_in > 0);

        let stages: Vec<WorkerStage> = rx
            .try_iter()
            .filter_map(|f| match f.kind {
                EventKind::WorkerProgress { stage, .. } => Some(stage),
                _ => None,
            })
            .collect();
        assert_eq!(
            stages,
            vec![
                WorkerStage::PromptSent,
                WorkerStage::CompletionReceived,
                WorkerStage::ArtifactsApplied
            ]
        );
    }

    #[tokio::test]
    async fn provider_timeout_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![ScriptStep::Fail(CompletionError::Timeout)]);
        let (factory, _bus) = factory(provider);
        let worker = factory.create(AgentRole::Backend);
        let outcome = worker
            .execute_task(1, &context(dir.path().to_path_buf()), &CancelToken::new())
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.retryable);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![ScriptStep::Fail(CompletionError::Auth(
            "bad key".into(),
        ))]);
        let (factory, _bus) = factory(provider);
        let worker = factory.create(AgentRole::Backend);
        let outcome = worker
            .execute_task(1, &context(dir.path().to_path_buf()), &CancelToken::new())
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(!outcome.retryable);
    }

    #[tokio::test]
    async fn needs_human_marker_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![ScriptStep::reply(
            "NEEDS_HUMAN: which port should the server bind?",
        )]);
        let (factory, _bus) = factory(provider);
        let worker = factory.create(AgentRole::Backend);
        let outcome = worker
            .execute_task(1, &context(dir.path().to_path_buf()), &CancelToken::new())
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(
            outcome.needs_human.as_deref(),
            Some("which port should the server bind?")
        );
    }

    #[tokio::test]
    async fn review_worker_returns_findings_not_files() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![ScriptStep::reply(
            r#"[{"severity": "high", "message": "missing error handling", "file": "src/hello.rs"}]"#,
        )]);
        let (factory, _bus) = factory(provider);
        let worker = factory.create(AgentRole::Review);
        let outcome = worker
            .execute_task(1, &context(dir.path().to_path_buf()), &CancelToken::new())
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Completed);
        assert!(outcome.artifacts.is_empty());
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.findings[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn cancellation_aborts_before_artifact_write() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![ScriptStep::Hang]);
        let (factory, _bus) = factory(provider);
        let worker = factory.create(AgentRole::Backend);

        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let outcome = worker
            .execute_task(1, &context(dir.path().to_path_buf()), &cancel)
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.cancelled);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn malformed_output_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new(vec![ScriptStep::reply("sorry, I had trouble")]);
        let (factory, _bus) = factory(provider);
        let worker = factory.create(AgentRole::Frontend);
        let outcome = worker
            .execute_task(1, &context(dir.path().to_path_buf()), &CancelToken::new())
            .await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert!(outcome.retryable);
    }
}
