//! The hub: one coordinator per project, constructed on demand, all
//! sharing the store, bus, pool, worker factory, and gates. Implements the
//! bridge's [`Orchestrator`] command seam, so the HTTP surface never links
//! against this crate's internals directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use cf_bridge::event_bus::ProjectBus;
use cf_bridge::orchestrator::{ApprovalOutcome, CommandError, CreateProject, Orchestrator};
use cf_bridge::protocol::EventKind;
use cf_core::config::{Config, DeploymentMode};
use cf_core::store::{NewProject, Store};
use cf_core::types::{Id, Project, ProjectPhase, SessionRecord, SessionStatus, SourceType};
use cf_core::workspace::{WorkspaceLayout, WorkspaceLocks};
use cf_harness::provider::CompletionProvider;

use crate::coordinator::{SessionCoordinator, SessionTuning};
use crate::discovery::{DiscoveryEngine, DiscoveryPolicy};
use crate::decompose;
use crate::gates::QualityGate;
use crate::pool::AgentPool;
use crate::worker::WorkerFactory;

pub struct CoordinatorHub {
    store: Arc<Store>,
    bus: Arc<ProjectBus>,
    provider: Arc<dyn CompletionProvider>,
    pool: Arc<AgentPool>,
    factory: Arc<dyn WorkerFactory>,
    gates: Arc<QualityGate>,
    discovery: DiscoveryEngine,
    layout: WorkspaceLayout,
    locks: Arc<WorkspaceLocks>,
    config: Config,
    coordinators: Mutex<HashMap<Id, Arc<SessionCoordinator>>>,
}

impl CoordinatorHub {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        bus: Arc<ProjectBus>,
        provider: Arc<dyn CompletionProvider>,
        factory: Arc<dyn WorkerFactory>,
        gates: Arc<QualityGate>,
        locks: Arc<WorkspaceLocks>,
        config: Config,
    ) -> Self {
        let pool = Arc::new(AgentPool::new(store.clone(), config.max_concurrent_agents));
        let discovery = DiscoveryEngine::new(
            store.clone(),
            bus.clone(),
            provider.clone(),
            DiscoveryPolicy {
                max_questions: config.max_discovery_questions,
            },
            config.default_model.clone(),
            config.max_completion_tokens,
        );
        let layout = WorkspaceLayout::new(config.workspaces_root.clone());
        Self {
            store,
            bus,
            provider,
            pool,
            factory,
            gates,
            discovery,
            layout,
            locks,
            config,
            coordinators: Mutex::new(HashMap::new()),
        }
    }

    fn coordinator_for(&self, project: &Project) -> Arc<SessionCoordinator> {
        let mut coordinators = self.coordinators.lock().expect("hub lock poisoned");
        coordinators
            .entry(project.id)
            .or_insert_with(|| {
                Arc::new(SessionCoordinator::new(
                    project.id,
                    project.workspace_path.clone().into(),
                    self.store.clone(),
                    self.bus.clone(),
                    self.pool.clone(),
                    self.factory.clone(),
                    self.gates.clone(),
                    SessionTuning::from_config(&self.config),
                ))
            })
            .clone()
    }

    fn drop_coordinator(&self, project_id: Id) {
        self.coordinators
            .lock()
            .expect("hub lock poisoned")
            .remove(&project_id);
    }

    /// Cancel every running session loop (daemon shutdown).
    pub async fn shutdown(&self) {
        let coordinators: Vec<Arc<SessionCoordinator>> = {
            let map = self.coordinators.lock().expect("hub lock poisoned");
            map.values().cloned().collect()
        };
        for coordinator in coordinators {
            if coordinator.is_running() {
                let _ = coordinator.stop().await;
            }
        }
    }
}

#[async_trait]
impl Orchestrator for CoordinatorHub {
    async fn create_project(&self, req: CreateProject) -> Result<Project, CommandError> {
        if req.name.trim().is_empty() {
            return Err(CommandError::Validation("name must not be empty".into()));
        }
        if req.source_type != SourceType::Empty && req.source_location.is_none() {
            return Err(CommandError::Validation(
                "source_location is required for this source_type".into(),
            ));
        }
        if self.config.deployment_mode == DeploymentMode::Hosted
            && req.source_type == SourceType::LocalPath
        {
            return Err(CommandError::Forbidden(
                "local_path sources are not allowed in hosted mode".into(),
            ));
        }

        // The workspace directory is named after the row id, so the row is
        // created against a unique staging path first.
        let staging = self
            .layout
            .root()
            .join(format!(".staging-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)));
        let project = self
            .store
            .create_project(NewProject {
                name: req.name,
                description: req.description,
                source_type: req.source_type,
                source_location: req.source_location,
                source_branch: req.source_branch,
                workspace_path: staging.to_string_lossy().to_string(),
            })
            .await?;

        let workspace = self
            .layout
            .create(project.id)
            .await
            .map_err(|e| CommandError::Internal(format!("workspace create failed: {}", e)))?;
        self.store
            .set_project_workspace(project.id, &workspace.to_string_lossy())
            .await?;

        #[cfg(feature = "libgit2")]
        {
            let workdir = workspace.clone();
            let sha = tokio::task::spawn_blocking(move || {
                cf_core::checkpoint::WorkspaceGit::ensure_repo(&workdir)
            })
            .await
            .map_err(|e| CommandError::Internal(e.to_string()))?
            .map_err(|e| CommandError::Internal(format!("git init failed: {}", e)))?;
            self.store.set_project_commit(project.id, &sha).await?;
        }

        let project = self.store.get_project(project.id).await?;
        tracing::info!(project_id = project.id, name = %project.name, "project created");
        Ok(project)
    }

    async fn delete_project(&self, project_id: Id) -> Result<(), CommandError> {
        if let Some(session) = self.store.live_session(project_id).await? {
            return Err(CommandError::Conflict(format!(
                "session {} is live; stop it before deleting",
                session.id
            )));
        }
        // take the exclusive workspace lock so no straggling write interleaves
        let lock = self.locks.for_project(project_id);
        let _exclusive = lock.write().await;

        self.drop_coordinator(project_id);
        self.store.delete_project(project_id).await?;
        self.layout
            .remove(project_id)
            .await
            .map_err(|e| CommandError::Internal(format!("workspace remove failed: {}", e)))?;
        self.locks.forget(project_id);
        tracing::info!(project_id, "project deleted");
        Ok(())
    }

    async fn start_discovery(&self, project_id: Id) -> Result<(), CommandError> {
        self.discovery.start(project_id).await
    }

    async fn answer_discovery(&self, project_id: Id, text: String) -> Result<(), CommandError> {
        if text.trim().is_empty() {
            return Err(CommandError::Validation("answer must not be empty".into()));
        }
        self.discovery.answer(project_id, &text).await
    }

    async fn generate_tasks(&self, project_id: Id) -> Result<(), CommandError> {
        // validate synchronously so the client gets a meaningful status,
        // then decompose in the background
        let project = self.store.get_project(project_id).await?;
        if project.phase != ProjectPhase::Planning {
            return Err(CommandError::Conflict(format!(
                "project is in phase {}, not planning",
                project.phase
            )));
        }
        let discovery = self.store.discovery_state(project_id).await?;
        if discovery.prd_status != cf_core::types::PrdStatus::Available {
            return Err(CommandError::Conflict("PRD is not available".into()));
        }
        if !self.store.list_tasks(project_id).await?.is_empty() {
            return Err(CommandError::Conflict(
                "project already has a task decomposition".into(),
            ));
        }

        let store = self.store.clone();
        let bus = self.bus.clone();
        let provider = self.provider.clone();
        let model = self.config.default_model.clone();
        let max_tokens = self.config.max_completion_tokens;
        tokio::spawn(async move {
            if let Err(e) =
                decompose::generate_and_persist(&store, &bus, &provider, project_id, &model, max_tokens)
                    .await
            {
                tracing::warn!(project_id, error = %e, "background decomposition failed");
                let _ = store
                    .append_event(
                        project_id,
                        None,
                        "tasks.decomposition_failed",
                        serde_json::json!({ "error": e.to_string() }),
                    )
                    .await;
            }
        });
        Ok(())
    }

    async fn approve_tasks(
        &self,
        project_id: Id,
        approved: bool,
        excluded_task_ids: Vec<Id>,
    ) -> Result<ApprovalOutcome, CommandError> {
        let project = self.store.get_project(project_id).await?;

        match project.phase {
            ProjectPhase::Planning => {}
            ProjectPhase::Active => {
                // idempotent re-approval; rework re-runs the readiness pass
                let counts = self.store.task_counts(project_id).await?;
                if counts.pending == 0 {
                    return Ok(ApprovalOutcome {
                        phase: ProjectPhase::Active,
                        approved_count: 0,
                        excluded_count: 0,
                        already_approved: true,
                    });
                }
                let (ready, excluded) =
                    self.store.apply_approval(project_id, &excluded_task_ids).await?;
                self.coordinator_for(&project).wake();
                return Ok(ApprovalOutcome {
                    phase: ProjectPhase::Active,
                    approved_count: ready.len(),
                    excluded_count: excluded.len(),
                    already_approved: false,
                });
            }
            // the decomposition already ran to a terminal phase; a second
            // identical approval is a no-op
            ProjectPhase::Review | ProjectPhase::Complete => {
                return Ok(ApprovalOutcome {
                    phase: project.phase,
                    approved_count: 0,
                    excluded_count: 0,
                    already_approved: true,
                });
            }
            other => {
                return Err(CommandError::Conflict(format!(
                    "approval is not accepted in phase {}",
                    other
                )))
            }
        }

        let tasks = self.store.list_tasks(project_id).await?;
        if tasks.is_empty() {
            return Err(CommandError::Conflict("no task decomposition to approve".into()));
        }
        if !approved {
            return Ok(ApprovalOutcome {
                phase: project.phase,
                approved_count: 0,
                excluded_count: 0,
                already_approved: false,
            });
        }
        for id in &excluded_task_ids {
            if !tasks.iter().any(|t| t.id == *id) {
                return Err(CommandError::Validation(format!(
                    "excluded task {} does not belong to this project",
                    id
                )));
            }
        }

        let (ready, excluded) = self.store.apply_approval(project_id, &excluded_task_ids).await?;
        self.store
            .set_project_phase(project_id, ProjectPhase::Planning, ProjectPhase::Active)
            .await?;

        let project = self.store.get_project(project_id).await?;
        let coordinator = self.coordinator_for(&project);
        coordinator.start().await?;

        Ok(ApprovalOutcome {
            phase: ProjectPhase::Active,
            approved_count: ready.len(),
            excluded_count: excluded.len(),
            already_approved: false,
        })
    }

    async fn unblock_task(
        &self,
        project_id: Id,
        task_id: Id,
        guidance: String,
    ) -> Result<(), CommandError> {
        if guidance.trim().is_empty() {
            return Err(CommandError::Validation("guidance must not be empty".into()));
        }
        let project = self.store.get_project(project_id).await?;
        if project.phase != ProjectPhase::Active {
            return Err(CommandError::Conflict(format!(
                "project is in phase {}, not active",
                project.phase
            )));
        }
        self.coordinator_for(&project)
            .unblock(task_id, &guidance)
            .await
    }

    async fn start_session(&self, project_id: Id) -> Result<SessionRecord, CommandError> {
        let project = self.store.get_project(project_id).await?;
        self.coordinator_for(&project).start().await
    }

    async fn pause_session(&self, project_id: Id) -> Result<(), CommandError> {
        let project = self.store.get_project(project_id).await?;
        let session = self
            .store
            .live_session(project_id)
            .await?
            .ok_or_else(|| CommandError::Conflict("no live session".into()))?;
        if session.status != SessionStatus::Active {
            return Err(CommandError::Conflict(format!(
                "session is {:?}, not active",
                session.status
            )));
        }
        self.coordinator_for(&project).pause().await
    }

    async fn resume_session(&self, project_id: Id) -> Result<(), CommandError> {
        let project = self.store.get_project(project_id).await?;
        self.coordinator_for(&project).resume().await
    }

    async fn stop_session(&self, project_id: Id) -> Result<(), CommandError> {
        let project = self.store.get_project(project_id).await?;
        let session = self
            .store
            .live_session(project_id)
            .await?
            .ok_or_else(|| CommandError::Conflict("no live session".into()))?;
        let coordinator = self.coordinator_for(&project);
        if coordinator.is_running() {
            coordinator.stop().await
        } else {
            // paused session with no loop to signal
            self.store
                .set_session_status(session.id, SessionStatus::Stopped)
                .await?;
            self.bus.publish(
                project_id,
                EventKind::SessionStopped {
                    session_id: session.id,
                },
            );
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::ScriptedGateExecutor;
    use crate::worker::DefaultWorkerFactory;
    use cf_core::types::GateKind;
    use cf_harness::provider::{ScriptStep, ScriptedProvider};

    const ARTIFACT_REPLY: &str = r#"[{"path": "src/out.rs", "content": "pub fn f() {}"}]"#;

    fn passing_gates() -> QualityGate {
        QualityGate::from_executors(
            GateKind::execution_order()
                .iter()
                .map(|k| {
                    Arc::new(ScriptedGateExecutor::passing(*k))
                        as Arc<dyn crate::gates::GateExecutor>
                })
                .collect(),
        )
    }

    async fn hub_with(steps: Vec<ScriptStep>) -> (Arc<CoordinatorHub>, Arc<Store>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let bus = Arc::new(ProjectBus::new(256, 3));
        let provider: Arc<dyn CompletionProvider> =
            Arc::new(ScriptedProvider::new(steps).with_fallback(ARTIFACT_REPLY));
        let locks = Arc::new(WorkspaceLocks::new());
        let factory = Arc::new(DefaultWorkerFactory::new(
            provider.clone(),
            bus.clone(),
            locks.clone(),
        ));
        let mut config = Config::default();
        config.workspaces_root = dir.path().to_path_buf();
        config.pause_grace_ms = 200;
        let hub = Arc::new(CoordinatorHub::new(
            store.clone(),
            bus,
            provider,
            factory,
            Arc::new(passing_gates()),
            locks,
            config,
        ));
        (hub, store, dir)
    }

    fn create_req(name: &str) -> CreateProject {
        CreateProject {
            name: name.into(),
            description: "REST greet".into(),
            source_type: SourceType::Empty,
            source_location: None,
            source_branch: None,
        }
    }

    #[tokio::test]
    async fn create_project_provisions_workspace_and_git() {
        let (hub, store, dir) = hub_with(vec![]).await;
        let project = hub.create_project(create_req("hw")).await.unwrap();
        assert_eq!(project.phase, ProjectPhase::Discovery);
        assert!(project.git_initialized);
        assert!(project.current_commit.is_some());
        assert_eq!(
            project.workspace_path,
            dir.path().join(project.id.to_string()).to_string_lossy()
        );
        assert!(std::path::Path::new(&project.workspace_path).exists());
        assert_eq!(store.list_projects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn validation_failures_reject_creation() {
        let (hub, _store, _dir) = hub_with(vec![]).await;
        let mut req = create_req("");
        assert!(matches!(
            hub.create_project(req.clone()).await.unwrap_err(),
            CommandError::Validation(_)
        ));
        req.name = "ok".into();
        req.source_type = SourceType::GitRemote;
        assert!(matches!(
            hub.create_project(req).await.unwrap_err(),
            CommandError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn hosted_mode_forbids_local_path_sources() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let bus = Arc::new(ProjectBus::new(64, 3));
        let provider: Arc<dyn CompletionProvider> = Arc::new(ScriptedProvider::new(vec![]));
        let locks = Arc::new(WorkspaceLocks::new());
        let factory = Arc::new(DefaultWorkerFactory::new(
            provider.clone(),
            bus.clone(),
            locks.clone(),
        ));
        let mut config = Config::default();
        config.workspaces_root = dir.path().to_path_buf();
        config.deployment_mode = DeploymentMode::Hosted;
        let hub = CoordinatorHub::new(
            store,
            bus,
            provider,
            factory,
            Arc::new(passing_gates()),
            locks,
            config,
        );

        let mut req = create_req("p");
        req.source_type = SourceType::LocalPath;
        req.source_location = Some("/srv/code".into());
        assert!(matches!(
            hub.create_project(req).await.unwrap_err(),
            CommandError::Forbidden(_)
        ));
    }

    async fn drive_to_planning(hub: &CoordinatorHub, store: &Arc<Store>) -> Id {
        let project = hub.create_project(create_req("hw")).await.unwrap();
        hub.start_discovery(project.id).await.unwrap();
        hub.answer_discovery(project.id, "A REST API".into())
            .await
            .unwrap();
        let refreshed = store.get_project(project.id).await.unwrap();
        assert_eq!(refreshed.phase, ProjectPhase::Planning);
        project.id
    }

    #[tokio::test]
    async fn full_flow_discovery_to_complete() {
        // scripted: first question, completion marker, PRD, decomposition,
        // then worker replies via fallback
        let steps = vec![
            ScriptStep::reply("What should it do?"),
            ScriptStep::reply(crate::discovery::COMPLETION_MARKER),
            ScriptStep::reply("# PRD\nGreeting API"),
            ScriptStep::reply(
                r#"[{"task_number":"1","title":"GET /health"},
                    {"task_number":"2","title":"GET /hello"},
                    {"task_number":"3","title":"GET /hello/{name}"}]"#,
            ),
        ];
        let (hub, store, _dir) = hub_with(steps).await;
        let project_id = drive_to_planning(&hub, &store).await;

        hub.generate_tasks(project_id).await.unwrap();
        // background decomposition
        for _ in 0..100 {
            if !store.list_tasks(project_id).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(store.list_tasks(project_id).await.unwrap().len(), 3);

        let outcome = hub.approve_tasks(project_id, true, vec![]).await.unwrap();
        assert_eq!(outcome.phase, ProjectPhase::Active);
        assert_eq!(outcome.approved_count, 3);
        assert!(!outcome.already_approved);

        // wait for the session to run to completion
        for _ in 0..200 {
            let project = store.get_project(project_id).await.unwrap();
            if project.phase == ProjectPhase::Complete {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        let project = store.get_project(project_id).await.unwrap();
        assert_eq!(project.phase, ProjectPhase::Complete);
        let counts = store.task_counts(project_id).await.unwrap();
        assert_eq!(counts.completed, 3);

        // second approval is idempotent
        let again = hub.approve_tasks(project_id, true, vec![]).await.unwrap();
        assert!(again.already_approved);
        assert_eq!(again.approved_count, 0);
    }

    #[tokio::test]
    async fn approve_with_exclusions_counts_both_sides() {
        let steps = vec![
            ScriptStep::reply(crate::discovery::COMPLETION_MARKER),
            ScriptStep::reply("# PRD"),
            ScriptStep::reply(
                r#"[{"task_number":"1","title":"A"},
                    {"task_number":"2","title":"B"}]"#,
            ),
        ];
        let (hub, store, _dir) = hub_with(steps).await;
        let project_id = {
            let project = hub.create_project(create_req("hw")).await.unwrap();
            hub.start_discovery(project.id).await.unwrap();
            project.id
        };
        // discovery concluded immediately via marker
        assert_eq!(
            store.get_project(project_id).await.unwrap().phase,
            ProjectPhase::Planning
        );
        hub.generate_tasks(project_id).await.unwrap();
        for _ in 0..100 {
            if !store.list_tasks(project_id).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let tasks = store.list_tasks(project_id).await.unwrap();

        let outcome = hub
            .approve_tasks(project_id, true, vec![tasks[1].id])
            .await
            .unwrap();
        assert_eq!(outcome.excluded_count, 1);
        assert_eq!(outcome.approved_count, 1);

        // re-approval while active with no pending work
        for _ in 0..200 {
            let counts = store.task_counts(project_id).await.unwrap();
            if counts.pending == 0 && counts.ready == 0 && counts.in_progress == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        let again = hub.approve_tasks(project_id, true, vec![]).await;
        if let Ok(outcome) = again {
            assert!(outcome.already_approved);
        }
    }

    #[tokio::test]
    async fn approval_in_discovery_phase_is_a_conflict() {
        let (hub, _store, _dir) = hub_with(vec![]).await;
        let project = hub.create_project(create_req("p")).await.unwrap();
        assert!(matches!(
            hub.approve_tasks(project.id, true, vec![]).await.unwrap_err(),
            CommandError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn delete_project_requires_no_live_session() {
        let (hub, store, _dir) = hub_with(vec![]).await;
        let project = hub.create_project(create_req("p")).await.unwrap();
        let session = store.create_session(project.id).await.unwrap();
        assert!(matches!(
            hub.delete_project(project.id).await.unwrap_err(),
            CommandError::Conflict(_)
        ));
        store
            .set_session_status(session.id, SessionStatus::Stopped)
            .await
            .unwrap();
        hub.delete_project(project.id).await.unwrap();
        assert!(store.get_project(project.id).await.is_err());
    }
}
