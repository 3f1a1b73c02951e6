//! Per-project session coordinator — the multi-agent scheduling loop.
//!
//! One coordination task runs while a session is active. Each tick it
//! promotes unblocked pending tasks to ready, dispatches ready tasks into
//! pool slots (role assignment, guarded claim, supervised worker spawn),
//! then parks until a worker finishes, an unblock wakes it, the session is
//! cancelled, or the session deadline passes. All task-state decisions are
//! serialized through the store's guarded updates, so a lost race is a
//! skip, never a double execution.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinSet;

use cf_bridge::event_bus::ProjectBus;
use cf_bridge::orchestrator::CommandError;
use cf_bridge::protocol::EventKind;
use cf_core::config::Config;
use cf_core::resolver::{self, TaskNode};
use cf_core::store::{Store, StoreError, Transition};
use cf_core::types::{
    Id, ProjectPhase, QualityGateStatus, SessionStatus, Task, TaskStatus,
};
use cf_harness::cancel::CancelToken;

use crate::assigner;
use crate::gates::QualityGate;
use crate::pool::{AgentPool, PoolSlot};
use crate::worker::{Outcome, OutcomeStatus, TaskContext, WorkerFactory};

// ---------------------------------------------------------------------------
// Tuning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionTuning {
    pub task_timeout: Duration,
    pub session_timeout: Duration,
    pub watchdog_max: u64,
    pub pause_grace: Duration,
    pub model: String,
    pub max_tokens: u32,
}

impl SessionTuning {
    pub fn from_config(config: &Config) -> Self {
        Self {
            task_timeout: config.task_timeout(),
            session_timeout: config.session_timeout(),
            watchdog_max: config.watchdog_max,
            pause_grace: config.pause_grace(),
            model: config.default_model.clone(),
            max_tokens: config.max_completion_tokens,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal loop types
// ---------------------------------------------------------------------------

struct WorkerDone {
    task_id: Id,
    agent_id: Id,
    slot: PoolSlot,
    outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Running,
    Pausing,
    Stopping,
}

struct Control {
    cancel: Option<CancelToken>,
    mode: RunMode,
    handle: Option<tokio::task::JoinHandle<()>>,
}

// ---------------------------------------------------------------------------
// SessionCoordinator
// ---------------------------------------------------------------------------

pub struct SessionCoordinator {
    project_id: Id,
    workspace: PathBuf,
    store: Arc<Store>,
    bus: Arc<ProjectBus>,
    pool: Arc<AgentPool>,
    factory: Arc<dyn WorkerFactory>,
    gates: Arc<QualityGate>,
    tuning: SessionTuning,
    control: Mutex<Control>,
    wake: Notify,
}

impl SessionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: Id,
        workspace: PathBuf,
        store: Arc<Store>,
        bus: Arc<ProjectBus>,
        pool: Arc<AgentPool>,
        factory: Arc<dyn WorkerFactory>,
        gates: Arc<QualityGate>,
        tuning: SessionTuning,
    ) -> Self {
        Self {
            project_id,
            workspace,
            store,
            bus,
            pool,
            factory,
            gates,
            tuning,
            control: Mutex::new(Control {
                cancel: None,
                mode: RunMode::Running,
                handle: None,
            }),
            wake: Notify::new(),
        }
    }

    pub fn project_id(&self) -> Id {
        self.project_id
    }

    /// Whether the coordination loop is currently running.
    pub fn is_running(&self) -> bool {
        let control = self.control.lock().expect("control lock poisoned");
        control
            .handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Create a session and spawn the coordination loop.
    pub async fn start(self: &Arc<Self>) -> Result<cf_core::types::SessionRecord, CommandError> {
        let project = self.store.get_project(self.project_id).await?;
        if project.phase != ProjectPhase::Active {
            return Err(CommandError::Conflict(format!(
                "project is in phase {}, not active",
                project.phase
            )));
        }
        let session = self.store.create_session(self.project_id).await?;
        self.bus.publish(
            self.project_id,
            EventKind::SessionStarted {
                session_id: session.id,
            },
        );
        self.spawn_loop(session.id);
        Ok(session)
    }

    /// Resume a paused session's loop.
    pub async fn resume(self: &Arc<Self>) -> Result<(), CommandError> {
        let session = self
            .store
            .live_session(self.project_id)
            .await?
            .ok_or_else(|| CommandError::Conflict("no live session".into()))?;
        if session.status != SessionStatus::Paused {
            return Err(CommandError::Conflict(format!(
                "session is {:?}, not paused",
                session.status
            )));
        }
        self.store
            .set_session_status(session.id, SessionStatus::Active)
            .await?;
        self.bus.publish(
            self.project_id,
            EventKind::SessionResumed {
                session_id: session.id,
            },
        );
        self.spawn_loop(session.id);
        Ok(())
    }

    /// Cancel in-flight work and leave the session paused. Waits for the
    /// loop to finish draining (bounded by the grace window).
    pub async fn pause(self: &Arc<Self>) -> Result<(), CommandError> {
        self.signal(RunMode::Pausing).await
    }

    /// Cancel in-flight work and end the session as stopped.
    pub async fn stop(self: &Arc<Self>) -> Result<(), CommandError> {
        self.signal(RunMode::Stopping).await
    }

    async fn signal(self: &Arc<Self>, mode: RunMode) -> Result<(), CommandError> {
        let (cancel, handle) = {
            let mut control = self.control.lock().expect("control lock poisoned");
            let Some(cancel) = control.cancel.clone() else {
                return Err(CommandError::Conflict("no running session loop".into()));
            };
            control.mode = mode;
            (cancel, control.handle.take())
        };
        cancel.cancel();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Record operator guidance on a blocked task and return it to ready.
    pub async fn unblock(&self, task_id: Id, guidance: &str) -> Result<(), CommandError> {
        let task = self.store.get_task(task_id).await?;
        if task.project_id != self.project_id {
            return Err(CommandError::NotFound(format!("task {}", task_id)));
        }
        if task.status != TaskStatus::Blocked {
            return Err(CommandError::Conflict(format!(
                "task {} is {}, not blocked",
                task_id, task.status
            )));
        }
        self.store
            .add_task_comment(task_id, "operator", guidance)
            .await?;
        let applied = self
            .store
            .update_task_status(task_id, TaskStatus::Blocked, TaskStatus::Ready)
            .await?;
        if !applied.applied() {
            return Err(CommandError::Conflict("task is no longer blocked".into()));
        }
        self.wake.notify_one();
        Ok(())
    }

    /// External nudge for the loop (new ready work appeared).
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    fn spawn_loop(self: &Arc<Self>, session_id: Id) {
        let cancel = CancelToken::new();
        let coordinator = self.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            coordinator.run_loop(session_id, loop_cancel).await;
        });
        let mut control = self.control.lock().expect("control lock poisoned");
        control.cancel = Some(cancel);
        control.mode = RunMode::Running;
        control.handle = Some(handle);
    }

    // -----------------------------------------------------------------------
    // The coordination loop
    // -----------------------------------------------------------------------

    async fn run_loop(self: Arc<Self>, session_id: Id, cancel: CancelToken) {
        tracing::info!(project_id = self.project_id, session_id, "session loop started");
        let deadline = tokio::time::Instant::now() + self.tuning.session_timeout;
        let mut inflight: JoinSet<WorkerDone> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, (Id, Id)> = HashMap::new();
        let mut iteration = 0u64;
        let mut watchdog = 0u64;

        loop {
            iteration += 1;
            let mut progress = false;
            let mut external_nudge = false;

            match self.dispatch_ready(&mut inflight, &mut running, &cancel).await {
                Ok(dispatched) => {
                    if dispatched > 0 {
                        progress = true;
                    }
                }
                Err(e) => {
                    self.fail_session(session_id, &format!("persistence error: {}", e))
                        .await;
                    return;
                }
            }

            if inflight.is_empty() {
                let resolution = match self.resolve().await {
                    Ok(r) => r,
                    Err(e) => {
                        self.fail_session(session_id, &format!("persistence error: {}", e))
                            .await;
                        return;
                    }
                };
                if resolution.is_complete {
                    self.finish(session_id).await;
                    return;
                }
                if let Some(reason) = resolution.deadlock_reason {
                    self.fail_session(session_id, &reason).await;
                    return;
                }
            }

            let _ = self
                .store
                .bump_session_iteration(session_id, iteration, watchdog)
                .await;
            if watchdog > self.tuning.watchdog_max {
                self.fail_session(session_id, "watchdog").await;
                return;
            }

            tokio::select! {
                joined = inflight.join_next_with_id(), if !inflight.is_empty() => {
                    progress = true;
                    match joined {
                        Some(Ok((join_id, done))) => {
                            running.remove(&join_id);
                            if let Err(e) = self.handle_done(done).await {
                                self.fail_session(session_id, &format!("persistence error: {}", e)).await;
                                return;
                            }
                        }
                        Some(Err(join_err)) => {
                            // worker panicked; fail its task
                            if let Some((task_id, _agent)) = running.remove(&join_err.id()) {
                                tracing::error!(task_id, error = %join_err, "worker task panicked");
                                let _ = self
                                    .store
                                    .update_task_status(task_id, TaskStatus::InProgress, TaskStatus::Failed)
                                    .await;
                            }
                        }
                        None => {}
                    }
                }
                _ = self.wake.notified() => {}
                // a sibling project's completion freed pool capacity; not
                // counted against the watchdog
                _ = self.pool.slot_released() => { external_nudge = true; }
                _ = cancel.cancelled() => {
                    self.drain_on_cancel(session_id, &mut inflight, &mut running).await;
                    return;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.emergency_shutdown(session_id, &cancel, &mut inflight, &mut running).await;
                    return;
                }
            }

            if progress {
                watchdog = 0;
            } else if !external_nudge {
                watchdog += 1;
            }
        }
    }

    async fn resolve(&self) -> Result<resolver::Resolution, StoreError> {
        let tasks = self.store.list_tasks(self.project_id).await?;
        let nodes: Vec<TaskNode> = tasks
            .iter()
            .map(|t| TaskNode {
                id: t.id,
                task_number: t.task_number.clone(),
                status: t.status,
                depends_on: t.depends_on.clone(),
            })
            .collect();
        Ok(resolver::resolve(&nodes))
    }

    /// Promote unblocked pending tasks and dispatch ready tasks into free
    /// pool slots. Returns how many workers were launched.
    async fn dispatch_ready(
        &self,
        inflight: &mut JoinSet<WorkerDone>,
        running: &mut HashMap<tokio::task::Id, (Id, Id)>,
        cancel: &CancelToken,
    ) -> Result<usize, StoreError> {
        // pending -> ready where dependencies are satisfied
        let resolution = self.resolve().await?;
        for task_id in &resolution.ready {
            // a lost race here just means someone else promoted it
            let _ = self
                .store
                .update_task_status(*task_id, TaskStatus::Pending, TaskStatus::Ready)
                .await?;
        }

        let mut dispatched = 0usize;
        let ready: Vec<Task> = self
            .store
            .list_tasks(self.project_id)
            .await?
            .into_iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .collect();

        for task in ready {
            let assignment = assigner::assign_role(&task);
            self.store.set_task_role(task.id, assignment.role).await?;

            let Some(slot) = self.pool.try_acquire(self.project_id, assignment.role).await? else {
                break; // pool saturated; completions will free slots
            };

            match self.store.claim_task(task.id, slot.agent.id).await? {
                Transition::Applied => {}
                Transition::NotApplied => {
                    // someone else claimed it between listing and here
                    self.pool.release(slot).await?;
                    continue;
                }
            }
            self.pool.mark_busy(&slot, task.id).await?;

            let claimed = self.store.get_task(task.id).await?;
            let guidance = self
                .store
                .list_task_comments(task.id)
                .await?
                .into_iter()
                .map(|c| c.body)
                .collect();
            let ctx = TaskContext {
                task: claimed,
                project_id: self.project_id,
                workspace: self.workspace.clone(),
                guidance,
                model: self.tuning.model.clone(),
                max_tokens: self.tuning.max_tokens,
            };

            let worker = self.factory.create(assignment.role);
            let task_cancel = cancel.deadline_child(self.tuning.task_timeout);
            let task_id = task.id;
            let agent_id = slot.agent.id;
            tracing::debug!(
                task_id,
                agent_id,
                role = %assignment.role,
                reason = %assignment.explanation,
                "task dispatched"
            );
            let abort = inflight.spawn(async move {
                let outcome = worker.execute_task(agent_id, &ctx, &task_cancel).await;
                WorkerDone {
                    task_id,
                    agent_id,
                    slot,
                    outcome,
                }
            });
            running.insert(abort.id(), (task_id, agent_id));
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Apply one finished worker's outcome: gates, transitions, cost,
    /// release.
    async fn handle_done(&self, done: WorkerDone) -> Result<(), StoreError> {
        let WorkerDone {
            task_id,
            agent_id,
            slot,
            outcome,
        } = done;

        if outcome.tokens_in > 0 || outcome.tokens_out > 0 || outcome.cost_cents > 0 {
            self.store
                .record_cost(
                    self.project_id,
                    Some(agent_id),
                    Some(task_id),
                    &self.tuning.model,
                    outcome.tokens_in,
                    outcome.tokens_out,
                    outcome.cost_cents,
                )
                .await?;
            self.store
                .add_agent_usage(
                    agent_id,
                    outcome.tokens_in,
                    outcome.tokens_out,
                    outcome.cost_cents,
                )
                .await?;
        }

        if outcome.cancelled {
            // pause/stop/timeout abandoned this execution; hand the task back
            let _ = self
                .store
                .update_task_status(task_id, TaskStatus::InProgress, TaskStatus::Ready)
                .await?;
            self.pool.release(slot).await?;
            return Ok(());
        }

        if let Some(reason) = &outcome.needs_human {
            let _ = self
                .store
                .update_task_status(task_id, TaskStatus::InProgress, TaskStatus::Blocked)
                .await?;
            self.bus.publish(
                self.project_id,
                EventKind::TaskBlocked {
                    task_id,
                    reason: reason.clone(),
                },
            );
            self.pool.release(slot).await?;
            return Ok(());
        }

        match outcome.status {
            OutcomeStatus::Completed => {
                self.store
                    .set_task_artifacts(task_id, &outcome.artifacts)
                    .await?;
                let task = self.store.get_task(task_id).await?;
                let report = self
                    .gates
                    .run_all(&task, &self.workspace, &outcome.findings)
                    .await;
                self.store
                    .insert_findings(task_id, report.findings())
                    .await?;
                self.bus.publish(
                    self.project_id,
                    EventKind::QualityGateResult {
                        task_id,
                        passed: report.passed,
                        gates: report.summaries(),
                    },
                );
                if report.passed {
                    self.store
                        .set_task_gate_status(task_id, QualityGateStatus::Passed)
                        .await?;
                    let _ = self
                        .store
                        .update_task_status(task_id, TaskStatus::InProgress, TaskStatus::Completed)
                        .await?;
                } else {
                    self.store
                        .set_task_gate_status(task_id, QualityGateStatus::Failed)
                        .await?;
                    self.retry_or_fail(&task).await?;
                }
            }
            OutcomeStatus::Failed => {
                let task = self.store.get_task(task_id).await?;
                if outcome.retryable {
                    self.retry_or_fail(&task).await?;
                } else {
                    let _ = self
                        .store
                        .update_task_status(task_id, TaskStatus::InProgress, TaskStatus::Failed)
                        .await?;
                }
            }
        }

        self.pool.release(slot).await?;
        Ok(())
    }

    /// Retry rule: back to ready while attempts remain, terminal failure
    /// otherwise. The attempt counter bumps at claim time.
    async fn retry_or_fail(&self, task: &Task) -> Result<(), StoreError> {
        if task.attempt_count < task.max_attempts {
            let _ = self
                .store
                .update_task_status(task.id, TaskStatus::InProgress, TaskStatus::Ready)
                .await?;
            tracing::info!(
                task_id = task.id,
                attempt = task.attempt_count,
                max = task.max_attempts,
                "task returned to ready for retry"
            );
        } else {
            let _ = self
                .store
                .update_task_status(task.id, TaskStatus::InProgress, TaskStatus::Failed)
                .await?;
            tracing::warn!(task_id = task.id, "task failed after exhausting attempts");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Exits
    // -----------------------------------------------------------------------

    /// All tasks terminal: advance the project phase and complete the
    /// session. Review when anything failed, complete otherwise.
    async fn finish(&self, session_id: Id) {
        let counts = match self.store.task_counts(self.project_id).await {
            Ok(c) => c,
            Err(e) => {
                self.fail_session(session_id, &format!("persistence error: {}", e))
                    .await;
                return;
            }
        };
        let next_phase = if counts.failed > 0 {
            ProjectPhase::Review
        } else {
            ProjectPhase::Complete
        };
        if let Err(e) = self
            .store
            .set_project_phase(self.project_id, ProjectPhase::Active, next_phase)
            .await
        {
            tracing::warn!(project_id = self.project_id, error = %e, "phase advance failed");
        }
        let _ = self
            .store
            .set_session_status(session_id, SessionStatus::Completed)
            .await;
        self.bus.publish(
            self.project_id,
            EventKind::SessionCompleted { session_id },
        );
        let _ = self.pool.retire_idle(self.project_id).await;
        tracing::info!(
            project_id = self.project_id,
            session_id,
            phase = %next_phase,
            "session completed"
        );
    }

    async fn fail_session(&self, session_id: Id, reason: &str) {
        let _ = self
            .store
            .set_session_status(session_id, SessionStatus::Failed)
            .await;
        self.bus.publish(
            self.project_id,
            EventKind::SessionFailed {
                session_id,
                reason: reason.to_string(),
            },
        );
        let _ = self.pool.retire_idle(self.project_id).await;
        tracing::warn!(project_id = self.project_id, session_id, reason, "session failed");
    }

    /// Pause/stop path: wait out the grace window for workers to observe
    /// the cancel, then force-abandon whatever is left.
    async fn drain_on_cancel(
        &self,
        session_id: Id,
        inflight: &mut JoinSet<WorkerDone>,
        running: &mut HashMap<tokio::task::Id, (Id, Id)>,
    ) {
        let grace_deadline = tokio::time::Instant::now() + self.tuning.pause_grace;
        while !inflight.is_empty() {
            match tokio::time::timeout_at(grace_deadline, inflight.join_next_with_id()).await {
                Ok(Some(Ok((join_id, done)))) => {
                    running.remove(&join_id);
                    let _ = self
                        .store
                        .update_task_status(done.task_id, TaskStatus::InProgress, TaskStatus::Ready)
                        .await;
                    let _ = self.pool.release(done.slot).await;
                }
                Ok(Some(Err(join_err))) => {
                    running.remove(&join_err.id());
                }
                Ok(None) => break,
                Err(_) => {
                    // grace expired: abort outright and abandon the tasks
                    inflight.abort_all();
                    while inflight.join_next().await.is_some() {}
                    for (_, (task_id, agent_id)) in running.drain() {
                        let _ = self
                            .store
                            .update_task_status(task_id, TaskStatus::InProgress, TaskStatus::Ready)
                            .await;
                        let _ = self.pool.release_abandoned(agent_id).await;
                    }
                    break;
                }
            }
        }

        let mode = self.control.lock().expect("control lock poisoned").mode;
        match mode {
            RunMode::Pausing => {
                let _ = self
                    .store
                    .set_session_status(session_id, SessionStatus::Paused)
                    .await;
                self.bus
                    .publish(self.project_id, EventKind::SessionPaused { session_id });
                tracing::info!(project_id = self.project_id, session_id, "session paused");
            }
            _ => {
                let _ = self
                    .store
                    .set_session_status(session_id, SessionStatus::Stopped)
                    .await;
                self.bus
                    .publish(self.project_id, EventKind::SessionStopped { session_id });
                let _ = self.pool.retire_idle(self.project_id).await;
                tracing::info!(project_id = self.project_id, session_id, "session stopped");
            }
        }
    }

    /// Session deadline exceeded: cancel everything, mark survivors failed,
    /// fail the session.
    async fn emergency_shutdown(
        &self,
        session_id: Id,
        cancel: &CancelToken,
        inflight: &mut JoinSet<WorkerDone>,
        running: &mut HashMap<tokio::task::Id, (Id, Id)>,
    ) {
        tracing::warn!(
            project_id = self.project_id,
            session_id,
            "session timeout exceeded, emergency shutdown"
        );
        cancel.cancel();
        let grace_deadline = tokio::time::Instant::now() + self.tuning.pause_grace;
        while !inflight.is_empty() {
            match tokio::time::timeout_at(grace_deadline, inflight.join_next_with_id()).await {
                Ok(Some(Ok((join_id, done)))) => {
                    running.remove(&join_id);
                    let _ = self
                        .store
                        .update_task_status(done.task_id, TaskStatus::InProgress, TaskStatus::Failed)
                        .await;
                    let _ = self.pool.release(done.slot).await;
                }
                Ok(Some(Err(join_err))) => {
                    running.remove(&join_err.id());
                }
                Ok(None) => break,
                Err(_) => {
                    inflight.abort_all();
                    while inflight.join_next().await.is_some() {}
                    break;
                }
            }
        }
        for (_, (task_id, agent_id)) in running.drain() {
            let _ = self
                .store
                .update_task_status(task_id, TaskStatus::InProgress, TaskStatus::Failed)
                .await;
            let _ = self.pool.release_abandoned(agent_id).await;
        }
        self.fail_session(session_id, "timeout").await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::store::{NewFinding, NewProject, NewTask};
    use cf_core::types::{GateKind, Severity, SourceType};
    use cf_core::workspace::WorkspaceLocks;
    use cf_harness::provider::{CompletionError, ScriptStep, ScriptedProvider};
    use crate::gates::{GateOutcome, ScriptedGateExecutor};
    use crate::worker::DefaultWorkerFactory;

    const ARTIFACT_REPLY: &str = r#"[{"path": "src/out.rs", "content": "pub fn f() {}"}]"#;

    struct Rig {
        store: Arc<Store>,
        bus: Arc<ProjectBus>,
        coordinator: Arc<SessionCoordinator>,
        project_id: Id,
        _workspace: tempfile::TempDir,
    }

    async fn rig(steps: Vec<ScriptStep>, tasks: Vec<NewTask>, tuning: Option<SessionTuning>) -> Rig {
        rig_with_gates(steps, tasks, tuning, QualityGate::from_executors(
            GateKind::execution_order()
                .iter()
                .map(|k| {
                    Arc::new(ScriptedGateExecutor::passing(*k)) as Arc<dyn crate::gates::GateExecutor>
                })
                .collect(),
        ))
        .await
    }

    async fn rig_with_gates(
        steps: Vec<ScriptStep>,
        tasks: Vec<NewTask>,
        tuning: Option<SessionTuning>,
        gates: QualityGate,
    ) -> Rig {
        let workspace = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let bus = Arc::new(ProjectBus::new(256, 3));
        let project = store
            .create_project(NewProject {
                name: "p".into(),
                description: String::new(),
                source_type: SourceType::Empty,
                source_location: None,
                source_branch: None,
                workspace_path: workspace.path().to_string_lossy().to_string(),
            })
            .await
            .unwrap();
        store
            .set_project_phase(project.id, ProjectPhase::Discovery, ProjectPhase::Planning)
            .await
            .unwrap();
        store.insert_tasks(project.id, tasks).await.unwrap();
        store.apply_approval(project.id, &[]).await.unwrap();
        store
            .set_project_phase(project.id, ProjectPhase::Planning, ProjectPhase::Active)
            .await
            .unwrap();

        let provider = Arc::new(
            ScriptedProvider::new(steps).with_fallback(ARTIFACT_REPLY),
        );
        let locks = Arc::new(WorkspaceLocks::new());
        let factory = Arc::new(DefaultWorkerFactory::new(provider, bus.clone(), locks));
        let pool = Arc::new(AgentPool::new(store.clone(), 5));
        let tuning = tuning.unwrap_or(SessionTuning {
            task_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(30),
            watchdog_max: 1000,
            pause_grace: Duration::from_millis(200),
            model: "m-large".into(),
            max_tokens: 4096,
        });
        let coordinator = Arc::new(SessionCoordinator::new(
            project.id,
            workspace.path().to_path_buf(),
            store.clone(),
            bus.clone(),
            pool,
            factory,
            Arc::new(gates),
            tuning,
        ));
        Rig {
            store,
            bus,
            coordinator,
            project_id: project.id,
            _workspace: workspace,
        }
    }

    fn simple_tasks(n: usize) -> Vec<NewTask> {
        (1..=n)
            .map(|i| NewTask {
                task_number: i.to_string(),
                title: format!("task {}", i),
                description: String::new(),
                depends_on_numbers: vec![],
            })
            .collect()
    }

    async fn wait_for_session_end(rig: &Rig) -> SessionStatus {
        for _ in 0..200 {
            if !rig.coordinator.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        rig.store
            .live_session(rig.project_id)
            .await
            .unwrap()
            .map(|s| s.status)
            .unwrap_or_else(|| SessionStatus::Completed)
    }

    #[tokio::test]
    async fn happy_path_completes_all_tasks_and_advances_phase() {
        let rig = rig(vec![], simple_tasks(3), None).await;
        rig.coordinator.start().await.unwrap();
        wait_for_session_end(&rig).await;

        let counts = rig.store.task_counts(rig.project_id).await.unwrap();
        assert_eq!(counts.completed, 3);
        let project = rig.store.get_project(rig.project_id).await.unwrap();
        assert_eq!(project.phase, ProjectPhase::Complete);
    }

    #[tokio::test]
    async fn dependency_ordering_is_respected() {
        let tasks = vec![
            NewTask {
                task_number: "1".into(),
                title: "A".into(),
                description: String::new(),
                depends_on_numbers: vec![],
            },
            NewTask {
                task_number: "2".into(),
                title: "B".into(),
                description: String::new(),
                depends_on_numbers: vec!["1".into()],
            },
            NewTask {
                task_number: "3".into(),
                title: "C".into(),
                description: String::new(),
                depends_on_numbers: vec!["1".into()],
            },
            NewTask {
                task_number: "4".into(),
                title: "D".into(),
                description: String::new(),
                depends_on_numbers: vec!["2".into(), "3".into()],
            },
        ];
        let rig = rig(vec![], tasks, None).await;
        rig.coordinator.start().await.unwrap();
        wait_for_session_end(&rig).await;

        let tasks = rig.store.list_tasks(rig.project_id).await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
        let a = &tasks[0];
        let b = &tasks[1];
        let c = &tasks[2];
        let d = &tasks[3];
        assert!(a.completed_at.unwrap() <= b.started_at.unwrap());
        assert!(a.completed_at.unwrap() <= c.started_at.unwrap());
        assert!(b.completed_at.unwrap() <= d.started_at.unwrap());
        assert!(c.completed_at.unwrap() <= d.started_at.unwrap());
    }

    #[tokio::test]
    async fn retryable_failures_consume_attempts_then_succeed() {
        let steps = vec![
            ScriptStep::Fail(CompletionError::Timeout),
            ScriptStep::Fail(CompletionError::Timeout),
            ScriptStep::reply(ARTIFACT_REPLY),
        ];
        let rig = rig(steps, simple_tasks(1), None).await;
        rig.coordinator.start().await.unwrap();
        wait_for_session_end(&rig).await;

        let task = &rig.store.list_tasks(rig.project_id).await.unwrap()[0];
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt_count, 3);
    }

    #[tokio::test]
    async fn attempts_exhaust_to_failed_and_review_phase() {
        let steps = vec![
            ScriptStep::Fail(CompletionError::Timeout),
            ScriptStep::Fail(CompletionError::Timeout),
            ScriptStep::Fail(CompletionError::Timeout),
        ];
        let rig = rig(steps, simple_tasks(1), None).await;
        rig.coordinator.start().await.unwrap();
        wait_for_session_end(&rig).await;

        let task = &rig.store.list_tasks(rig.project_id).await.unwrap()[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 3);
        let project = rig.store.get_project(rig.project_id).await.unwrap();
        assert_eq!(project.phase, ProjectPhase::Review);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_terminal_immediately() {
        let steps = vec![ScriptStep::Fail(CompletionError::Auth("bad key".into()))];
        let rig = rig(steps, simple_tasks(1), None).await;
        rig.coordinator.start().await.unwrap();
        wait_for_session_end(&rig).await;

        let task = &rig.store.list_tasks(rig.project_id).await.unwrap()[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, 1);
    }

    #[tokio::test]
    async fn critical_review_finding_fails_task_and_skips_gates() {
        let critical = NewFinding {
            gate: GateKind::Review,
            severity: Severity::Critical,
            file: None,
            line: None,
            message: "unusable".into(),
            recommendation: None,
        };
        let mut executors: Vec<Arc<dyn crate::gates::GateExecutor>> = vec![Arc::new(
            ScriptedGateExecutor::new(
                GateKind::Review,
                vec![
                    GateOutcome::failed(vec![critical.clone()]),
                    GateOutcome::failed(vec![critical.clone()]),
                    GateOutcome::failed(vec![critical.clone()]),
                ],
            ),
        )];
        for kind in &GateKind::execution_order()[1..] {
            executors.push(Arc::new(ScriptedGateExecutor::passing(*kind)));
        }
        let rig = rig_with_gates(
            vec![],
            simple_tasks(1),
            None,
            QualityGate::from_executors(executors),
        )
        .await;
        let events = rig.bus.subscribe(rig.project_id);
        rig.coordinator.start().await.unwrap();
        wait_for_session_end(&rig).await;

        let task = &rig.store.list_tasks(rig.project_id).await.unwrap()[0];
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.quality_gate_status, QualityGateStatus::Failed);
        let project = rig.store.get_project(rig.project_id).await.unwrap();
        assert_eq!(project.phase, ProjectPhase::Review);

        let gate_frames: Vec<_> = events
            .try_iter()
            .filter_map(|f| match f.kind {
                EventKind::QualityGateResult { passed, gates, .. } => Some((passed, gates)),
                _ => None,
            })
            .collect();
        assert!(!gate_frames.is_empty());
        let (passed, gates) = &gate_frames[0];
        assert!(!passed);
        assert!(gates[1..]
            .iter()
            .all(|g| g.status == cf_bridge::protocol::GateRunStatus::Skipped));
    }

    #[tokio::test]
    async fn needs_human_blocks_and_unblock_resumes() {
        let steps = vec![
            ScriptStep::reply("NEEDS_HUMAN: pick a port"),
            ScriptStep::reply(ARTIFACT_REPLY),
        ];
        let rig = rig(steps, simple_tasks(1), None).await;
        rig.coordinator.start().await.unwrap();

        // wait for the block
        let mut blocked = false;
        for _ in 0..100 {
            let task = &rig.store.list_tasks(rig.project_id).await.unwrap()[0];
            if task.status == TaskStatus::Blocked {
                blocked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(blocked, "task never reached blocked");

        let task_id = rig.store.list_tasks(rig.project_id).await.unwrap()[0].id;
        rig.coordinator.unblock(task_id, "use 8080").await.unwrap();
        wait_for_session_end(&rig).await;

        let task = rig.store.get_task(task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let comments = rig.store.list_task_comments(task_id).await.unwrap();
        assert_eq!(comments[0].body, "use 8080");
    }

    #[tokio::test]
    async fn pause_abandons_in_flight_work_back_to_ready() {
        let steps = vec![ScriptStep::Hang];
        let rig = rig(steps, simple_tasks(1), None).await;
        rig.coordinator.start().await.unwrap();

        // wait until the task is actually claimed
        for _ in 0..100 {
            let task = &rig.store.list_tasks(rig.project_id).await.unwrap()[0];
            if task.status == TaskStatus::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        rig.coordinator.pause().await.unwrap();
        let session = rig
            .store
            .live_session(rig.project_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Paused);
        let task = &rig.store.list_tasks(rig.project_id).await.unwrap()[0];
        assert_eq!(task.status, TaskStatus::Ready);

        // resume finishes the work (fallback reply applies artifacts)
        rig.coordinator.resume().await.unwrap();
        wait_for_session_end(&rig).await;
        let task = &rig.store.list_tasks(rig.project_id).await.unwrap()[0];
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn session_timeout_fails_surviving_tasks() {
        let tuning = SessionTuning {
            task_timeout: Duration::from_secs(60),
            session_timeout: Duration::from_millis(150),
            watchdog_max: 1000,
            pause_grace: Duration::from_millis(100),
            model: "m-large".into(),
            max_tokens: 4096,
        };
        let rig = rig(vec![ScriptStep::Hang], simple_tasks(1), Some(tuning)).await;
        let events = rig.bus.subscribe(rig.project_id);
        rig.coordinator.start().await.unwrap();

        for _ in 0..200 {
            if !rig.coordinator.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let session = rig
            .store
            .live_session(rig.project_id)
            .await
            .unwrap();
        assert!(session.is_none(), "session should be terminal");
        let task = &rig.store.list_tasks(rig.project_id).await.unwrap()[0];
        assert_eq!(task.status, TaskStatus::Failed);
        let failed = events.try_iter().any(|f| {
            matches!(f.kind, EventKind::SessionFailed { ref reason, .. } if reason == "timeout")
        });
        assert!(failed);
    }

    #[tokio::test]
    async fn watchdog_trips_on_progressless_iterations() {
        // one blocked task, nothing dispatchable
        let steps = vec![ScriptStep::reply("NEEDS_HUMAN: stuck")];
        let tuning = SessionTuning {
            task_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(30),
            watchdog_max: 3,
            pause_grace: Duration::from_millis(100),
            model: "m-large".into(),
            max_tokens: 4096,
        };
        let rig = rig(steps, simple_tasks(1), Some(tuning)).await;
        rig.coordinator.start().await.unwrap();

        for _ in 0..100 {
            let task = &rig.store.list_tasks(rig.project_id).await.unwrap()[0];
            if task.status == TaskStatus::Blocked {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // spurious wake-ups with no new work count against the watchdog
        for _ in 0..6 {
            rig.coordinator.wake();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        for _ in 0..100 {
            if !rig.coordinator.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let session = rig.store.live_session(rig.project_id).await.unwrap();
        assert!(session.is_none(), "watchdog should have failed the session");
    }

    #[tokio::test]
    async fn concurrent_workers_stay_within_pool_capacity() {
        let rig = rig(vec![], simple_tasks(8), None).await;
        rig.coordinator.start().await.unwrap();
        wait_for_session_end(&rig).await;

        let counts = rig.store.task_counts(rig.project_id).await.unwrap();
        assert_eq!(counts.completed, 8);
        // capacity 5: never more than 5 agents were created for one role set
        let agents = rig.store.list_agents(rig.project_id).await.unwrap();
        assert!(agents.len() <= 5, "agents: {}", agents.len());
    }
}
