//! Store-change fan-out.
//!
//! The store reports every mutation on a flume channel; this task converts
//! those changes into telemetry frames. Status deltas are single-sourced
//! here — components never publish `task.status_changed` themselves, so
//! subscribers can rely on one ordered stream of transitions per project.
//! Session frames are the exception: the coordinator publishes those
//! directly because only it can tell a start from a resume.

use std::sync::Arc;

use cf_core::store::StoreChange;

use crate::event_bus::ProjectBus;
use crate::protocol::EventKind;

/// Spawn the forwarding task. Runs until the store side hangs up.
pub fn spawn_store_forwarder(
    rx: flume::Receiver<StoreChange>,
    bus: Arc<ProjectBus>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(change) = rx.recv_async().await {
            let (project_id, kind) = match change {
                StoreChange::ProjectPhase { project_id, from, to } => {
                    (project_id, Some(EventKind::PhaseChanged { from, to }))
                }
                StoreChange::TaskStatus {
                    project_id,
                    task_id,
                    from,
                    to,
                } => (
                    project_id,
                    Some(EventKind::TaskStatusChanged { task_id, from, to }),
                ),
                StoreChange::AgentCreated {
                    project_id,
                    agent_id,
                    role,
                } => (project_id, Some(EventKind::AgentCreated { agent_id, role })),
                StoreChange::AgentStatus {
                    project_id,
                    agent_id,
                    from,
                    to,
                } => (
                    project_id,
                    Some(EventKind::AgentStatusChanged { agent_id, from, to }),
                ),
                StoreChange::CheckpointCreated {
                    project_id,
                    checkpoint_id,
                    name,
                } => {
                    // git_sha is filled by the checkpoint handler's own frame;
                    // the store-level change only carries identity.
                    (
                        project_id,
                        Some(EventKind::CheckpointCreated {
                            checkpoint_id,
                            name,
                            git_sha: String::new(),
                        }),
                    )
                }
                StoreChange::CostRecorded {
                    project_id,
                    agent_id,
                    task_id,
                    cents,
                } => (
                    project_id,
                    Some(EventKind::CostUpdated {
                        agent_id,
                        task_id,
                        cents,
                    }),
                ),
                // Session lifecycle frames come from the coordinator.
                StoreChange::SessionStatus { project_id, .. } => (project_id, None),
            };
            if let Some(kind) = kind {
                bus.publish(project_id, kind);
            }
        }
        tracing::debug!("store change channel closed, forwarder exiting");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::types::TaskStatus;

    #[tokio::test]
    async fn task_transitions_become_frames() {
        let bus = Arc::new(ProjectBus::new(16, 3));
        let sub = bus.subscribe(1);
        let (tx, rx) = flume::unbounded();
        let handle = spawn_store_forwarder(rx, bus);

        tx.send(StoreChange::TaskStatus {
            project_id: 1,
            task_id: 9,
            from: TaskStatus::Pending,
            to: TaskStatus::Ready,
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let frame = sub.recv_async().await.unwrap();
        match frame.kind {
            EventKind::TaskStatusChanged { task_id, from, to } => {
                assert_eq!(task_id, 9);
                assert_eq!(from, TaskStatus::Pending);
                assert_eq!(to, TaskStatus::Ready);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn session_changes_are_not_forwarded() {
        let bus = Arc::new(ProjectBus::new(16, 3));
        let sub = bus.subscribe(1);
        let (tx, rx) = flume::unbounded();
        let handle = spawn_store_forwarder(rx, bus);

        tx.send(StoreChange::SessionStatus {
            project_id: 1,
            session_id: 2,
            status: cf_core::types::SessionStatus::Active,
        })
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(sub.try_recv().is_err());
    }
}
