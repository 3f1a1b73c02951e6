//! Telemetry frames pushed to subscribers.
//!
//! Every frame is a delta; clients reconcile authoritative state via the
//! query endpoints and treat this channel as notification only. Frames are
//! per-project and delivered FIFO per subscriber.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cf_core::types::{
    AgentRole, AgentStatus, GateKind, Id, PrdStatus, ProjectPhase, TaskStatus,
};

// ---------------------------------------------------------------------------
// EventFrame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub project_id: Id,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl EventFrame {
    pub fn new(project_id: Id, kind: EventKind) -> Self {
        Self {
            project_id,
            ts: Utc::now(),
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    #[serde(rename = "project.phase_changed")]
    PhaseChanged { from: ProjectPhase, to: ProjectPhase },

    #[serde(rename = "discovery.question")]
    DiscoveryQuestion { question_id: Id, text: String },

    #[serde(rename = "discovery.answered")]
    DiscoveryAnswered { question_id: Id, answer: String },

    #[serde(rename = "prd.status")]
    PrdStatusChanged { status: PrdStatus },

    #[serde(rename = "tasks.decomposed")]
    TasksDecomposed { count: usize },

    #[serde(rename = "task.status_changed")]
    TaskStatusChanged {
        task_id: Id,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[serde(rename = "task.blocked")]
    TaskBlocked { task_id: Id, reason: String },

    #[serde(rename = "agent.created")]
    AgentCreated { agent_id: Id, role: AgentRole },

    #[serde(rename = "agent.status_changed")]
    AgentStatusChanged {
        agent_id: Id,
        from: AgentStatus,
        to: AgentStatus,
    },

    #[serde(rename = "quality_gate.result")]
    QualityGateResult {
        task_id: Id,
        passed: bool,
        gates: Vec<GateSummary>,
    },

    #[serde(rename = "checkpoint.created")]
    CheckpointCreated {
        checkpoint_id: Id,
        name: String,
        git_sha: String,
    },

    #[serde(rename = "session.started")]
    SessionStarted { session_id: Id },

    #[serde(rename = "session.paused")]
    SessionPaused { session_id: Id },

    #[serde(rename = "session.resumed")]
    SessionResumed { session_id: Id },

    #[serde(rename = "session.completed")]
    SessionCompleted { session_id: Id },

    #[serde(rename = "session.stopped")]
    SessionStopped { session_id: Id },

    #[serde(rename = "session.failed")]
    SessionFailed { session_id: Id, reason: String },

    #[serde(rename = "worker.progress")]
    WorkerProgress {
        task_id: Id,
        agent_id: Id,
        stage: WorkerStage,
    },

    #[serde(rename = "cost.updated")]
    CostUpdated {
        agent_id: Option<Id>,
        task_id: Option<Id>,
        cents: i64,
    },

    /// Inserted for a subscriber whose queue overflowed; `dropped` counts
    /// frames lost since the last frame it received.
    #[serde(rename = "gap")]
    Gap { dropped: u64 },
}

/// Stage markers emitted by a worker around its completion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStage {
    PromptSent,
    CompletionReceived,
    ArtifactsApplied,
}

/// Per-gate outcome carried by `quality_gate.result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSummary {
    pub gate: GateKind,
    pub status: GateRunStatus,
    pub findings: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateRunStatus {
    Passed,
    Failed,
    Skipped,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
