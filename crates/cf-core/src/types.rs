use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque row identifier. Every persisted entity is keyed by one.
pub type Id = i64;

// ---------------------------------------------------------------------------
// ProjectPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectPhase {
    Discovery,
    Planning,
    Active,
    Review,
    Complete,
    Failed,
}

impl ProjectPhase {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Phases only move forward, with two exceptions: `Review -> Active` on
    /// rework, and any non-terminal phase may fall to `Failed`.
    pub fn can_transition_to(&self, target: &ProjectPhase) -> bool {
        matches!(
            (self, target),
            (ProjectPhase::Discovery, ProjectPhase::Planning)
                | (ProjectPhase::Planning, ProjectPhase::Active)
                | (ProjectPhase::Active, ProjectPhase::Review)
                | (ProjectPhase::Active, ProjectPhase::Complete)
                | (ProjectPhase::Review, ProjectPhase::Active)
                | (ProjectPhase::Review, ProjectPhase::Complete)
                | (ProjectPhase::Discovery, ProjectPhase::Failed)
                | (ProjectPhase::Planning, ProjectPhase::Failed)
                | (ProjectPhase::Active, ProjectPhase::Failed)
                | (ProjectPhase::Review, ProjectPhase::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectPhase::Complete | ProjectPhase::Failed)
    }
}

impl std::fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ProjectPhase::Discovery => "discovery",
            ProjectPhase::Planning => "planning",
            ProjectPhase::Active => "active",
            ProjectPhase::Review => "review",
            ProjectPhase::Complete => "complete",
            ProjectPhase::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// SourceType / Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    GitRemote,
    LocalPath,
    Upload,
    Empty,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Id,
    pub name: String,
    pub description: String,
    pub source_type: SourceType,
    pub source_location: Option<String>,
    pub source_branch: Option<String>,
    pub workspace_path: String,
    pub git_initialized: bool,
    pub current_commit: Option<String>,
    pub phase: ProjectPhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPhase {
    NotStarted,
    Discovering,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrdStatus {
    None,
    Generating,
    Available,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryQuestion {
    pub id: Id,
    pub project_id: Id,
    pub text: String,
    pub answer: Option<String>,
    pub asked_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
}

/// Assembled discovery view for a project. The store keeps the scalar fields
/// on the project row and the questions in their own table; this struct is
/// what clients reconcile against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryState {
    pub state: DiscoveryPhase,
    pub questions: Vec<DiscoveryQuestion>,
    pub prd_status: PrdStatus,
    pub prd_content: Option<String>,
}

impl DiscoveryState {
    /// The single unanswered question, if any. The store enforces that at
    /// most one question is pending at a time.
    pub fn pending_question(&self) -> Option<&DiscoveryQuestion> {
        self.questions.iter().find(|q| q.answer.is_none())
    }
}

// ---------------------------------------------------------------------------
// TaskStatus / Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Blocked,
    Completed,
    Failed,
    Excluded,
}

impl TaskStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Ready)
                | (TaskStatus::Pending, TaskStatus::Excluded)
                | (TaskStatus::Ready, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Blocked)
                // retry after a retryable failure or gate miss
                | (TaskStatus::InProgress, TaskStatus::Ready)
                | (TaskStatus::Blocked, TaskStatus::Ready)
                // review-phase rework reopens terminal tasks
                | (TaskStatus::Failed, TaskStatus::Ready)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Excluded
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Excluded => "excluded",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityGateStatus {
    NotRun,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub project_id: Id,
    /// Human-stable ordinal within the project ("1", "2.1", ...). Drives the
    /// deterministic ready-set tie-break.
    pub task_number: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub depends_on: Vec<Id>,
    pub assigned_role: Option<AgentRole>,
    pub assigned_agent_id: Option<Id>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub quality_gate_status: QualityGateStatus,
    /// Workspace-relative paths touched by the worker.
    pub artifacts: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Per-status task counts reported by `tasks.list`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub ready: u64,
    pub in_progress: u64,
    pub blocked: u64,
    pub completed: u64,
    pub failed: u64,
    pub excluded: u64,
}

impl TaskCounts {
    pub fn total(&self) -> u64 {
        self.pending
            + self.ready
            + self.in_progress
            + self.blocked
            + self.completed
            + self.failed
            + self.excluded
    }
}

// ---------------------------------------------------------------------------
// AgentRole / AgentStatus / AgentRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Lead,
    Backend,
    Frontend,
    Test,
    Review,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AgentRole::Lead => "lead",
            AgentRole::Backend => "backend",
            AgentRole::Frontend => "frontend",
            AgentRole::Test => "test",
            AgentRole::Review => "review",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Stopping,
    Stopped,
    Error,
}

impl AgentStatus {
    pub fn can_transition_to(&self, target: &AgentStatus) -> bool {
        matches!(
            (self, target),
            (AgentStatus::Idle, AgentStatus::Busy)
                | (AgentStatus::Idle, AgentStatus::Stopping)
                | (AgentStatus::Busy, AgentStatus::Idle)
                | (AgentStatus::Busy, AgentStatus::Error)
                | (AgentStatus::Busy, AgentStatus::Stopping)
                | (AgentStatus::Stopping, AgentStatus::Stopped)
                | (AgentStatus::Error, AgentStatus::Idle)
                | (AgentStatus::Error, AgentStatus::Stopping)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Id,
    pub project_id: Id,
    pub role: AgentRole,
    pub status: AgentStatus,
    pub current_task_id: Option<Id>,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cost_cents: i64,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped | SessionStatus::Completed | SessionStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Id,
    pub project_id: Id,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub last_iteration: u64,
    pub watchdog_count: u64,
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Append-only audit row. The payload is opaque JSON; the push channel
/// carries the same kinds as deltas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Id,
    pub project_id: Id,
    pub session_id: Option<Id>,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Id,
    pub project_id: Id,
    pub name: String,
    pub description: Option<String>,
    pub git_sha: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Quality gates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Review,
    Tests,
    Coverage,
    TypeCheck,
    Lint,
}

impl GateKind {
    /// Fixed execution order. Review runs first so a critical review finding
    /// short-circuits the remaining gates to `skipped`.
    pub fn execution_order() -> &'static [GateKind] {
        &[
            GateKind::Review,
            GateKind::Tests,
            GateKind::Coverage,
            GateKind::TypeCheck,
            GateKind::Lint,
        ]
    }
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            GateKind::Review => "review",
            GateKind::Tests => "tests",
            GateKind::Coverage => "coverage",
            GateKind::TypeCheck => "type_check",
            GateKind::Lint => "lint",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityFinding {
    pub id: Id,
    pub task_id: Id,
    pub gate: GateKind,
    pub severity: Severity,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub message: String,
    pub recommendation: Option<String>,
}

// ---------------------------------------------------------------------------
// Cost
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: Id,
    pub project_id: Id,
    pub agent_id: Option<Id>,
    pub task_id: Option<Id>,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cents: i64,
    pub ts: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_moves_forward_only() {
        assert!(ProjectPhase::Discovery.can_transition_to(&ProjectPhase::Planning));
        assert!(ProjectPhase::Planning.can_transition_to(&ProjectPhase::Active));
        assert!(ProjectPhase::Active.can_transition_to(&ProjectPhase::Review));
        assert!(ProjectPhase::Active.can_transition_to(&ProjectPhase::Complete));
        assert!(!ProjectPhase::Planning.can_transition_to(&ProjectPhase::Discovery));
        assert!(!ProjectPhase::Active.can_transition_to(&ProjectPhase::Planning));
    }

    #[test]
    fn review_rework_is_the_only_backward_edge() {
        assert!(ProjectPhase::Review.can_transition_to(&ProjectPhase::Active));
        assert!(!ProjectPhase::Complete.can_transition_to(&ProjectPhase::Active));
    }

    #[test]
    fn any_non_terminal_phase_can_fail() {
        for phase in [
            ProjectPhase::Discovery,
            ProjectPhase::Planning,
            ProjectPhase::Active,
            ProjectPhase::Review,
        ] {
            assert!(phase.can_transition_to(&ProjectPhase::Failed));
        }
        assert!(!ProjectPhase::Complete.can_transition_to(&ProjectPhase::Failed));
        assert!(!ProjectPhase::Failed.can_transition_to(&ProjectPhase::Failed));
    }

    #[test]
    fn task_claim_requires_ready() {
        assert!(TaskStatus::Ready.can_transition_to(&TaskStatus::InProgress));
        assert!(!TaskStatus::Pending.can_transition_to(&TaskStatus::InProgress));
        assert!(!TaskStatus::Blocked.can_transition_to(&TaskStatus::InProgress));
    }

    #[test]
    fn task_retry_edge() {
        assert!(TaskStatus::InProgress.can_transition_to(&TaskStatus::Ready));
        assert!(TaskStatus::Blocked.can_transition_to(&TaskStatus::Ready));
        assert!(!TaskStatus::Completed.can_transition_to(&TaskStatus::InProgress));
    }

    #[test]
    fn excluded_is_terminal() {
        assert!(TaskStatus::Excluded.is_terminal());
        assert!(!TaskStatus::Excluded.can_transition_to(&TaskStatus::Ready));
        assert!(!TaskStatus::Excluded.can_transition_to(&TaskStatus::Pending));
    }

    #[test]
    fn severity_orders_critical_highest() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Info < Severity::Low);
    }

    #[test]
    fn gate_order_starts_with_review() {
        assert_eq!(GateKind::execution_order()[0], GateKind::Review);
        assert_eq!(GateKind::execution_order().len(), 5);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&GateKind::TypeCheck).unwrap(),
            "\"type_check\""
        );
        assert_eq!(
            serde_json::to_string(&SourceType::GitRemote).unwrap(),
            "\"git_remote\""
        );
    }

    #[test]
    fn pending_question_is_first_unanswered() {
        let now = Utc::now();
        let state = DiscoveryState {
            state: DiscoveryPhase::Discovering,
            questions: vec![
                DiscoveryQuestion {
                    id: 1,
                    project_id: 1,
                    text: "What does it do?".into(),
                    answer: Some("greets".into()),
                    asked_at: now,
                    answered_at: Some(now),
                },
                DiscoveryQuestion {
                    id: 2,
                    project_id: 1,
                    text: "Who uses it?".into(),
                    answer: None,
                    asked_at: now,
                    answered_at: None,
                },
            ],
            prd_status: PrdStatus::None,
            prd_content: None,
        };
        assert_eq!(state.pending_question().unwrap().id, 2);
    }
}
