//! Single-writer persistence for projects, tasks, agents, sessions, events,
//! checkpoints, findings, and cost records.
//!
//! All writes funnel through the async connection's call lane, which
//! serializes them on one thread; reads share the same lane and stay
//! consistent without extra locking. Status transitions are guarded
//! compare-and-set updates so concurrent scheduler decisions resolve here.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;

use crate::types::{
    AgentRecord, AgentRole, AgentStatus, Checkpoint, CostRecord, DiscoveryPhase,
    DiscoveryQuestion, DiscoveryState, EventRecord, GateKind, Id, PrdStatus, Project,
    ProjectPhase, QualityFinding, QualityGateStatus, SessionRecord, SessionStatus, Severity,
    SourceType, Task, TaskCounts, TaskStatus, DEFAULT_MAX_ATTEMPTS,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<tokio_rusqlite::Error> for StoreError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        StoreError::Persistence(e.to_string())
    }
}

/// Result of a guarded status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The row's current status did not match the expected `from` status.
    NotApplied,
}

impl Transition {
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}

// ---------------------------------------------------------------------------
// Change notifications
// ---------------------------------------------------------------------------

/// Emitted on every mutation so the event bus can fan out deltas.
#[derive(Debug, Clone)]
pub enum StoreChange {
    ProjectPhase {
        project_id: Id,
        from: ProjectPhase,
        to: ProjectPhase,
    },
    TaskStatus {
        project_id: Id,
        task_id: Id,
        from: TaskStatus,
        to: TaskStatus,
    },
    AgentCreated {
        project_id: Id,
        agent_id: Id,
        role: AgentRole,
    },
    AgentStatus {
        project_id: Id,
        agent_id: Id,
        from: AgentStatus,
        to: AgentStatus,
    },
    SessionStatus {
        project_id: Id,
        session_id: Id,
        status: SessionStatus,
    },
    CheckpointCreated {
        project_id: Id,
        checkpoint_id: Id,
        name: String,
    },
    CostRecorded {
        project_id: Id,
        agent_id: Option<Id>,
        task_id: Option<Id>,
        cents: i64,
    },
}

// ---------------------------------------------------------------------------
// Creation payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub description: String,
    pub source_type: SourceType,
    pub source_location: Option<String>,
    pub source_branch: Option<String>,
    pub workspace_path: String,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_number: String,
    pub title: String,
    pub description: String,
    /// Dependencies referenced by `task_number` within the same batch.
    pub depends_on_numbers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NewFinding {
    pub gate: GateKind,
    pub severity: Severity,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub message: String,
    pub recommendation: Option<String>,
}

/// Aggregated cost view for the metrics endpoint.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MetricsSummary {
    pub cost_total_cents: i64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub by_agent: Vec<AgentCost>,
    pub by_model: Vec<ModelCost>,
    pub trend: Vec<TrendPoint>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentCost {
    pub agent_id: Id,
    pub role: AgentRole,
    pub cents: i64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelCost {
    pub model: String,
    pub cents: i64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TrendPoint {
    /// Hour bucket, RFC 3339 truncated to the hour.
    pub hour: String,
    pub cents: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskComment {
    pub id: Id,
    pub task_id: Id,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// enum <-> SQLite text helpers
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_sql(raw: &str) -> DateTime<Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Connection,
    notify: Option<flume::Sender<StoreChange>>,
}

impl Store {
    /// Open (or create) the database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn, notify: None };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn, notify: None };
        store.init_schema().await?;
        Ok(store)
    }

    /// Attach the change-notification lane. Sends are non-blocking; a
    /// disconnected receiver never stalls the writer.
    pub fn with_notifier(mut self, tx: flume::Sender<StoreChange>) -> Self {
        self.notify = Some(tx);
        self
    }

    fn emit(&self, change: StoreChange) {
        if let Some(tx) = &self.notify {
            let _ = tx.send(change);
        }
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA foreign_keys=ON;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS projects (
                        id               INTEGER PRIMARY KEY AUTOINCREMENT,
                        name             TEXT NOT NULL,
                        description      TEXT NOT NULL,
                        source_type      TEXT NOT NULL,
                        source_location  TEXT,
                        source_branch    TEXT,
                        workspace_path   TEXT NOT NULL UNIQUE,
                        git_initialized  INTEGER NOT NULL DEFAULT 0,
                        current_commit   TEXT,
                        phase            TEXT NOT NULL,
                        discovery_state  TEXT NOT NULL,
                        prd_status       TEXT NOT NULL,
                        prd_content      TEXT,
                        created_at       TEXT NOT NULL,
                        updated_at       TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS discovery_questions (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        project_id  INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                        text        TEXT NOT NULL,
                        answer      TEXT,
                        asked_at    TEXT NOT NULL,
                        answered_at TEXT
                    );
                    CREATE INDEX IF NOT EXISTS idx_questions_project
                        ON discovery_questions(project_id);

                    CREATE TABLE IF NOT EXISTS tasks (
                        id              INTEGER PRIMARY KEY AUTOINCREMENT,
                        project_id      INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                        task_number     TEXT NOT NULL,
                        ord             INTEGER NOT NULL,
                        title           TEXT NOT NULL,
                        description     TEXT NOT NULL,
                        status          TEXT NOT NULL,
                        assigned_role   TEXT,
                        assigned_agent  INTEGER,
                        attempt_count   INTEGER NOT NULL DEFAULT 0,
                        max_attempts    INTEGER NOT NULL,
                        gate_status     TEXT NOT NULL,
                        artifacts       TEXT NOT NULL DEFAULT '[]',
                        created_at      TEXT NOT NULL,
                        updated_at      TEXT NOT NULL,
                        started_at      TEXT,
                        completed_at    TEXT,
                        UNIQUE(project_id, task_number)
                    );
                    CREATE INDEX IF NOT EXISTS idx_tasks_project_status
                        ON tasks(project_id, status);

                    CREATE TABLE IF NOT EXISTS task_deps (
                        task_id    INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                        depends_on INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                        PRIMARY KEY (task_id, depends_on)
                    );

                    CREATE TABLE IF NOT EXISTS task_comments (
                        id         INTEGER PRIMARY KEY AUTOINCREMENT,
                        task_id    INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                        author     TEXT NOT NULL,
                        body       TEXT NOT NULL,
                        created_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS agents (
                        id               INTEGER PRIMARY KEY AUTOINCREMENT,
                        project_id       INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                        role             TEXT NOT NULL,
                        status           TEXT NOT NULL,
                        current_task_id  INTEGER,
                        created_at       TEXT NOT NULL,
                        last_heartbeat   TEXT NOT NULL,
                        total_tokens_in  INTEGER NOT NULL DEFAULT 0,
                        total_tokens_out INTEGER NOT NULL DEFAULT 0,
                        total_cost_cents INTEGER NOT NULL DEFAULT 0
                    );
                    CREATE INDEX IF NOT EXISTS idx_agents_project ON agents(project_id);

                    CREATE TABLE IF NOT EXISTS sessions (
                        id             INTEGER PRIMARY KEY AUTOINCREMENT,
                        project_id     INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                        started_at     TEXT NOT NULL,
                        ended_at       TEXT,
                        status         TEXT NOT NULL,
                        last_iteration INTEGER NOT NULL DEFAULT 0,
                        watchdog_count INTEGER NOT NULL DEFAULT 0
                    );
                    CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id);

                    CREATE TABLE IF NOT EXISTS events (
                        id         INTEGER PRIMARY KEY AUTOINCREMENT,
                        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                        session_id INTEGER,
                        ts         TEXT NOT NULL,
                        kind       TEXT NOT NULL,
                        payload    TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_events_project ON events(project_id);

                    CREATE TABLE IF NOT EXISTS checkpoints (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        project_id  INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                        name        TEXT NOT NULL,
                        description TEXT,
                        git_sha     TEXT NOT NULL,
                        created_at  TEXT NOT NULL,
                        UNIQUE(project_id, name)
                    );

                    CREATE TABLE IF NOT EXISTS quality_findings (
                        id             INTEGER PRIMARY KEY AUTOINCREMENT,
                        task_id        INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                        gate           TEXT NOT NULL,
                        severity       TEXT NOT NULL,
                        file           TEXT,
                        line           INTEGER,
                        message        TEXT NOT NULL,
                        recommendation TEXT
                    );
                    CREATE INDEX IF NOT EXISTS idx_findings_task ON quality_findings(task_id);

                    CREATE TABLE IF NOT EXISTS cost_records (
                        id         INTEGER PRIMARY KEY AUTOINCREMENT,
                        project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                        agent_id   INTEGER,
                        task_id    INTEGER,
                        model      TEXT NOT NULL,
                        tokens_in  INTEGER NOT NULL,
                        tokens_out INTEGER NOT NULL,
                        cents      INTEGER NOT NULL,
                        ts         TEXT NOT NULL
                    );
                    CREATE INDEX IF NOT EXISTS idx_costs_project ON cost_records(project_id);
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub async fn create_project(&self, new: NewProject) -> Result<Project> {
        let now = ts_to_sql(&Utc::now());
        let source_type = enum_to_sql(&new.source_type);
        let phase = enum_to_sql(&ProjectPhase::Discovery);
        let discovery = enum_to_sql(&DiscoveryPhase::NotStarted);
        let prd = enum_to_sql(&PrdStatus::None);

        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO projects (name, description, source_type, source_location,
                        source_branch, workspace_path, git_initialized, phase,
                        discovery_state, prd_status, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,0,?7,?8,?9,?10,?10)",
                    rusqlite::params![
                        new.name,
                        new.description,
                        source_type,
                        new.source_location,
                        new.source_branch,
                        new.workspace_path,
                        phase,
                        discovery,
                        prd,
                        now,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        self.get_project(id).await
    }

    pub async fn get_project(&self, id: Id) -> Result<Project> {
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, source_type, source_location, source_branch,
                            workspace_path, git_initialized, current_commit, phase,
                            created_at, updated_at
                     FROM projects WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_project(row)?)),
                    None => Ok(None),
                }
            })
            .await?;
        row.ok_or_else(|| StoreError::NotFound(format!("project {}", id)))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, source_type, source_location, source_branch,
                            workspace_path, git_initialized, current_commit, phase,
                            created_at, updated_at
                     FROM projects ORDER BY id",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_project(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Guarded phase transition. Fails with `Conflict` when the transition
    /// is invalid or the project is no longer in `from`.
    pub async fn set_project_phase(
        &self,
        id: Id,
        from: ProjectPhase,
        to: ProjectPhase,
    ) -> Result<()> {
        if !from.can_transition_to(&to) {
            return Err(StoreError::Conflict(format!(
                "invalid phase transition {} -> {}",
                from, to
            )));
        }
        let from_sql = enum_to_sql(&from);
        let to_sql = enum_to_sql(&to);
        let now = ts_to_sql(&Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE projects SET phase = ?1, updated_at = ?2
                     WHERE id = ?3 AND phase = ?4",
                    rusqlite::params![to_sql, now, id, from_sql],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "project {} is not in phase {}",
                id, from
            )));
        }
        self.emit(StoreChange::ProjectPhase {
            project_id: id,
            from,
            to,
        });
        Ok(())
    }

    /// Rebind a project's workspace directory. Used once at creation, after
    /// the row id (which names the directory) is known.
    pub async fn set_project_workspace(&self, id: Id, path: &str) -> Result<()> {
        let path = path.to_string();
        let now = ts_to_sql(&Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE projects SET workspace_path = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![path, now, id],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("project {}", id)));
        }
        Ok(())
    }

    pub async fn set_project_commit(&self, id: Id, sha: &str) -> Result<()> {
        let sha = sha.to_string();
        let now = ts_to_sql(&Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE projects SET current_commit = ?1, git_initialized = 1, updated_at = ?2
                     WHERE id = ?3",
                    rusqlite::params![sha, now, id],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("project {}", id)));
        }
        Ok(())
    }

    /// Remove a project and every dependent row. Explicit delete is the only
    /// cleanup path for persisted rows.
    pub async fn delete_project(&self, id: Id) -> Result<()> {
        let changed = self
            .conn
            .call(move |conn| {
                let n =
                    conn.execute("DELETE FROM projects WHERE id = ?1", rusqlite::params![id])?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("project {}", id)));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    pub async fn set_discovery_phase(&self, project_id: Id, phase: DiscoveryPhase) -> Result<()> {
        let phase_sql = enum_to_sql(&phase);
        let now = ts_to_sql(&Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE projects SET discovery_state = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![phase_sql, now, project_id],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("project {}", project_id)));
        }
        Ok(())
    }

    /// Persist a new question. At most one unanswered question may exist at
    /// a time; a second ask is a `Conflict`.
    pub async fn ask_question(&self, project_id: Id, text: &str) -> Result<DiscoveryQuestion> {
        let stored_text = text.to_string();
        let now = Utc::now();
        let now_sql = ts_to_sql(&now);
        let id = self
            .conn
            .call(move |conn| {
                let pending: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM discovery_questions
                     WHERE project_id = ?1 AND answer IS NULL",
                    rusqlite::params![project_id],
                    |r| r.get(0),
                )?;
                if pending > 0 {
                    return Ok(None);
                }
                conn.execute(
                    "INSERT INTO discovery_questions (project_id, text, asked_at)
                     VALUES (?1, ?2, ?3)",
                    rusqlite::params![project_id, stored_text, now_sql],
                )?;
                Ok(Some(conn.last_insert_rowid()))
            })
            .await?;

        let id = id.ok_or_else(|| StoreError::Conflict("a question is already pending".into()))?;
        Ok(DiscoveryQuestion {
            id,
            project_id,
            text: text.to_string(),
            answer: None,
            asked_at: now,
            answered_at: None,
        })
    }

    /// Record the answer to the pending question. `Conflict` when no
    /// question is awaiting an answer.
    pub async fn answer_question(&self, project_id: Id, answer: &str) -> Result<DiscoveryQuestion> {
        let answer_text = answer.to_string();
        let now = Utc::now();
        let now_sql = ts_to_sql(&now);
        let updated = self
            .conn
            .call(move |conn| {
                let pending: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM discovery_questions
                         WHERE project_id = ?1 AND answer IS NULL
                         ORDER BY id LIMIT 1",
                        rusqlite::params![project_id],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some(qid) = pending else {
                    return Ok(None);
                };
                conn.execute(
                    "UPDATE discovery_questions SET answer = ?1, answered_at = ?2 WHERE id = ?3",
                    rusqlite::params![answer_text, now_sql, qid],
                )?;
                let q = conn.query_row(
                    "SELECT id, project_id, text, answer, asked_at, answered_at
                     FROM discovery_questions WHERE id = ?1",
                    rusqlite::params![qid],
                    row_to_question,
                )?;
                Ok(Some(q))
            })
            .await?;
        updated.ok_or_else(|| StoreError::Conflict("no pending question".into()))
    }

    pub async fn discovery_state(&self, project_id: Id) -> Result<DiscoveryState> {
        let state = self
            .conn
            .call(move |conn| {
                let scalar: Option<(String, String, Option<String>)> = conn
                    .query_row(
                        "SELECT discovery_state, prd_status, prd_content
                         FROM projects WHERE id = ?1",
                        rusqlite::params![project_id],
                        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some((discovery, prd_status, prd_content)) = scalar else {
                    return Ok(None);
                };

                let mut stmt = conn.prepare(
                    "SELECT id, project_id, text, answer, asked_at, answered_at
                     FROM discovery_questions WHERE project_id = ?1 ORDER BY id",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut questions = Vec::new();
                while let Some(row) = rows.next()? {
                    questions.push(row_to_question(row)?);
                }

                Ok(Some(DiscoveryState {
                    state: enum_from_sql(&discovery),
                    questions,
                    prd_status: enum_from_sql(&prd_status),
                    prd_content,
                }))
            })
            .await?;
        state.ok_or_else(|| StoreError::NotFound(format!("project {}", project_id)))
    }

    pub async fn set_prd_status(&self, project_id: Id, status: PrdStatus) -> Result<()> {
        self.set_prd(project_id, status, None).await
    }

    pub async fn set_prd(
        &self,
        project_id: Id,
        status: PrdStatus,
        content: Option<String>,
    ) -> Result<()> {
        let status_sql = enum_to_sql(&status);
        let now = ts_to_sql(&Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = match content {
                    Some(text) => conn.execute(
                        "UPDATE projects SET prd_status = ?1, prd_content = ?2, updated_at = ?3
                         WHERE id = ?4",
                        rusqlite::params![status_sql, text, now, project_id],
                    )?,
                    None => conn.execute(
                        "UPDATE projects SET prd_status = ?1, updated_at = ?2 WHERE id = ?3",
                        rusqlite::params![status_sql, now, project_id],
                    )?,
                };
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("project {}", project_id)));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Persist a decomposition as one transaction. Dependencies reference
    /// task numbers within the batch; an unknown number rolls the whole
    /// batch back. All tasks land as `pending`.
    pub async fn insert_tasks(&self, project_id: Id, batch: Vec<NewTask>) -> Result<Vec<Task>> {
        if batch.is_empty() {
            return Err(StoreError::Conflict("empty decomposition".into()));
        }
        let now = ts_to_sql(&Utc::now());
        let status = enum_to_sql(&TaskStatus::Pending);
        let gate = enum_to_sql(&QualityGateStatus::NotRun);

        let inserted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut ids_by_number: HashMap<String, Id> = HashMap::new();

                for (ord, task) in batch.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO tasks (project_id, task_number, ord, title, description,
                            status, max_attempts, gate_status, created_at, updated_at)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?9)",
                        rusqlite::params![
                            project_id,
                            task.task_number,
                            ord as i64,
                            task.title,
                            task.description,
                            status,
                            DEFAULT_MAX_ATTEMPTS,
                            gate,
                            now,
                        ],
                    )?;
                    ids_by_number.insert(task.task_number.clone(), tx.last_insert_rowid());
                }

                for task in &batch {
                    let task_id = ids_by_number[&task.task_number];
                    for dep_number in &task.depends_on_numbers {
                        let Some(dep_id) = ids_by_number.get(dep_number) else {
                            // unknown dependency, abort the whole batch
                            return Ok(None);
                        };
                        tx.execute(
                            "INSERT INTO task_deps (task_id, depends_on) VALUES (?1, ?2)",
                            rusqlite::params![task_id, dep_id],
                        )?;
                    }
                }

                tx.commit()?;
                Ok(Some(()))
            })
            .await?;

        if inserted.is_none() {
            return Err(StoreError::Conflict(
                "decomposition references an unknown task number".into(),
            ));
        }
        self.list_tasks(project_id).await
    }

    pub async fn list_tasks(&self, project_id: Id) -> Result<Vec<Task>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, task_number, title, description, status,
                            assigned_role, assigned_agent, attempt_count, max_attempts,
                            gate_status, artifacts, created_at, updated_at, started_at,
                            completed_at
                     FROM tasks WHERE project_id = ?1 ORDER BY ord",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut tasks = Vec::new();
                while let Some(row) = rows.next()? {
                    tasks.push(row_to_task(row)?);
                }

                let mut dep_stmt = conn.prepare(
                    "SELECT d.task_id, d.depends_on FROM task_deps d
                     JOIN tasks t ON t.id = d.task_id WHERE t.project_id = ?1",
                )?;
                let mut dep_rows = dep_stmt.query(rusqlite::params![project_id])?;
                let mut deps: HashMap<Id, Vec<Id>> = HashMap::new();
                while let Some(row) = dep_rows.next()? {
                    let task_id: Id = row.get(0)?;
                    let dep: Id = row.get(1)?;
                    deps.entry(task_id).or_default().push(dep);
                }
                for task in &mut tasks {
                    if let Some(d) = deps.remove(&task.id) {
                        task.depends_on = d;
                    }
                }
                Ok(tasks)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn get_task(&self, task_id: Id) -> Result<Task> {
        let task = self
            .conn
            .call(move |conn| {
                let task = conn
                    .query_row(
                        "SELECT id, project_id, task_number, title, description, status,
                                assigned_role, assigned_agent, attempt_count, max_attempts,
                                gate_status, artifacts, created_at, updated_at, started_at,
                                completed_at
                         FROM tasks WHERE id = ?1",
                        rusqlite::params![task_id],
                        row_to_task,
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some(mut task) = task else {
                    return Ok(None);
                };
                let mut stmt =
                    conn.prepare("SELECT depends_on FROM task_deps WHERE task_id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![task_id])?;
                while let Some(row) = rows.next()? {
                    task.depends_on.push(row.get(0)?);
                }
                Ok(Some(task))
            })
            .await?;
        task.ok_or_else(|| StoreError::NotFound(format!("task {}", task_id)))
    }

    pub async fn task_counts(&self, project_id: Id) -> Result<TaskCounts> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*) FROM tasks WHERE project_id = ?1 GROUP BY status",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut counts = TaskCounts::default();
                while let Some(row) = rows.next()? {
                    let status: String = row.get(0)?;
                    let n: u64 = row.get(1)?;
                    match enum_from_sql::<TaskStatus>(&status) {
                        TaskStatus::Pending => counts.pending = n,
                        TaskStatus::Ready => counts.ready = n,
                        TaskStatus::InProgress => counts.in_progress = n,
                        TaskStatus::Blocked => counts.blocked = n,
                        TaskStatus::Completed => counts.completed = n,
                        TaskStatus::Failed => counts.failed = n,
                        TaskStatus::Excluded => counts.excluded = n,
                    }
                }
                Ok(counts)
            })
            .await
            .map_err(Into::into)
    }

    /// Guarded task status update: applies only when the row is still in
    /// `from`. Invalid transitions are a `Conflict`; a lost race is
    /// `NotApplied`, never an error.
    pub async fn update_task_status(
        &self,
        task_id: Id,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<Transition> {
        if !from.can_transition_to(&to) {
            return Err(StoreError::Conflict(format!(
                "invalid task transition {} -> {}",
                from, to
            )));
        }
        let from_sql = enum_to_sql(&from);
        let to_sql = enum_to_sql(&to);
        let now = Utc::now();
        let now_sql = ts_to_sql(&now);
        let leaves_agent =
            to == TaskStatus::Ready || to == TaskStatus::Blocked || to.is_terminal();
        let completes = matches!(to, TaskStatus::Completed | TaskStatus::Failed);

        let result = self
            .conn
            .call(move |conn| {
                let mut sql = String::from("UPDATE tasks SET status = ?1, updated_at = ?2");
                if leaves_agent {
                    sql.push_str(", assigned_agent = NULL");
                }
                if completes {
                    sql.push_str(", completed_at = ?2");
                }
                sql.push_str(" WHERE id = ?3 AND status = ?4");
                let n = conn.execute(
                    &sql,
                    rusqlite::params![to_sql, now_sql, task_id, from_sql],
                )?;
                if n == 0 {
                    return Ok(None);
                }
                let project_id: Id = conn.query_row(
                    "SELECT project_id FROM tasks WHERE id = ?1",
                    rusqlite::params![task_id],
                    |r| r.get(0),
                )?;
                Ok(Some(project_id))
            })
            .await?;

        match result {
            Some(project_id) => {
                self.emit(StoreChange::TaskStatus {
                    project_id,
                    task_id,
                    from,
                    to,
                });
                Ok(Transition::Applied)
            }
            None => Ok(Transition::NotApplied),
        }
    }

    /// Atomically claim the oldest `ready` task for an agent: flips it to
    /// `in_progress`, assigns the agent, bumps the attempt counter, and
    /// stamps `started_at`. Exclusive under the writer lane — two callers
    /// can never claim the same task.
    pub async fn claim_ready_task(&self, project_id: Id, agent_id: Id) -> Result<Option<Task>> {
        let ready = enum_to_sql(&TaskStatus::Ready);
        let in_progress = enum_to_sql(&TaskStatus::InProgress);
        let now_sql = ts_to_sql(&Utc::now());

        let claimed = self
            .conn
            .call(move |conn| {
                let candidate: Option<Id> = conn
                    .query_row(
                        "SELECT id FROM tasks
                         WHERE project_id = ?1 AND status = ?2
                         ORDER BY ord LIMIT 1",
                        rusqlite::params![project_id, ready],
                        |r| r.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;
                let Some(task_id) = candidate else {
                    return Ok(None);
                };
                let n = conn.execute(
                    "UPDATE tasks SET status = ?1, assigned_agent = ?2,
                        attempt_count = attempt_count + 1,
                        started_at = COALESCE(started_at, ?3), updated_at = ?3
                     WHERE id = ?4 AND status = ?5",
                    rusqlite::params![in_progress, agent_id, now_sql, task_id, ready],
                )?;
                if n == 0 {
                    return Ok(None);
                }
                Ok(Some(task_id))
            })
            .await?;

        let Some(task_id) = claimed else {
            return Ok(None);
        };
        self.emit(StoreChange::TaskStatus {
            project_id,
            task_id,
            from: TaskStatus::Ready,
            to: TaskStatus::InProgress,
        });
        Ok(Some(self.get_task(task_id).await?))
    }

    /// Claim one specific `ready` task for an agent. Same effects as
    /// [`Store::claim_ready_task`] but targeted, for the scheduler path
    /// where the role was assigned per task before the slot was acquired.
    pub async fn claim_task(&self, task_id: Id, agent_id: Id) -> Result<Transition> {
        let ready = enum_to_sql(&TaskStatus::Ready);
        let in_progress = enum_to_sql(&TaskStatus::InProgress);
        let now_sql = ts_to_sql(&Utc::now());
        let result = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET status = ?1, assigned_agent = ?2,
                        attempt_count = attempt_count + 1,
                        started_at = COALESCE(started_at, ?3), updated_at = ?3
                     WHERE id = ?4 AND status = ?5",
                    rusqlite::params![in_progress, agent_id, now_sql, task_id, ready],
                )?;
                if n == 0 {
                    return Ok(None);
                }
                let project_id: Id = conn.query_row(
                    "SELECT project_id FROM tasks WHERE id = ?1",
                    rusqlite::params![task_id],
                    |r| r.get(0),
                )?;
                Ok(Some(project_id))
            })
            .await?;
        match result {
            Some(project_id) => {
                self.emit(StoreChange::TaskStatus {
                    project_id,
                    task_id,
                    from: TaskStatus::Ready,
                    to: TaskStatus::InProgress,
                });
                Ok(Transition::Applied)
            }
            None => Ok(Transition::NotApplied),
        }
    }

    /// Apply an approval: excluded tasks become `excluded`, then every
    /// `pending` task whose dependencies are all `completed` or `excluded`
    /// becomes `ready`. One transaction; returns `(ready_ids, excluded_ids)`.
    pub async fn apply_approval(
        &self,
        project_id: Id,
        excluded_task_ids: &[Id],
    ) -> Result<(Vec<Id>, Vec<Id>)> {
        let excluded_set: Vec<Id> = excluded_task_ids.to_vec();
        let pending = enum_to_sql(&TaskStatus::Pending);
        let ready = enum_to_sql(&TaskStatus::Ready);
        let excluded = enum_to_sql(&TaskStatus::Excluded);
        let completed = enum_to_sql(&TaskStatus::Completed);
        let now_sql = ts_to_sql(&Utc::now());

        let (readied, excluded_applied) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut excluded_applied = Vec::new();
                for task_id in &excluded_set {
                    let n = tx.execute(
                        "UPDATE tasks SET status = ?1, updated_at = ?2, completed_at = ?2
                         WHERE id = ?3 AND project_id = ?4 AND status = ?5",
                        rusqlite::params![excluded, now_sql, task_id, project_id, pending],
                    )?;
                    if n > 0 {
                        excluded_applied.push(*task_id);
                    }
                }

                let mut readied = Vec::new();
                {
                    let mut stmt = tx.prepare(
                        "SELECT t.id FROM tasks t
                         WHERE t.project_id = ?1 AND t.status = ?2
                           AND NOT EXISTS (
                               SELECT 1 FROM task_deps d
                               JOIN tasks dep ON dep.id = d.depends_on
                               WHERE d.task_id = t.id
                                 AND dep.status NOT IN (?3, ?4)
                           )
                         ORDER BY t.ord",
                    )?;
                    let mut rows =
                        stmt.query(rusqlite::params![project_id, pending, completed, excluded])?;
                    while let Some(row) = rows.next()? {
                        readied.push(row.get::<_, Id>(0)?);
                    }
                }
                for task_id in &readied {
                    tx.execute(
                        "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
                        rusqlite::params![ready, now_sql, task_id],
                    )?;
                }
                tx.commit()?;
                Ok((readied, excluded_applied))
            })
            .await?;

        for task_id in &excluded_applied {
            self.emit(StoreChange::TaskStatus {
                project_id,
                task_id: *task_id,
                from: TaskStatus::Pending,
                to: TaskStatus::Excluded,
            });
        }
        for task_id in &readied {
            self.emit(StoreChange::TaskStatus {
                project_id,
                task_id: *task_id,
                from: TaskStatus::Pending,
                to: TaskStatus::Ready,
            });
        }
        Ok((readied, excluded_applied))
    }

    pub async fn set_task_role(&self, task_id: Id, role: AgentRole) -> Result<()> {
        let role_sql = enum_to_sql(&role);
        let now = ts_to_sql(&Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET assigned_role = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![role_sql, now, task_id],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("task {}", task_id)));
        }
        Ok(())
    }

    pub async fn set_task_gate_status(
        &self,
        task_id: Id,
        status: QualityGateStatus,
    ) -> Result<()> {
        let status_sql = enum_to_sql(&status);
        let now = ts_to_sql(&Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET gate_status = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![status_sql, now, task_id],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("task {}", task_id)));
        }
        Ok(())
    }

    pub async fn set_task_artifacts(&self, task_id: Id, artifacts: &[String]) -> Result<()> {
        let json = serde_json::to_string(artifacts)
            .map_err(|e| StoreError::Persistence(e.to_string()))?;
        let now = ts_to_sql(&Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tasks SET artifacts = ?1, updated_at = ?2 WHERE id = ?3",
                    rusqlite::params![json, now, task_id],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("task {}", task_id)));
        }
        Ok(())
    }

    pub async fn add_task_comment(&self, task_id: Id, author: &str, body: &str) -> Result<()> {
        let author = author.to_string();
        let body = body.to_string();
        let now = ts_to_sql(&Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO task_comments (task_id, author, body, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![task_id, author, body, now],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_task_comments(&self, task_id: Id) -> Result<Vec<TaskComment>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, author, body, created_at
                     FROM task_comments WHERE task_id = ?1 ORDER BY id",
                )?;
                let mut rows = stmt.query(rusqlite::params![task_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let created_at: String = row.get(4)?;
                    out.push(TaskComment {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        author: row.get(2)?,
                        body: row.get(3)?,
                        created_at: ts_from_sql(&created_at),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub async fn create_agent(&self, project_id: Id, role: AgentRole) -> Result<AgentRecord> {
        let role_sql = enum_to_sql(&role);
        let status = enum_to_sql(&AgentStatus::Idle);
        let now = ts_to_sql(&Utc::now());
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (project_id, role, status, created_at, last_heartbeat)
                     VALUES (?1, ?2, ?3, ?4, ?4)",
                    rusqlite::params![project_id, role_sql, status, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        self.emit(StoreChange::AgentCreated {
            project_id,
            agent_id: id,
            role,
        });
        self.get_agent(id).await
    }

    pub async fn get_agent(&self, agent_id: Id) -> Result<AgentRecord> {
        let agent = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT id, project_id, role, status, current_task_id, created_at,
                            last_heartbeat, total_tokens_in, total_tokens_out, total_cost_cents
                     FROM agents WHERE id = ?1",
                    rusqlite::params![agent_id],
                    row_to_agent,
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?)
            })
            .await?;
        agent.ok_or_else(|| StoreError::NotFound(format!("agent {}", agent_id)))
    }

    pub async fn list_agents(&self, project_id: Id) -> Result<Vec<AgentRecord>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, role, status, current_task_id, created_at,
                            last_heartbeat, total_tokens_in, total_tokens_out, total_cost_cents
                     FROM agents WHERE project_id = ?1 ORDER BY id",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Guarded agent status update; optionally rebinds `current_task_id`
    /// in the same statement.
    pub async fn update_agent_status(
        &self,
        agent_id: Id,
        from: AgentStatus,
        to: AgentStatus,
        current_task_id: Option<Id>,
    ) -> Result<Transition> {
        if !from.can_transition_to(&to) {
            return Err(StoreError::Conflict(format!(
                "invalid agent transition {:?} -> {:?}",
                from, to
            )));
        }
        let from_sql = enum_to_sql(&from);
        let to_sql = enum_to_sql(&to);
        let now = ts_to_sql(&Utc::now());
        let result = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE agents SET status = ?1, current_task_id = ?2, last_heartbeat = ?3
                     WHERE id = ?4 AND status = ?5",
                    rusqlite::params![to_sql, current_task_id, now, agent_id, from_sql],
                )?;
                if n == 0 {
                    return Ok(None);
                }
                let project_id: Id = conn.query_row(
                    "SELECT project_id FROM agents WHERE id = ?1",
                    rusqlite::params![agent_id],
                    |r| r.get(0),
                )?;
                Ok(Some(project_id))
            })
            .await?;
        match result {
            Some(project_id) => {
                self.emit(StoreChange::AgentStatus {
                    project_id,
                    agent_id,
                    from,
                    to,
                });
                Ok(Transition::Applied)
            }
            None => Ok(Transition::NotApplied),
        }
    }

    /// Add token/cost usage to an agent's running totals.
    pub async fn add_agent_usage(
        &self,
        agent_id: Id,
        tokens_in: u64,
        tokens_out: u64,
        cents: i64,
    ) -> Result<()> {
        let now = ts_to_sql(&Utc::now());
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE agents SET total_tokens_in = total_tokens_in + ?1,
                        total_tokens_out = total_tokens_out + ?2,
                        total_cost_cents = total_cost_cents + ?3,
                        last_heartbeat = ?4
                     WHERE id = ?5",
                    rusqlite::params![tokens_in as i64, tokens_out as i64, cents, now, agent_id],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("agent {}", agent_id)));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Create a session for a project. At most one live (`active` or
    /// `paused`) session may exist per project.
    pub async fn create_session(&self, project_id: Id) -> Result<SessionRecord> {
        let active = enum_to_sql(&SessionStatus::Active);
        let paused = enum_to_sql(&SessionStatus::Paused);
        let now = ts_to_sql(&Utc::now());
        let id = self
            .conn
            .call(move |conn| {
                let live: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sessions
                     WHERE project_id = ?1 AND status IN (?2, ?3)",
                    rusqlite::params![project_id, active, paused],
                    |r| r.get(0),
                )?;
                if live > 0 {
                    return Ok(None);
                }
                conn.execute(
                    "INSERT INTO sessions (project_id, started_at, status) VALUES (?1, ?2, ?3)",
                    rusqlite::params![project_id, now, active],
                )?;
                Ok(Some(conn.last_insert_rowid()))
            })
            .await?;
        let id = id.ok_or_else(|| {
            StoreError::Conflict(format!("project {} already has a live session", project_id))
        })?;
        self.emit(StoreChange::SessionStatus {
            project_id,
            session_id: id,
            status: SessionStatus::Active,
        });
        self.get_session(id).await
    }

    pub async fn get_session(&self, session_id: Id) -> Result<SessionRecord> {
        let session = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT id, project_id, started_at, ended_at, status, last_iteration,
                            watchdog_count
                     FROM sessions WHERE id = ?1",
                    rusqlite::params![session_id],
                    row_to_session,
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?)
            })
            .await?;
        session.ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))
    }

    /// The live session (active or paused) for a project, if any.
    pub async fn live_session(&self, project_id: Id) -> Result<Option<SessionRecord>> {
        let active = enum_to_sql(&SessionStatus::Active);
        let paused = enum_to_sql(&SessionStatus::Paused);
        self.conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT id, project_id, started_at, ended_at, status, last_iteration,
                            watchdog_count
                     FROM sessions WHERE project_id = ?1 AND status IN (?2, ?3)
                     ORDER BY id DESC LIMIT 1",
                    rusqlite::params![project_id, active, paused],
                    row_to_session,
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn set_session_status(&self, session_id: Id, status: SessionStatus) -> Result<()> {
        let status_sql = enum_to_sql(&status);
        let now = ts_to_sql(&Utc::now());
        let terminal = status.is_terminal();
        let project_id = self
            .conn
            .call(move |conn| {
                let n = if terminal {
                    conn.execute(
                        "UPDATE sessions SET status = ?1, ended_at = ?2 WHERE id = ?3",
                        rusqlite::params![status_sql, now, session_id],
                    )?
                } else {
                    conn.execute(
                        "UPDATE sessions SET status = ?1 WHERE id = ?2",
                        rusqlite::params![status_sql, session_id],
                    )?
                };
                if n == 0 {
                    return Ok(None);
                }
                let project_id: Id = conn.query_row(
                    "SELECT project_id FROM sessions WHERE id = ?1",
                    rusqlite::params![session_id],
                    |r| r.get(0),
                )?;
                Ok(Some(project_id))
            })
            .await?;
        let project_id = project_id
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;
        self.emit(StoreChange::SessionStatus {
            project_id,
            session_id,
            status,
        });
        Ok(())
    }

    pub async fn bump_session_iteration(
        &self,
        session_id: Id,
        iteration: u64,
        watchdog_count: u64,
    ) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE sessions SET last_iteration = ?1, watchdog_count = ?2 WHERE id = ?3",
                    rusqlite::params![iteration as i64, watchdog_count as i64, session_id],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub async fn append_event(
        &self,
        project_id: Id,
        session_id: Option<Id>,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<EventRecord> {
        let kind_owned = kind.to_string();
        let payload_text = payload.to_string();
        let now = Utc::now();
        let now_sql = ts_to_sql(&now);
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO events (project_id, session_id, ts, kind, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![project_id, session_id, now_sql, kind_owned, payload_text],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(EventRecord {
            id,
            project_id,
            session_id,
            ts: now,
            kind: kind.to_string(),
            payload,
        })
    }

    pub async fn recent_events(&self, project_id: Id, limit: usize) -> Result<Vec<EventRecord>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, session_id, ts, kind, payload
                     FROM events WHERE project_id = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id, limit as i64])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let ts: String = row.get(3)?;
                    let payload: String = row.get(5)?;
                    out.push(EventRecord {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        session_id: row.get(2)?,
                        ts: ts_from_sql(&ts),
                        kind: row.get(4)?,
                        payload: serde_json::from_str(&payload)
                            .unwrap_or(serde_json::Value::Null),
                    });
                }
                out.reverse();
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    pub async fn create_checkpoint(
        &self,
        project_id: Id,
        name: &str,
        description: Option<String>,
        git_sha: &str,
    ) -> Result<Checkpoint> {
        let name_owned = name.to_string();
        let sha = git_sha.to_string();
        let now = ts_to_sql(&Utc::now());
        let id = self
            .conn
            .call(move |conn| {
                match conn.execute(
                    "INSERT INTO checkpoints (project_id, name, description, git_sha, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![project_id, name_owned, description, sha, now],
                ) {
                    Ok(_) => Ok(Some(conn.last_insert_rowid())),
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await?;
        let id = id.ok_or_else(|| {
            StoreError::Conflict(format!("checkpoint name '{}' already exists", name))
        })?;
        self.emit(StoreChange::CheckpointCreated {
            project_id,
            checkpoint_id: id,
            name: name.to_string(),
        });
        self.get_checkpoint(id).await
    }

    pub async fn get_checkpoint(&self, checkpoint_id: Id) -> Result<Checkpoint> {
        let row = self
            .conn
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT id, project_id, name, description, git_sha, created_at
                     FROM checkpoints WHERE id = ?1",
                    rusqlite::params![checkpoint_id],
                    row_to_checkpoint,
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?)
            })
            .await?;
        row.ok_or_else(|| StoreError::NotFound(format!("checkpoint {}", checkpoint_id)))
    }

    pub async fn delete_checkpoint(&self, checkpoint_id: Id) -> Result<()> {
        let changed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM checkpoints WHERE id = ?1",
                    rusqlite::params![checkpoint_id],
                )?;
                Ok(n)
            })
            .await?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("checkpoint {}", checkpoint_id)));
        }
        Ok(())
    }

    pub async fn list_checkpoints(&self, project_id: Id) -> Result<Vec<Checkpoint>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, name, description, git_sha, created_at
                     FROM checkpoints WHERE project_id = ?1 ORDER BY id",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_checkpoint(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Quality findings
    // -----------------------------------------------------------------------

    pub async fn insert_findings(&self, task_id: Id, findings: Vec<NewFinding>) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for f in &findings {
                    tx.execute(
                        "INSERT INTO quality_findings
                            (task_id, gate, severity, file, line, message, recommendation)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        rusqlite::params![
                            task_id,
                            enum_to_sql(&f.gate),
                            enum_to_sql(&f.severity),
                            f.file,
                            f.line,
                            f.message,
                            f.recommendation,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_findings(&self, task_id: Id) -> Result<Vec<QualityFinding>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, task_id, gate, severity, file, line, message, recommendation
                     FROM quality_findings WHERE task_id = ?1 ORDER BY id",
                )?;
                let mut rows = stmt.query(rusqlite::params![task_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let gate: String = row.get(2)?;
                    let severity: String = row.get(3)?;
                    out.push(QualityFinding {
                        id: row.get(0)?,
                        task_id: row.get(1)?,
                        gate: enum_from_sql(&gate),
                        severity: enum_from_sql(&severity),
                        file: row.get(4)?,
                        line: row.get(5)?,
                        message: row.get(6)?,
                        recommendation: row.get(7)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Costs & metrics
    // -----------------------------------------------------------------------

    pub async fn record_cost(
        &self,
        project_id: Id,
        agent_id: Option<Id>,
        task_id: Option<Id>,
        model: &str,
        tokens_in: u64,
        tokens_out: u64,
        cents: i64,
    ) -> Result<CostRecord> {
        let model_owned = model.to_string();
        let now = Utc::now();
        let now_sql = ts_to_sql(&now);
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO cost_records
                        (project_id, agent_id, task_id, model, tokens_in, tokens_out, cents, ts)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        project_id,
                        agent_id,
                        task_id,
                        model_owned,
                        tokens_in as i64,
                        tokens_out as i64,
                        cents,
                        now_sql,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        self.emit(StoreChange::CostRecorded {
            project_id,
            agent_id,
            task_id,
            cents,
        });
        Ok(CostRecord {
            id,
            project_id,
            agent_id,
            task_id,
            model: model.to_string(),
            tokens_in,
            tokens_out,
            cents,
            ts: now,
        })
    }

    /// Aggregate cost and token usage for a project, optionally limited to
    /// the last `range_hours` hours.
    pub async fn metrics(&self, project_id: Id, range_hours: Option<u32>) -> Result<MetricsSummary> {
        let cutoff = range_hours
            .map(|h| ts_to_sql(&(Utc::now() - chrono::Duration::hours(h as i64))));
        self.conn
            .call(move |conn| {
                let (filter, params): (&str, Vec<Box<dyn rusqlite::ToSql>>) = match &cutoff {
                    Some(ts) => (
                        "WHERE c.project_id = ?1 AND c.ts >= ?2",
                        vec![Box::new(project_id), Box::new(ts.clone())],
                    ),
                    None => ("WHERE c.project_id = ?1", vec![Box::new(project_id)]),
                };
                let params_ref: Vec<&dyn rusqlite::ToSql> =
                    params.iter().map(|p| p.as_ref()).collect();

                let mut summary = MetricsSummary::default();

                let totals_sql = format!(
                    "SELECT COALESCE(SUM(c.cents),0), COALESCE(SUM(c.tokens_in),0),
                            COALESCE(SUM(c.tokens_out),0)
                     FROM cost_records c {}",
                    filter
                );
                let (cents, tin, tout): (i64, i64, i64) =
                    conn.query_row(&totals_sql, params_ref.as_slice(), |r| {
                        Ok((r.get(0)?, r.get(1)?, r.get(2)?))
                    })?;
                summary.cost_total_cents = cents;
                summary.tokens_in = tin as u64;
                summary.tokens_out = tout as u64;

                let by_agent_sql = format!(
                    "SELECT c.agent_id, a.role, SUM(c.cents), SUM(c.tokens_in), SUM(c.tokens_out)
                     FROM cost_records c JOIN agents a ON a.id = c.agent_id
                     {} AND c.agent_id IS NOT NULL
                     GROUP BY c.agent_id, a.role ORDER BY SUM(c.cents) DESC",
                    filter
                );
                let mut stmt = conn.prepare(&by_agent_sql)?;
                let mut rows = stmt.query(params_ref.as_slice())?;
                while let Some(row) = rows.next()? {
                    let role: String = row.get(1)?;
                    summary.by_agent.push(AgentCost {
                        agent_id: row.get(0)?,
                        role: enum_from_sql(&role),
                        cents: row.get(2)?,
                        tokens_in: row.get::<_, i64>(3)? as u64,
                        tokens_out: row.get::<_, i64>(4)? as u64,
                    });
                }

                let by_model_sql = format!(
                    "SELECT c.model, SUM(c.cents), SUM(c.tokens_in), SUM(c.tokens_out)
                     FROM cost_records c {}
                     GROUP BY c.model ORDER BY SUM(c.cents) DESC",
                    filter
                );
                let mut stmt = conn.prepare(&by_model_sql)?;
                let mut rows = stmt.query(params_ref.as_slice())?;
                while let Some(row) = rows.next()? {
                    summary.by_model.push(ModelCost {
                        model: row.get(0)?,
                        cents: row.get(1)?,
                        tokens_in: row.get::<_, i64>(2)? as u64,
                        tokens_out: row.get::<_, i64>(3)? as u64,
                    });
                }

                let trend_sql = format!(
                    "SELECT substr(c.ts, 1, 13) AS hour, SUM(c.cents)
                     FROM cost_records c {}
                     GROUP BY hour ORDER BY hour",
                    filter
                );
                let mut stmt = conn.prepare(&trend_sql)?;
                let mut rows = stmt.query(params_ref.as_slice())?;
                while let Some(row) = rows.next()? {
                    summary.trend.push(TrendPoint {
                        hour: row.get(0)?,
                        cents: row.get(1)?,
                    });
                }

                Ok(summary)
            })
            .await
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let source_type: String = row.get(3)?;
    let phase: String = row.get(9)?;
    let created_at: String = row.get(10)?;
    let updated_at: String = row.get(11)?;
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        source_type: enum_from_sql(&source_type),
        source_location: row.get(4)?,
        source_branch: row.get(5)?,
        workspace_path: row.get(6)?,
        git_initialized: row.get::<_, i64>(7)? != 0,
        current_commit: row.get(8)?,
        phase: enum_from_sql(&phase),
        created_at: ts_from_sql(&created_at),
        updated_at: ts_from_sql(&updated_at),
    })
}

fn row_to_question(row: &rusqlite::Row<'_>) -> rusqlite::Result<DiscoveryQuestion> {
    let asked_at: String = row.get(4)?;
    let answered_at: Option<String> = row.get(5)?;
    Ok(DiscoveryQuestion {
        id: row.get(0)?,
        project_id: row.get(1)?,
        text: row.get(2)?,
        answer: row.get(3)?,
        asked_at: ts_from_sql(&asked_at),
        answered_at: answered_at.map(|s| ts_from_sql(&s)),
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(5)?;
    let role: Option<String> = row.get(6)?;
    let gate: String = row.get(10)?;
    let artifacts: String = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;
    let started_at: Option<String> = row.get(14)?;
    let completed_at: Option<String> = row.get(15)?;
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        task_number: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        status: enum_from_sql(&status),
        depends_on: Vec::new(),
        assigned_role: role.map(|r| enum_from_sql(&r)),
        assigned_agent_id: row.get(7)?,
        attempt_count: row.get::<_, i64>(8)? as u32,
        max_attempts: row.get::<_, i64>(9)? as u32,
        quality_gate_status: enum_from_sql(&gate),
        artifacts: serde_json::from_str(&artifacts).unwrap_or_default(),
        created_at: ts_from_sql(&created_at),
        updated_at: ts_from_sql(&updated_at),
        started_at: started_at.map(|s| ts_from_sql(&s)),
        completed_at: completed_at.map(|s| ts_from_sql(&s)),
    })
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    let role: String = row.get(2)?;
    let status: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    let last_heartbeat: String = row.get(6)?;
    Ok(AgentRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        role: enum_from_sql(&role),
        status: enum_from_sql(&status),
        current_task_id: row.get(4)?,
        created_at: ts_from_sql(&created_at),
        last_heartbeat: ts_from_sql(&last_heartbeat),
        total_tokens_in: row.get::<_, i64>(7)? as u64,
        total_tokens_out: row.get::<_, i64>(8)? as u64,
        total_cost_cents: row.get(9)?,
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let started_at: String = row.get(2)?;
    let ended_at: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        started_at: ts_from_sql(&started_at),
        ended_at: ended_at.map(|s| ts_from_sql(&s)),
        status: enum_from_sql(&status),
        last_iteration: row.get::<_, i64>(5)? as u64,
        watchdog_count: row.get::<_, i64>(6)? as u64,
    })
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
    let created_at: String = row.get(5)?;
    Ok(Checkpoint {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        git_sha: row.get(4)?,
        created_at: ts_from_sql(&created_at),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
