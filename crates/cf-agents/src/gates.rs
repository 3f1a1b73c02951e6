//! Post-task quality gates.
//!
//! Five gates run in a fixed order (review first); execution short-circuits
//! on the first critical finding and records the remaining gates as
//! skipped. The overall result passes iff every non-skipped gate passed and
//! no finding is critical. Gate executors are injected — the defaults are
//! static checks over the task's artifacts, and tests swap in scripted
//! executors keyed by the same enum.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use cf_bridge::protocol::{GateRunStatus, GateSummary};
use cf_core::store::NewFinding;
use cf_core::types::{GateKind, Severity, Task};

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub status: GateRunStatus,
    pub findings: Vec<NewFinding>,
    pub duration_ms: u64,
}

impl GateOutcome {
    pub fn passed() -> Self {
        Self {
            status: GateRunStatus::Passed,
            findings: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn failed(findings: Vec<NewFinding>) -> Self {
        Self {
            status: GateRunStatus::Failed,
            findings,
            duration_ms: 0,
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: GateRunStatus::Skipped,
            findings: Vec::new(),
            duration_ms: 0,
        }
    }

    fn has_critical(&self) -> bool {
        self.findings
            .iter()
            .any(|f| f.severity == Severity::Critical)
    }
}

/// Result of running the full gate chain for one task.
#[derive(Debug, Clone)]
pub struct GateReport {
    pub passed: bool,
    pub results: Vec<(GateKind, GateOutcome)>,
}

impl GateReport {
    pub fn summaries(&self) -> Vec<GateSummary> {
        self.results
            .iter()
            .map(|(kind, outcome)| GateSummary {
                gate: *kind,
                status: outcome.status,
                findings: outcome.findings.len() as u32,
                duration_ms: outcome.duration_ms,
            })
            .collect()
    }

    pub fn findings(&self) -> Vec<NewFinding> {
        self.results
            .iter()
            .flat_map(|(_, outcome)| outcome.findings.iter().cloned())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// GateExecutor
// ---------------------------------------------------------------------------

#[async_trait]
pub trait GateExecutor: Send + Sync {
    fn kind(&self) -> GateKind;

    /// Run this gate. `worker_findings` carries what the review worker
    /// reported for the task, if any.
    async fn run(
        &self,
        task: &Task,
        workspace: &Path,
        worker_findings: &[NewFinding],
    ) -> GateOutcome;
}

// ---------------------------------------------------------------------------
// QualityGate
// ---------------------------------------------------------------------------

pub struct QualityGate {
    executors: HashMap<GateKind, Arc<dyn GateExecutor>>,
}

impl QualityGate {
    pub fn from_executors(executors: Vec<Arc<dyn GateExecutor>>) -> Self {
        Self {
            executors: executors.into_iter().map(|e| (e.kind(), e)).collect(),
        }
    }

    pub fn with_default_executors() -> Self {
        Self::from_executors(vec![
            Arc::new(ReviewGate),
            Arc::new(TestsGate),
            Arc::new(CoverageGate),
            Arc::new(TypeCheckGate),
            Arc::new(LintGate),
        ])
    }

    /// Run all gates in execution order with the critical short-circuit.
    pub async fn run_all(
        &self,
        task: &Task,
        workspace: &Path,
        worker_findings: &[NewFinding],
    ) -> GateReport {
        let mut results = Vec::with_capacity(GateKind::execution_order().len());
        let mut short_circuited = false;
        let mut passed = true;

        for kind in GateKind::execution_order() {
            if short_circuited {
                results.push((*kind, GateOutcome::skipped()));
                continue;
            }
            let outcome = match self.executors.get(kind) {
                Some(executor) => {
                    let start = Instant::now();
                    let mut outcome = executor.run(task, workspace, worker_findings).await;
                    outcome.duration_ms = start.elapsed().as_millis() as u64;
                    outcome
                }
                None => GateOutcome::skipped(),
            };

            if outcome.has_critical() {
                short_circuited = true;
                passed = false;
            }
            if outcome.status == GateRunStatus::Failed {
                passed = false;
            }
            tracing::debug!(
                task_id = task.id,
                gate = %kind,
                status = ?outcome.status,
                findings = outcome.findings.len(),
                "gate finished"
            );
            results.push((*kind, outcome));
        }

        GateReport { passed, results }
    }
}

// ---------------------------------------------------------------------------
// Default executors — static checks over artifacts
// ---------------------------------------------------------------------------

async fn read_artifact(workspace: &Path, rel: &str) -> Option<String> {
    tokio::fs::read_to_string(workspace.join(rel)).await.ok()
}

/// Judges the review worker's findings and scans artifacts for leftover
/// merge-conflict markers.
pub struct ReviewGate;

#[async_trait]
impl GateExecutor for ReviewGate {
    fn kind(&self) -> GateKind {
        GateKind::Review
    }

    async fn run(
        &self,
        task: &Task,
        workspace: &Path,
        worker_findings: &[NewFinding],
    ) -> GateOutcome {
        let mut findings: Vec<NewFinding> = worker_findings.to_vec();
        for rel in &task.artifacts {
            if let Some(content) = read_artifact(workspace, rel).await {
                if content.contains("<<<<<<<") {
                    findings.push(NewFinding {
                        gate: GateKind::Review,
                        severity: Severity::Critical,
                        file: Some(rel.clone()),
                        line: None,
                        message: "unresolved merge conflict marker".into(),
                        recommendation: Some("resolve the conflict and re-run".into()),
                    });
                }
            }
        }
        let failed = findings
            .iter()
            .any(|f| matches!(f.severity, Severity::Critical | Severity::High));
        if failed {
            GateOutcome::failed(findings)
        } else {
            GateOutcome {
                status: GateRunStatus::Passed,
                findings,
                duration_ms: 0,
            }
        }
    }
}

/// Passes when the task delivered test files; skips otherwise (no external
/// test runner is wired into the core).
pub struct TestsGate;

#[async_trait]
impl GateExecutor for TestsGate {
    fn kind(&self) -> GateKind {
        GateKind::Tests
    }

    async fn run(&self, task: &Task, _workspace: &Path, _worker: &[NewFinding]) -> GateOutcome {
        let has_tests = task
            .artifacts
            .iter()
            .any(|p| p.contains("test") || p.contains("spec"));
        if has_tests {
            GateOutcome::passed()
        } else {
            GateOutcome::skipped()
        }
    }
}

/// No coverage tooling in the core; always skipped.
pub struct CoverageGate;

#[async_trait]
impl GateExecutor for CoverageGate {
    fn kind(&self) -> GateKind {
        GateKind::Coverage
    }

    async fn run(&self, _task: &Task, _workspace: &Path, _worker: &[NewFinding]) -> GateOutcome {
        GateOutcome::skipped()
    }
}

/// Sanity pass over artifacts: an empty delivered file fails the gate.
pub struct TypeCheckGate;

#[async_trait]
impl GateExecutor for TypeCheckGate {
    fn kind(&self) -> GateKind {
        GateKind::TypeCheck
    }

    async fn run(&self, task: &Task, workspace: &Path, _worker: &[NewFinding]) -> GateOutcome {
        let mut findings = Vec::new();
        for rel in &task.artifacts {
            match read_artifact(workspace, rel).await {
                Some(content) if content.trim().is_empty() => findings.push(NewFinding {
                    gate: GateKind::TypeCheck,
                    severity: Severity::High,
                    file: Some(rel.clone()),
                    line: None,
                    message: "artifact is empty".into(),
                    recommendation: None,
                }),
                _ => {}
            }
        }
        if findings.is_empty() {
            GateOutcome::passed()
        } else {
            GateOutcome::failed(findings)
        }
    }
}

/// Style nits never block a task; the gate reports them and passes.
pub struct LintGate;

#[async_trait]
impl GateExecutor for LintGate {
    fn kind(&self) -> GateKind {
        GateKind::Lint
    }

    async fn run(&self, task: &Task, workspace: &Path, _worker: &[NewFinding]) -> GateOutcome {
        let mut findings = Vec::new();
        for rel in &task.artifacts {
            if let Some(content) = read_artifact(workspace, rel).await {
                let trailing = content
                    .lines()
                    .filter(|l| l.ends_with(' ') || l.ends_with('\t'))
                    .count();
                if trailing > 0 {
                    findings.push(NewFinding {
                        gate: GateKind::Lint,
                        severity: Severity::Low,
                        file: Some(rel.clone()),
                        line: None,
                        message: format!("{} line(s) with trailing whitespace", trailing),
                        recommendation: None,
                    });
                }
            }
        }
        GateOutcome {
            status: GateRunStatus::Passed,
            findings,
            duration_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedGateExecutor — canned outcomes for tests
// ---------------------------------------------------------------------------

pub struct ScriptedGateExecutor {
    kind: GateKind,
    outcomes: std::sync::Mutex<std::collections::VecDeque<GateOutcome>>,
}

impl ScriptedGateExecutor {
    pub fn new(kind: GateKind, outcomes: Vec<GateOutcome>) -> Self {
        Self {
            kind,
            outcomes: std::sync::Mutex::new(outcomes.into()),
        }
    }

    /// An executor that always passes.
    pub fn passing(kind: GateKind) -> Self {
        Self::new(kind, Vec::new())
    }
}

#[async_trait]
impl GateExecutor for ScriptedGateExecutor {
    fn kind(&self) -> GateKind {
        self.kind
    }

    async fn run(&self, _task: &Task, _workspace: &Path, _worker: &[NewFinding]) -> GateOutcome {
        self.outcomes
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(GateOutcome::passed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
