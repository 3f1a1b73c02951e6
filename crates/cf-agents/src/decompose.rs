//! PRD → task decomposition.
//!
//! The model returns an ordered JSON list of task specs with dependencies
//! by task number. Validation is all-or-nothing: an empty list, an unknown
//! dependency, or a cycle rejects the whole decomposition before any row
//! is written.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;

use cf_bridge::event_bus::ProjectBus;
use cf_bridge::orchestrator::CommandError;
use cf_bridge::protocol::EventKind;
use cf_core::resolver::{detect_cycle, TaskNode};
use cf_core::store::{NewTask, Store};
use cf_core::types::{Id, PrdStatus, ProjectPhase, Task, TaskStatus};
use cf_harness::cancel::CancelToken;
use cf_harness::provider::{ChatMessage, CompletionProvider, CompletionRequest};

use crate::artifacts::json_body;

const DECOMPOSER_SYSTEM_PROMPT: &str = "\
You decompose a product requirements document into an ordered list of
engineering tasks. Respond with a JSON array, and nothing else:
[{\"task_number\": \"1\", \"title\": \"...\", \"description\": \"...\",
  \"depends_on\": [\"task numbers this task needs finished first\"]}]
Task numbers are unique strings. Keep tasks small enough for one engineer
and order them so dependencies come first.";

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub task_number: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Validate a decomposition without touching storage. Pure; used on every
/// decomposition per the resolver contract.
pub fn validate_specs(specs: &[TaskSpec]) -> Result<(), CommandError> {
    if specs.is_empty() {
        return Err(CommandError::Validation(
            "decomposition produced no tasks".into(),
        ));
    }

    let numbers: HashSet<&str> = specs.iter().map(|s| s.task_number.as_str()).collect();
    if numbers.len() != specs.len() {
        return Err(CommandError::Validation(
            "duplicate task numbers in decomposition".into(),
        ));
    }
    for spec in specs {
        for dep in &spec.depends_on {
            if !numbers.contains(dep.as_str()) {
                return Err(CommandError::Validation(format!(
                    "task {} depends on unknown task {}",
                    spec.task_number, dep
                )));
            }
        }
    }

    // Cycle check over synthetic ids (index order).
    let index_of: std::collections::HashMap<&str, Id> = specs
        .iter()
        .enumerate()
        .map(|(i, s)| (s.task_number.as_str(), i as Id))
        .collect();
    let nodes: Vec<TaskNode> = specs
        .iter()
        .enumerate()
        .map(|(i, s)| TaskNode {
            id: i as Id,
            task_number: s.task_number.clone(),
            status: TaskStatus::Pending,
            depends_on: s.depends_on.iter().map(|d| index_of[d.as_str()]).collect(),
        })
        .collect();
    if let Some(cycle) = detect_cycle(&nodes) {
        return Err(CommandError::Cyclic(cycle.to_string()));
    }
    Ok(())
}

/// Parse the model's reply into task specs.
pub fn parse_specs(text: &str) -> Result<Vec<TaskSpec>, CommandError> {
    serde_json::from_str::<Vec<TaskSpec>>(json_body(text))
        .map_err(|e| CommandError::Validation(format!("decomposition is not valid JSON: {}", e)))
}

/// Run the full decomposition for a project in `planning`: call the model,
/// validate, persist, broadcast. No rows are written on any failure.
pub async fn generate_and_persist(
    store: &Arc<Store>,
    bus: &Arc<ProjectBus>,
    provider: &Arc<dyn CompletionProvider>,
    project_id: Id,
    model: &str,
    max_tokens: u32,
) -> Result<Vec<Task>, CommandError> {
    let project = store.get_project(project_id).await?;
    if project.phase != ProjectPhase::Planning {
        return Err(CommandError::Conflict(format!(
            "project is in phase {}, not planning",
            project.phase
        )));
    }
    let discovery = store.discovery_state(project_id).await?;
    if discovery.prd_status != PrdStatus::Available {
        return Err(CommandError::Conflict("PRD is not available".into()));
    }
    if !store.list_tasks(project_id).await?.is_empty() {
        return Err(CommandError::Conflict(
            "project already has a task decomposition".into(),
        ));
    }

    let prd = discovery.prd_content.unwrap_or_default();
    let request = CompletionRequest {
        messages: vec![
            ChatMessage::system(DECOMPOSER_SYSTEM_PROMPT),
            ChatMessage::user(prd),
        ],
        model: model.to_string(),
        max_tokens,
    };
    let completion = provider
        .complete(request, &CancelToken::new())
        .await
        .map_err(|e| CommandError::Internal(format!("decomposition call failed: {}", e)))?;

    store
        .record_cost(
            project_id,
            None,
            None,
            &completion.model,
            completion.tokens_in,
            completion.tokens_out,
            completion.cost_cents,
        )
        .await?;

    let specs = parse_specs(&completion.text)?;
    validate_specs(&specs)?;

    let batch: Vec<NewTask> = specs
        .into_iter()
        .map(|s| NewTask {
            task_number: s.task_number,
            title: s.title,
            description: s.description,
            depends_on_numbers: s.depends_on,
        })
        .collect();
    let tasks = store.insert_tasks(project_id, batch).await?;

    bus.publish(project_id, EventKind::TasksDecomposed { count: tasks.len() });
    tracing::info!(project_id, count = tasks.len(), "tasks decomposed");
    Ok(tasks)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
