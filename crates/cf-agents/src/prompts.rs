//! Role-specific prompt builders.
//!
//! Workers speak a narrow contract with the model: coding roles must answer
//! with a JSON artifact list, the review role with a JSON findings list.
//! A worker that cannot proceed without operator input emits the
//! `NEEDS_HUMAN:` marker instead.

use cf_core::types::{AgentRole, Task};

pub const ARTIFACT_CONTRACT: &str = "\
Respond with a JSON array of files to write, and nothing else:
[{\"path\": \"relative/path.ext\", \"content\": \"full file content\"}]
Paths are relative to the project workspace. Always return complete file
contents, never diffs. If you are blocked and need human input, respond
with a single line starting with NEEDS_HUMAN: followed by what you need.";

pub const FINDINGS_CONTRACT: &str = "\
Respond with a JSON array of findings, and nothing else:
[{\"severity\": \"critical|high|medium|low|info\", \"message\": \"...\",
  \"file\": \"optional/path\", \"line\": 0, \"recommendation\": \"optional\"}]
An empty array means the work passes review.";

const BACKEND_SYSTEM_PROMPT: &str = "\
You are a senior backend engineer on an autonomous development team.
You implement server-side functionality: HTTP endpoints, data models,
persistence, and business logic. Favor small, composable functions and
explicit error handling. Write code that compiles and runs as delivered.";

const FRONTEND_SYSTEM_PROMPT: &str = "\
You are a senior frontend engineer on an autonomous development team.
You build user interfaces: components, styling, and client-side state.
Keep markup accessible and styles scoped to the component you touch.";

const TEST_SYSTEM_PROMPT: &str = "\
You are a test engineer on an autonomous development team.
You write automated tests for functionality delivered by other agents.
Cover the happy path, the documented edge cases, and failure modes.
Tests must be deterministic and runnable without manual setup.";

const REVIEW_SYSTEM_PROMPT: &str = "\
You are a code reviewer on an autonomous development team.
You inspect the files produced for a task and report defects: correctness
bugs, missing error handling, security issues, and unmet requirements.
Severity 'critical' is reserved for defects that make the work unusable.";

/// The system prompt for a worker role.
pub fn system_prompt(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Lead | AgentRole::Backend => BACKEND_SYSTEM_PROMPT,
        AgentRole::Frontend => FRONTEND_SYSTEM_PROMPT,
        AgentRole::Test => TEST_SYSTEM_PROMPT,
        AgentRole::Review => REVIEW_SYSTEM_PROMPT,
    }
}

/// The user prompt for one task execution.
///
/// `guidance` carries operator comments recorded by `unblock`, newest last;
/// `workspace_files` is a listing of existing artifact paths for context.
pub fn task_prompt(
    role: AgentRole,
    task: &Task,
    guidance: &[String],
    workspace_files: &[String],
) -> String {
    let mut prompt = format!(
        "Task {}: {}\n\n{}\n",
        task.task_number, task.title, task.description
    );

    if !workspace_files.is_empty() {
        prompt.push_str("\nFiles already in the workspace:\n");
        for file in workspace_files {
            prompt.push_str("- ");
            prompt.push_str(file);
            prompt.push('\n');
        }
    }

    if !guidance.is_empty() {
        prompt.push_str("\nOperator guidance:\n");
        for note in guidance {
            prompt.push_str("- ");
            prompt.push_str(note);
            prompt.push('\n');
        }
    }

    if task.attempt_count > 1 {
        prompt.push_str(&format!(
            "\nThis is attempt {} of {}; the previous attempt did not pass.\n",
            task.attempt_count, task.max_attempts
        ));
    }

    prompt.push('\n');
    prompt.push_str(match role {
        AgentRole::Review => FINDINGS_CONTRACT,
        _ => ARTIFACT_CONTRACT,
    });
    prompt
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cf_core::types::{QualityGateStatus, TaskStatus, DEFAULT_MAX_ATTEMPTS};

    fn task() -> Task {
        let now = Utc::now();
        Task {
            id: 1,
            project_id: 1,
            task_number: "2".into(),
            title: "GET /hello".into(),
            description: "Return a greeting".into(),
            status: TaskStatus::InProgress,
            depends_on: vec![],
            assigned_role: None,
            assigned_agent_id: None,
            attempt_count: 1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            quality_gate_status: QualityGateStatus::NotRun,
            artifacts: vec![],
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn coding_roles_get_the_artifact_contract() {
        let p = task_prompt(AgentRole::Backend, &task(), &[], &[]);
        assert!(p.contains("JSON array of files"));
        assert!(p.contains("GET /hello"));
    }

    #[test]
    fn review_role_gets_the_findings_contract() {
        let p = task_prompt(AgentRole::Review, &task(), &[], &[]);
        assert!(p.contains("JSON array of findings"));
    }

    #[test]
    fn guidance_is_included() {
        let p = task_prompt(
            AgentRole::Backend,
            &task(),
            &["use port 8080".into()],
            &["src/main.rs".into()],
        );
        assert!(p.contains("use port 8080"));
        assert!(p.contains("src/main.rs"));
    }

    #[test]
    fn retry_attempts_are_called_out() {
        let mut t = task();
        t.attempt_count = 2;
        let p = task_prompt(AgentRole::Backend, &t, &[], &[]);
        assert!(p.contains("attempt 2 of 3"));
    }

    #[test]
    fn each_role_has_a_distinct_system_prompt() {
        let prompts: Vec<&str> = [
            AgentRole::Backend,
            AgentRole::Frontend,
            AgentRole::Test,
            AgentRole::Review,
        ]
        .iter()
        .map(|r| system_prompt(*r))
        .collect();
        for (i, a) in prompts.iter().enumerate() {
            for b in prompts.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
