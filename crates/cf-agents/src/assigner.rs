//! Task-to-role assignment.
//!
//! A pure function over `(title, description, assigned_role)`. An explicit
//! role on the task always wins; otherwise keyword heuristics run in a
//! fixed order and fall back to `backend`.

use cf_core::types::{AgentRole, Task};

#[derive(Debug, Clone)]
pub struct Assignment {
    pub role: AgentRole,
    pub explanation: String,
}

const FRONTEND_KEYWORDS: &[&str] = &["frontend", "ui", "component", "css", "react"];
const BACKEND_KEYWORDS: &[&str] = &["api", "endpoint", "database", "schema", "backend"];

/// Pick the worker role for a task.
pub fn assign_role(task: &Task) -> Assignment {
    if let Some(role) = task.assigned_role {
        return Assignment {
            role,
            explanation: "explicit role on task".into(),
        };
    }

    let haystack = format!("{} {}", task.title, task.description).to_lowercase();

    if haystack.contains("test") {
        return keyword_assignment(AgentRole::Test, "test");
    }
    if haystack.contains("review") {
        return keyword_assignment(AgentRole::Review, "review");
    }
    if let Some(kw) = FRONTEND_KEYWORDS.iter().find(|kw| haystack.contains(*kw)) {
        return keyword_assignment(AgentRole::Frontend, kw);
    }
    if let Some(kw) = BACKEND_KEYWORDS.iter().find(|kw| haystack.contains(*kw)) {
        return keyword_assignment(AgentRole::Backend, kw);
    }

    Assignment {
        role: AgentRole::Backend,
        explanation: "no keyword matched, defaulting to backend".into(),
    }
}

fn keyword_assignment(role: AgentRole, keyword: &str) -> Assignment {
    Assignment {
        role,
        explanation: format!("matched keyword '{}'", keyword),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
