//! Pure dependency-graph engine for a project's task set.
//!
//! Given task snapshots `(id, task_number, status, depends_on)` it computes
//! the ready set, the blocked set, completion, and deadlock detection.
//! Cycle detection runs on every decomposition; a cycle rejects the whole
//! decomposition before anything is persisted.

use std::collections::HashMap;

use crate::types::{Id, TaskStatus};

// ---------------------------------------------------------------------------
// Inputs / outputs
// ---------------------------------------------------------------------------

/// Minimal task view the resolver operates on.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: Id,
    pub task_number: String,
    pub status: TaskStatus,
    pub depends_on: Vec<Id>,
}

/// Result of one resolution pass over a project's tasks.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Tasks whose status is `pending` and whose dependencies are all
    /// satisfied (`completed` or `excluded`), ordered by `task_number`
    /// then id.
    pub ready: Vec<Id>,
    /// Tasks with at least one dependency in `failed`.
    pub blocked_on_failure: Vec<Id>,
    /// No non-terminal tasks remain.
    pub is_complete: bool,
    /// Set when every remaining non-terminal task is unable to make
    /// progress because of failed or unreachable dependencies.
    pub deadlock_reason: Option<String>,
}

/// A dependency cycle, reported as the task numbers along the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle(pub Vec<String>);

impl std::fmt::Display for Cycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(" -> "))
    }
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

/// Detect a dependency cycle via iterative three-color DFS.
///
/// Returns the first cycle found (as task numbers, closing back on the
/// start), or `None` when the graph is acyclic. Dangling dependency ids are
/// ignored here; decomposition validation rejects them separately.
pub fn detect_cycle(tasks: &[TaskNode]) -> Option<Cycle> {
    let by_id: HashMap<Id, &TaskNode> = tasks.iter().map(|t| (t.id, t)).collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color: HashMap<Id, Color> = tasks.iter().map(|t| (t.id, Color::White)).collect();

    for start in tasks {
        if color[&start.id] != Color::White {
            continue;
        }
        // Stack of (node, next-dependency-index); path tracks the gray chain.
        let mut stack: Vec<(Id, usize)> = vec![(start.id, 0)];
        let mut path: Vec<Id> = Vec::new();
        color.insert(start.id, Color::Gray);
        path.push(start.id);

        while let Some((node, idx)) = stack.last_mut() {
            let deps = &by_id[node].depends_on;
            if *idx < deps.len() {
                let dep = deps[*idx];
                *idx += 1;
                let Some(dep_color) = color.get(&dep) else {
                    continue; // dangling id, validated elsewhere
                };
                match dep_color {
                    Color::Gray => {
                        // Found a back edge; slice the cycle out of the path.
                        let pos = path.iter().position(|&p| p == dep).unwrap_or(0);
                        let mut numbers: Vec<String> = path[pos..]
                            .iter()
                            .map(|id| by_id[id].task_number.clone())
                            .collect();
                        numbers.push(by_id[&dep].task_number.clone());
                        return Some(Cycle(numbers));
                    }
                    Color::White => {
                        color.insert(dep, Color::Gray);
                        path.push(dep);
                        stack.push((dep, 0));
                    }
                    Color::Black => {}
                }
            } else {
                let (done, _) = stack.pop().expect("stack non-empty");
                color.insert(done, Color::Black);
                path.pop();
            }
        }
    }

    None
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Compute the ready/blocked/complete view of a task set.
///
/// Pure: same inputs produce the same outputs, and the ready ordering is
/// deterministic (ascending `task_number`, then id).
pub fn resolve(tasks: &[TaskNode]) -> Resolution {
    let status_of: HashMap<Id, TaskStatus> = tasks.iter().map(|t| (t.id, t.status)).collect();

    let satisfied = |dep: &Id| {
        matches!(
            status_of.get(dep),
            Some(TaskStatus::Completed) | Some(TaskStatus::Excluded)
        )
    };
    let dep_failed = |dep: &Id| matches!(status_of.get(dep), Some(TaskStatus::Failed));

    let mut ready: Vec<&TaskNode> = Vec::new();
    let mut blocked_on_failure: Vec<Id> = Vec::new();
    let mut non_terminal = 0usize;
    let mut stuck = 0usize;

    for task in tasks {
        if !task.status.is_terminal() {
            non_terminal += 1;
        }
        if task.depends_on.iter().any(dep_failed) && !task.status.is_terminal() {
            blocked_on_failure.push(task.id);
        }
        match task.status {
            TaskStatus::Pending => {
                if task.depends_on.iter().all(|d| satisfied(d)) {
                    ready.push(task);
                } else if task.depends_on.iter().any(dep_failed) {
                    stuck += 1;
                }
            }
            TaskStatus::Blocked => {
                // waits on human unblock, never a deadlock by itself
            }
            TaskStatus::Ready | TaskStatus::InProgress => {}
            _ => {}
        }
    }

    ready.sort_by(|a, b| {
        number_key(&a.task_number)
            .cmp(&number_key(&b.task_number))
            .then(a.id.cmp(&b.id))
    });

    let is_complete = non_terminal == 0;

    // Deadlock: work remains, nothing is ready, running, blocked-on-human,
    // or already dispatched, and at least one pending task sits on a failed
    // dependency chain.
    let any_live = tasks.iter().any(|t| {
        matches!(
            t.status,
            TaskStatus::Ready | TaskStatus::InProgress | TaskStatus::Blocked
        )
    });
    let deadlock_reason = if !is_complete && ready.is_empty() && !any_live && stuck > 0 {
        Some(format!(
            "{} remaining task(s) blocked on failed dependencies",
            non_terminal
        ))
    } else {
        None
    };

    Resolution {
        ready: ready.iter().map(|t| t.id).collect(),
        blocked_on_failure,
        is_complete,
        deadlock_reason,
    }
}

/// Sort key for task numbers: numeric segments compare numerically
/// ("10" after "2"), with a lexicographic fallback for non-numeric parts.
fn number_key(number: &str) -> (Vec<u64>, String) {
    let segments: Vec<u64> = number
        .split('.')
        .map_while(|s| s.parse::<u64>().ok())
        .collect();
    (segments, number.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: Id, number: &str, status: TaskStatus, deps: &[Id]) -> TaskNode {
        TaskNode {
            id,
            task_number: number.to_string(),
            status,
            depends_on: deps.to_vec(),
        }
    }

    #[test]
    fn ready_set_requires_all_deps_satisfied() {
        let tasks = vec![
            node(1, "1", TaskStatus::Completed, &[]),
            node(2, "2", TaskStatus::Pending, &[1]),
            node(3, "3", TaskStatus::Pending, &[1, 2]),
        ];
        let r = resolve(&tasks);
        assert_eq!(r.ready, vec![2]);
        assert!(!r.is_complete);
    }

    #[test]
    fn excluded_dependency_counts_as_satisfied() {
        let tasks = vec![
            node(1, "1", TaskStatus::Excluded, &[]),
            node(2, "2", TaskStatus::Pending, &[1]),
        ];
        let r = resolve(&tasks);
        assert_eq!(r.ready, vec![2]);
    }

    #[test]
    fn ready_ordering_is_numeric_by_task_number_then_id() {
        let tasks = vec![
            node(30, "10", TaskStatus::Pending, &[]),
            node(20, "2", TaskStatus::Pending, &[]),
            node(10, "2", TaskStatus::Pending, &[]),
        ];
        let r = resolve(&tasks);
        assert_eq!(r.ready, vec![10, 20, 30]);
    }

    #[test]
    fn resolution_is_pure() {
        let tasks = vec![
            node(1, "1", TaskStatus::Completed, &[]),
            node(2, "2", TaskStatus::Pending, &[1]),
        ];
        let a = resolve(&tasks);
        let b = resolve(&tasks);
        assert_eq!(a.ready, b.ready);
        assert_eq!(a.is_complete, b.is_complete);
    }

    #[test]
    fn complete_when_all_terminal() {
        let tasks = vec![
            node(1, "1", TaskStatus::Completed, &[]),
            node(2, "2", TaskStatus::Failed, &[]),
            node(3, "3", TaskStatus::Excluded, &[]),
        ];
        let r = resolve(&tasks);
        assert!(r.is_complete);
        assert!(r.deadlock_reason.is_none());
    }

    #[test]
    fn deadlock_when_pending_work_sits_on_failed_deps() {
        let tasks = vec![
            node(1, "1", TaskStatus::Failed, &[]),
            node(2, "2", TaskStatus::Pending, &[1]),
        ];
        let r = resolve(&tasks);
        assert!(r.ready.is_empty());
        assert!(!r.is_complete);
        assert!(r.deadlock_reason.is_some());
        assert_eq!(r.blocked_on_failure, vec![2]);
    }

    #[test]
    fn no_deadlock_while_work_is_in_flight() {
        let tasks = vec![
            node(1, "1", TaskStatus::Failed, &[]),
            node(2, "2", TaskStatus::Pending, &[1]),
            node(3, "3", TaskStatus::InProgress, &[]),
        ];
        let r = resolve(&tasks);
        assert!(r.deadlock_reason.is_none());
    }

    #[test]
    fn human_blocked_task_is_not_a_deadlock() {
        let tasks = vec![node(1, "1", TaskStatus::Blocked, &[])];
        let r = resolve(&tasks);
        assert!(r.deadlock_reason.is_none());
        assert!(!r.is_complete);
    }

    #[test]
    fn detects_direct_cycle() {
        let tasks = vec![
            node(1, "1", TaskStatus::Pending, &[2]),
            node(2, "2", TaskStatus::Pending, &[1]),
        ];
        let cycle = detect_cycle(&tasks).expect("cycle expected");
        assert!(cycle.0.len() >= 3);
    }

    #[test]
    fn detects_self_cycle() {
        let tasks = vec![node(1, "1", TaskStatus::Pending, &[1])];
        assert!(detect_cycle(&tasks).is_some());
    }

    #[test]
    fn detects_long_cycle_behind_a_chain() {
        let tasks = vec![
            node(1, "1", TaskStatus::Pending, &[]),
            node(2, "2", TaskStatus::Pending, &[1, 3]),
            node(3, "3", TaskStatus::Pending, &[4]),
            node(4, "4", TaskStatus::Pending, &[2]),
        ];
        assert!(detect_cycle(&tasks).is_some());
    }

    #[test]
    fn diamond_is_acyclic() {
        let tasks = vec![
            node(1, "1", TaskStatus::Pending, &[]),
            node(2, "2", TaskStatus::Pending, &[1]),
            node(3, "3", TaskStatus::Pending, &[1]),
            node(4, "4", TaskStatus::Pending, &[2, 3]),
        ];
        assert!(detect_cycle(&tasks).is_none());
    }
}
