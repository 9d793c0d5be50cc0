//! Deterministic readiness checks for the subtask scheduler.

use crate::core::context::Context;
use crate::core::types::{Task, TaskStatus};

/// What the scheduler should do with a pending task this iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every dependency is completed.
    Ready,
    /// Some dependency is still pending or in progress.
    Waiting,
    /// A dependency failed, was blocked, or does not exist.
    Blocked(String),
}

/// Classify `task` against the current task table.
///
/// Blocking reasons win over waiting ones so a doomed task is settled in the
/// same iteration its failed dependency is seen.
pub fn readiness(task: &Task, ctx: &Context) -> Readiness {
    let mut waiting = false;
    for dep in &task.dependencies {
        match ctx.get_task(dep).map(|t| t.status) {
            None => return Readiness::Blocked(format!("dependency '{dep}' does not exist")),
            Some(status @ (TaskStatus::Failed | TaskStatus::Blocked)) => {
                return Readiness::Blocked(format!("dependency '{dep}' is {status}"));
            }
            Some(TaskStatus::Completed) => {}
            Some(TaskStatus::Pending | TaskStatus::InProgress) => waiting = true,
        }
    }
    if waiting {
        Readiness::Waiting
    } else {
        Readiness::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AgentRole;

    fn ctx_with(tasks: Vec<Task>) -> Context {
        let mut ctx = Context::new("/p", "p", "");
        for task in tasks {
            ctx.insert_task(task);
        }
        ctx
    }

    #[test]
    fn no_dependencies_is_ready() {
        let ctx = ctx_with(Vec::new());
        let task = Task::new("t", "x").with_role(AgentRole::Coder);
        assert_eq!(readiness(&task, &ctx), Readiness::Ready);
    }

    #[test]
    fn completed_dependencies_are_ready() {
        let ctx = ctx_with(vec![Task::new("a", "a").with_status(TaskStatus::Completed)]);
        let task = Task::new("t", "x").with_dependencies(vec!["a".to_string()]);
        assert_eq!(readiness(&task, &ctx), Readiness::Ready);
    }

    #[test]
    fn pending_dependency_waits() {
        let ctx = ctx_with(vec![
            Task::new("a", "a").with_status(TaskStatus::Completed),
            Task::new("b", "b"),
        ]);
        let task = Task::new("t", "x").with_dependencies(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(readiness(&task, &ctx), Readiness::Waiting);
    }

    #[test]
    fn failed_or_missing_dependency_blocks() {
        let ctx = ctx_with(vec![
            Task::new("b", "b"),
            Task::new("f", "f").with_status(TaskStatus::Failed),
        ]);

        let on_failed =
            Task::new("t", "x").with_dependencies(vec!["b".to_string(), "f".to_string()]);
        match readiness(&on_failed, &ctx) {
            Readiness::Blocked(reason) => assert!(reason.contains("'f' is failed")),
            other => panic!("expected blocked, got {other:?}"),
        }

        let on_missing = Task::new("t", "x").with_dependencies(vec!["ghost".to_string()]);
        assert!(matches!(readiness(&on_missing, &ctx), Readiness::Blocked(_)));
    }
}
