//! Shared deterministic types for the workflow core.
//!
//! These types define stable contracts between the context model, the
//! scheduler, the gate and the agents. They carry no I/O and serialize with
//! `snake_case` names so context snapshots stay stable across runs.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved id of the root task created by `execute_task`.
pub const ROOT_TASK_ID: &str = "main";

/// Capability slot in the workflow, bound to one agent at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Planner,
    Coder,
    Reviewer,
    Tester,
}

impl AgentRole {
    pub const ALL: [AgentRole; 4] = [
        AgentRole::Planner,
        AgentRole::Coder,
        AgentRole::Reviewer,
        AgentRole::Tester,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Planner => "planner",
            AgentRole::Coder => "coder",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Tester => "tester",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "planner" => Ok(AgentRole::Planner),
            "coder" => Ok(AgentRole::Coder),
            "reviewer" => Ok(AgentRole::Reviewer),
            "tester" => Ok(AgentRole::Tester),
            other => Err(anyhow!("unknown agent role '{other}'")),
        }
    }
}

/// Lifecycle status of a task.
///
/// Transitions go `Pending -> InProgress -> {Completed, Failed}`. `Blocked` is
/// only reached through dependency enforcement in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        }
    }

    /// True once the task can no longer be dispatched.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work in the shared task table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    /// Task ids that must reach `Completed` before this task may run.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Child task ids, in planning order.
    #[serde(default)]
    pub subtasks: Vec<String>,
    pub assigned_role: Option<AgentRole>,
    #[serde(default)]
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Task {
    /// Create a pending, unassigned task stamped with the current time.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            subtasks: Vec::new(),
            assigned_role: None,
            priority: 0,
            created_at: now,
            updated_at: now,
            result: None,
            metadata: Map::new(),
        }
    }

    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.assigned_role = Some(role);
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

/// Kind of side-effecting action the auto-accept gate can rule on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    FileWrite,
    TerminalCommand,
    CodeGeneration,
    TestExecution,
    CodeReview,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::FileWrite,
        ActionKind::TerminalCommand,
        ActionKind::CodeGeneration,
        ActionKind::TestExecution,
        ActionKind::CodeReview,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::FileWrite => "file_write",
            ActionKind::TerminalCommand => "terminal_command",
            ActionKind::CodeGeneration => "code_generation",
            ActionKind::TestExecution => "test_execution",
            ActionKind::CodeReview => "code_review",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ActionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| anyhow!("unknown action kind '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_case_insensitively() {
        assert_eq!("Tester".parse::<AgentRole>().unwrap(), AgentRole::Tester);
        assert!("designer".parse::<AgentRole>().is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let raw = serde_json::to_string(&TaskStatus::InProgress).expect("serialize");
        assert_eq!(raw, "\"in_progress\"");
    }

    #[test]
    fn action_kind_round_trips_through_str() {
        for kind in ActionKind::ALL {
            assert_eq!(kind.as_str().parse::<ActionKind>().unwrap(), kind);
        }
    }

    #[test]
    fn only_pending_and_in_progress_are_open() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
    }
}
