//! Shared project context for one workflow run.
//!
//! The [`Context`] is a plain data holder: the task table, the message and
//! action logs, the file ledger and run counters. All mutation goes through
//! the small set of methods below; none of them perform I/O.
//!
//! [`SharedContext`] wraps a context for the driver and concurrent monitoring
//! readers. Access is closure-scoped so a lock is never held across `.await`.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{AgentRole, Task, TaskStatus};

/// One entry in the conversation/audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
    /// Role of the agent that produced the message, if any.
    pub agent: Option<AgentRole>,
    pub timestamp: DateTime<Utc>,
}

/// One entry in the operational audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(rename = "type")]
    pub action_type: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub project_path: String,
    pub project_name: String,
    pub project_description: String,

    pub tasks: BTreeMap<String, Task>,
    pub current_task: Option<String>,

    pub messages: Vec<Message>,
    pub action_history: Vec<ActionRecord>,

    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub files_deleted: Vec<String>,

    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub total_iterations: u32,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Context {
    pub fn new(
        project_path: impl Into<String>,
        project_name: impl Into<String>,
        project_description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            project_path: project_path.into(),
            project_name: project_name.into(),
            project_description: project_description.into(),
            tasks: BTreeMap::new(),
            current_task: None,
            messages: Vec::new(),
            action_history: Vec::new(),
            files_created: Vec::new(),
            files_modified: Vec::new(),
            files_deleted: Vec::new(),
            tasks_completed: 0,
            tasks_failed: 0,
            total_iterations: 0,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn add_message(
        &mut self,
        role: impl Into<String>,
        content: impl Into<String>,
        agent: Option<AgentRole>,
    ) {
        let now = Utc::now();
        self.messages.push(Message {
            role: role.into(),
            content: content.into(),
            agent,
            timestamp: now,
        });
        self.updated_at = now;
    }

    pub fn add_action(&mut self, action_type: impl Into<String>, details: Value) {
        let now = Utc::now();
        self.action_history.push(ActionRecord {
            action_type: action_type.into(),
            details,
            timestamp: now,
        });
        self.updated_at = now;
    }

    /// Insert or overwrite a task entry.
    pub fn insert_task(&mut self, task: Task) {
        self.tasks.insert(task.id.clone(), task);
        self.updated_at = Utc::now();
    }

    /// Set a task's status and optional result.
    ///
    /// Unknown ids are ignored without error. `Completed` and `Failed` bump the
    /// matching run counter; other statuses leave the counters alone. A `None`
    /// or empty result keeps whatever result the task already had.
    pub fn update_task_status(&mut self, task_id: &str, status: TaskStatus, result: Option<String>) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        let now = Utc::now();
        task.status = status;
        task.updated_at = now;
        if let Some(result) = result.filter(|r| !r.is_empty()) {
            task.result = Some(result);
        }

        match status {
            TaskStatus::Completed => self.tasks_completed += 1,
            TaskStatus::Failed => self.tasks_failed += 1,
            _ => {}
        }
        self.updated_at = now;
    }

    pub fn get_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// All pending tasks, in table order.
    pub fn get_pending_tasks(&self) -> Vec<Task> {
        self.tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .cloned()
            .collect()
    }

    /// Pending tasks assigned to `role`.
    pub fn get_tasks_for_role(&self, role: AgentRole) -> Vec<Task> {
        self.tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending && task.assigned_role == Some(role))
            .cloned()
            .collect()
    }

    pub fn record_file_created(&mut self, path: impl Into<String>) {
        self.files_created.push(path.into());
        self.updated_at = Utc::now();
    }

    pub fn record_file_modified(&mut self, path: impl Into<String>) {
        self.files_modified.push(path.into());
        self.updated_at = Utc::now();
    }

    pub fn record_file_deleted(&mut self, path: impl Into<String>) {
        self.files_deleted.push(path.into());
        self.updated_at = Utc::now();
    }

    /// Files the reviewer and tester work over: created, then modified.
    pub fn ledger_files(&self) -> Vec<String> {
        self.files_created
            .iter()
            .chain(self.files_modified.iter())
            .cloned()
            .collect()
    }

    /// Full snapshot of every field, used as the external result payload.
    pub fn serialize(&self) -> Value {
        // Every field is a map, list, string, number or timestamp.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// A context shared between the workflow driver and monitoring readers.
#[derive(Debug, Clone)]
pub struct SharedContext {
    inner: Arc<RwLock<Context>>,
}

impl SharedContext {
    pub fn new(context: Context) -> Self {
        Self {
            inner: Arc::new(RwLock::new(context)),
        }
    }

    /// Run `f` with shared read access.
    pub fn read<R>(&self, f: impl FnOnce(&Context) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Run `f` with exclusive write access.
    pub fn update<R>(&self, f: impl FnOnce(&mut Context) -> R) -> R {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Point-in-time copy of the whole context.
    pub fn snapshot(&self) -> Context {
        self.read(Context::clone)
    }

    pub fn serialize(&self) -> Value {
        self.read(Context::serialize)
    }
}
