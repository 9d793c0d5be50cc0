//! Workflow progress events, broadcast to any number of subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::types::{AgentRole, TaskStatus};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ProjectInitialized {
        project_name: String,
    },
    PhaseStarted {
        phase: Phase,
    },
    TaskStatusChanged {
        task_id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        role: Option<AgentRole>,
    },
    IterationCompleted {
        iteration: u32,
        dispatched: usize,
    },
    WorkflowFinished {
        success: bool,
    },
    AutoAcceptToggled {
        enabled: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Subtasks,
    Review,
    Testing,
}

/// Fan-out sender. Publishing with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkflowEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn publish(&self, event: WorkflowEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.tx.subscribe()
    }
}
