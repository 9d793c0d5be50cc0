//! Scripted doubles for the model, storage and agent seams.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::agents::{Agent, Planner, ReviewSummary, Reviewer, TestSummary, Tester};
use crate::core::context::SharedContext;
use crate::core::types::{AgentRole, Task};
use crate::io::model::{ModelClient, ProviderError};
use crate::io::storage::ProjectStorage;

/// Create a pending task assigned to `role`.
pub fn pending_task(id: &str, role: AgentRole) -> Task {
    Task::new(id, format!("{id} description")).with_role(role)
}

/// Model that answers with canned responses in order.
///
/// Once the script runs out every call fails with a malformed-response error.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        prompt: &str,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String, ProviderError> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| ProviderError::Malformed("script exhausted".to_string()))
    }
}

/// In-memory project storage.
#[derive(Debug)]
pub struct MemoryStorage {
    files: Mutex<BTreeMap<String, String>>,
    fail_writes: AtomicBool,
    connected: AtomicBool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            fail_writes: AtomicBool::new(false),
            connected: AtomicBool::new(true),
        }
    }
}

impl MemoryStorage {
    pub fn insert(&self, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), content.to_string());
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProjectStorage for MemoryStorage {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, path: &str) -> Result<Option<String>> {
        Ok(self.get(path))
    }

    async fn write(&self, path: &str, content: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("scripted write failure for {path}");
        }
        self.insert(path, content);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get(path).is_some())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        Ok(self
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some())
    }

    async fn check_connection(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Agent double usable in any role slot.
///
/// `execute` completes with "done <id>" unless told to fail on that id. As a
/// planner it inserts its scripted plan; as reviewer or tester it only counts
/// the call.
#[derive(Debug)]
pub struct ScriptedAgent {
    name: String,
    role: AgentRole,
    plan: Vec<Task>,
    fail_on: Option<String>,
    replicate: bool,
    executions: AtomicUsize,
    phase_calls: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(name: &str, role: AgentRole) -> Self {
        Self {
            name: name.to_string(),
            role,
            plan: Vec::new(),
            fail_on: None,
            replicate: false,
            executions: AtomicUsize::new(0),
            phase_calls: AtomicUsize::new(0),
        }
    }

    /// Tasks inserted by `plan`.
    pub fn with_plan(mut self, tasks: Vec<Task>) -> Self {
        self.plan = tasks;
        self
    }

    pub fn failing_on(mut self, task_id: &str) -> Self {
        self.fail_on = Some(task_id.to_string());
        self
    }

    /// Every execution enqueues a fresh pending task for the same role.
    pub fn replicating(mut self) -> Self {
        self.replicate = true;
        self
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    /// Calls to `plan`, `review` or `test`.
    pub fn phase_calls(&self) -> usize {
        self.phase_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        self.role
    }

    async fn execute(&self, task: &Task, ctx: &SharedContext) -> Result<String> {
        let n = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on.as_deref() == Some(task.id.as_str()) {
            bail!("scripted failure on {}", task.id);
        }
        if self.replicate {
            let next = pending_task(&format!("{}_again_{n}", self.name), self.role);
            ctx.update(|c| c.insert_task(next));
        }
        Ok(format!("done {}", task.id))
    }
}

#[async_trait]
impl Planner for ScriptedAgent {
    async fn plan(&self, _description: &str, ctx: &SharedContext) -> Result<Vec<String>> {
        self.phase_calls.fetch_add(1, Ordering::SeqCst);
        let ids = self.plan.iter().map(|t| t.id.clone()).collect();
        ctx.update(|c| {
            for task in &self.plan {
                c.insert_task(task.clone());
            }
        });
        Ok(ids)
    }
}

#[async_trait]
impl Reviewer for ScriptedAgent {
    async fn review(&self, _ctx: &SharedContext) -> Result<ReviewSummary> {
        self.phase_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ReviewSummary {
            summary: "scripted review".to_string(),
            ..ReviewSummary::default()
        })
    }
}

#[async_trait]
impl Tester for ScriptedAgent {
    async fn test(&self, _ctx: &SharedContext) -> Result<TestSummary> {
        self.phase_calls.fetch_add(1, Ordering::SeqCst);
        Ok(TestSummary {
            summary: "scripted tests".to_string(),
            executed: true,
            ..TestSummary::default()
        })
    }
}
