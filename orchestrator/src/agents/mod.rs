//! Agent role contract, role registry and the four model-backed agents.
//!
//! Every agent implements [`Agent`]. Planner, reviewer and tester add the
//! phase-specific operation the workflow calls directly. [`RoleHandle`] binds
//! an agent to its role slot so the registry can hand back the right
//! capability without downcasting.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::core::context::SharedContext;
use crate::core::gate::{AutoAcceptGate, Verdict};
use crate::core::parse::{ReviewIssue, ReviewSuggestion};
use crate::core::types::{ActionKind, AgentRole, Task};
use crate::io::cache::CacheStore;
use crate::io::model::ModelClient;
use crate::io::storage::ProjectStorage;

pub mod coder;
pub mod planner;
pub mod prompt;
pub mod reviewer;
pub mod tester;

pub use coder::CoderAgent;
pub use planner::PlannerAgent;
pub use prompt::{ProjectInfo, PromptBuilder};
pub use reviewer::ReviewerAgent;
pub use tester::TesterAgent;

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn role(&self) -> AgentRole;

    /// Perform `task`, returning a human-readable result.
    async fn execute(&self, task: &Task, ctx: &SharedContext) -> Result<String>;
}

#[async_trait]
pub trait Planner: Agent {
    /// Decompose `description` into subtasks stored in the task table.
    /// Returns the new subtask ids in plan order.
    async fn plan(&self, description: &str, ctx: &SharedContext) -> Result<Vec<String>>;
}

#[async_trait]
pub trait Reviewer: Agent {
    async fn review(&self, ctx: &SharedContext) -> Result<ReviewSummary>;
}

#[async_trait]
pub trait Tester: Agent {
    async fn test(&self, ctx: &SharedContext) -> Result<TestSummary>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReviewSummary {
    pub summary: String,
    pub files_reviewed: usize,
    pub issues: Vec<ReviewIssue>,
    pub suggestions: Vec<ReviewSuggestion>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestSummary {
    pub summary: String,
    pub tests_run: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub tests_generated: usize,
    /// False when the test command was not run because the gate refused it.
    pub executed: bool,
    pub output: Option<String>,
}

/// An agent bound to the role slot it fills.
#[derive(Clone)]
pub enum RoleHandle {
    Planner(Arc<dyn Planner>),
    Coder(Arc<dyn Agent>),
    Reviewer(Arc<dyn Reviewer>),
    Tester(Arc<dyn Tester>),
}

impl RoleHandle {
    pub fn role(&self) -> AgentRole {
        match self {
            RoleHandle::Planner(_) => AgentRole::Planner,
            RoleHandle::Coder(_) => AgentRole::Coder,
            RoleHandle::Reviewer(_) => AgentRole::Reviewer,
            RoleHandle::Tester(_) => AgentRole::Tester,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RoleHandle::Planner(a) => a.name(),
            RoleHandle::Coder(a) => a.name(),
            RoleHandle::Reviewer(a) => a.name(),
            RoleHandle::Tester(a) => a.name(),
        }
    }

    pub async fn execute(&self, task: &Task, ctx: &SharedContext) -> Result<String> {
        match self {
            RoleHandle::Planner(a) => a.execute(task, ctx).await,
            RoleHandle::Coder(a) => a.execute(task, ctx).await,
            RoleHandle::Reviewer(a) => a.execute(task, ctx).await,
            RoleHandle::Tester(a) => a.execute(task, ctx).await,
        }
    }
}

impl std::fmt::Debug for RoleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleHandle")
            .field("role", &self.role())
            .field("name", &self.name())
            .finish()
    }
}

/// At most one agent per role.
#[derive(Debug, Clone, Default)]
pub struct RoleRegistry {
    handles: HashMap<AgentRole, RoleHandle>,
}

impl RoleRegistry {
    /// Register `handle`, returning the agent it replaced, if any.
    pub fn register(&mut self, handle: RoleHandle) -> Option<RoleHandle> {
        self.handles.insert(handle.role(), handle)
    }

    pub fn get(&self, role: AgentRole) -> Option<&RoleHandle> {
        self.handles.get(&role)
    }

    pub fn contains(&self, role: AgentRole) -> bool {
        self.handles.contains_key(&role)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn planner(&self) -> Option<Arc<dyn Planner>> {
        match self.handles.get(&AgentRole::Planner) {
            Some(RoleHandle::Planner(p)) => Some(Arc::clone(p)),
            _ => None,
        }
    }

    pub fn reviewer(&self) -> Option<Arc<dyn Reviewer>> {
        match self.handles.get(&AgentRole::Reviewer) {
            Some(RoleHandle::Reviewer(r)) => Some(Arc::clone(r)),
            _ => None,
        }
    }

    pub fn tester(&self) -> Option<Arc<dyn Tester>> {
        match self.handles.get(&AgentRole::Tester) {
            Some(RoleHandle::Tester(t)) => Some(Arc::clone(t)),
            _ => None,
        }
    }
}

/// Collaborators shared by the model-backed agents.
#[derive(Clone)]
pub struct AgentDeps {
    pub model: Arc<dyn ModelClient>,
    pub storage: Arc<dyn ProjectStorage>,
    pub gate: Option<Arc<AutoAcceptGate>>,
    pub cache: Option<Arc<CacheStore>>,
    pub prompts: PromptBuilder,
}

impl AgentDeps {
    pub fn new(model: Arc<dyn ModelClient>, storage: Arc<dyn ProjectStorage>) -> Self {
        Self {
            model,
            storage,
            gate: None,
            cache: None,
            prompts: PromptBuilder::new(60_000),
        }
    }

    pub fn with_gate(mut self, gate: Arc<AutoAcceptGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_prompt_budget(mut self, budget_bytes: usize) -> Self {
        self.prompts = PromptBuilder::new(budget_bytes);
        self
    }

    /// Ask the gate whether `kind` may run. Without a gate every action runs.
    ///
    /// A refusal is recorded in the context's action history and returned as
    /// the reason.
    pub(crate) fn admit(
        &self,
        ctx: &SharedContext,
        agent: &str,
        kind: ActionKind,
        payload: Value,
    ) -> Result<(), String> {
        let Some(gate) = &self.gate else {
            return Ok(());
        };
        let decision = gate.evaluate(kind, &payload);
        if decision.verdict == Verdict::Accept {
            return Ok(());
        }
        warn!(agent, action = %kind, reason = %decision.reason, "action not accepted");
        ctx.update(|c| {
            c.add_action(
                "action_not_accepted",
                json!({
                    "agent": agent,
                    "action_kind": kind,
                    "verdict": decision.verdict,
                    "reason": decision.reason,
                    "payload": payload,
                }),
            );
        });
        Err(decision.reason)
    }

    /// Store artifacts in the cache when one is attached; failures only warn.
    pub(crate) fn cache_artifacts(
        &self,
        task_id: &str,
        role: AgentRole,
        files: &[(String, String)],
        preview: &str,
    ) {
        let Some(cache) = &self.cache else {
            return;
        };
        if files.is_empty() {
            return;
        }
        let preview: String = preview.chars().take(200).collect();
        if let Err(err) = cache.create_entry(task_id, role, files, Some(preview)) {
            warn!(task_id, err = %format!("{err:#}"), "failed to cache artifacts");
        }
    }
}

/// Record an agent step in the action history and log it.
pub(crate) fn log_action(ctx: &SharedContext, agent: &str, action: &str, details: Value) {
    info!(agent, action, "agent action");
    ctx.update(|c| c.add_action(action, details));
}

/// Outcome of writing one generated file.
pub(crate) enum FileOutcome {
    Written,
    Skipped(String),
}

/// Gate, write and record one generated file.
///
/// The ledger is appended only after the write succeeded: `files_modified`
/// when the file already existed, `files_created` otherwise.
pub(crate) async fn write_generated_file(
    deps: &AgentDeps,
    ctx: &SharedContext,
    agent: &str,
    task_id: &str,
    path: &str,
    content: &str,
) -> Result<FileOutcome> {
    let payload = json!({
        "file_path": path,
        "file_size": content.len(),
        "task_id": task_id,
    });
    if let Err(reason) = deps.admit(ctx, agent, ActionKind::FileWrite, payload) {
        return Ok(FileOutcome::Skipped(reason));
    }

    let existed = deps.storage.exists(path).await.unwrap_or_else(|err| {
        warn!(path, err = %format!("{err:#}"), "existence check failed, assuming new file");
        false
    });
    deps.storage
        .write(path, content)
        .await
        .map_err(|err| err.context(format!("write {path}")))?;
    ctx.update(|c| {
        if existed {
            c.record_file_modified(path);
        } else {
            c.record_file_created(path);
        }
    });
    Ok(FileOutcome::Written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::context::Context;
    use crate::test_support::{MemoryStorage, ScriptedAgent, ScriptedModel};

    fn shared() -> SharedContext {
        SharedContext::new(Context::new("/p", "p", ""))
    }

    #[test]
    fn registry_replaces_same_role() {
        let mut registry = RoleRegistry::default();
        let first = RoleHandle::Coder(Arc::new(ScriptedAgent::new("first", AgentRole::Coder)));
        let second = RoleHandle::Coder(Arc::new(ScriptedAgent::new("second", AgentRole::Coder)));

        assert!(registry.register(first).is_none());
        let replaced = registry.register(second).expect("replaced");
        assert_eq!(replaced.name(), "first");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(AgentRole::Coder).map(RoleHandle::name), Some("second"));
        assert!(registry.planner().is_none());
    }

    #[tokio::test]
    async fn ungated_write_records_created_then_modified() {
        let storage = Arc::new(MemoryStorage::default());
        let deps = AgentDeps::new(Arc::new(ScriptedModel::new(Vec::new())), storage.clone());
        let ctx = shared();

        let first = write_generated_file(&deps, &ctx, "Coder", "t", "a.py", "x = 1")
            .await
            .expect("write");
        assert!(matches!(first, FileOutcome::Written));
        write_generated_file(&deps, &ctx, "Coder", "t", "a.py", "x = 2")
            .await
            .expect("rewrite");

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.files_created, vec!["a.py"]);
        assert_eq!(snapshot.files_modified, vec!["a.py"]);
        assert_eq!(storage.get("a.py").as_deref(), Some("x = 2"));
    }

    #[tokio::test]
    async fn refused_write_is_recorded_not_performed() {
        let storage = Arc::new(MemoryStorage::default());
        let gate = Arc::new(AutoAcceptGate::new(true, 10));
        let deps = AgentDeps::new(Arc::new(ScriptedModel::new(Vec::new())), storage.clone())
            .with_gate(gate);
        let ctx = shared();

        let outcome = write_generated_file(&deps, &ctx, "Coder", "t", ".env", "KEY=1")
            .await
            .expect("gate check");
        match outcome {
            FileOutcome::Skipped(reason) => assert!(reason.contains("*.env")),
            FileOutcome::Written => panic!("blocked file was written"),
        }
        assert!(storage.get(".env").is_none());

        let snapshot = ctx.snapshot();
        assert!(snapshot.files_created.is_empty());
        assert_eq!(snapshot.action_history.len(), 1);
        assert_eq!(snapshot.action_history[0].action_type, "action_not_accepted");
    }

    #[tokio::test]
    async fn failed_write_leaves_ledger_untouched() {
        let storage = Arc::new(MemoryStorage::default());
        storage.fail_writes(true);
        let deps = AgentDeps::new(Arc::new(ScriptedModel::new(Vec::new())), storage);
        let ctx = shared();

        let result = write_generated_file(&deps, &ctx, "Coder", "t", "a.py", "x").await;
        assert!(result.is_err());
        assert!(ctx.snapshot().files_created.is_empty());
    }
}
