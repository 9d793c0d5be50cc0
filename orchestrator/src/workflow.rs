//! The workflow driver: plan, run subtasks, review, test.
//!
//! The [`Orchestrator`] owns the role registry, the current run context, the
//! auto-accept gate and the optional monitoring bundle. `execute_task` never
//! returns an error; every failure is folded into the [`TaskOutcome`].

use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context as _, Result};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::agents::{RoleHandle, RoleRegistry};
use crate::core::context::{Context, SharedContext};
use crate::core::gate::{AutoAcceptGate, HistoryEntry};
use crate::core::selector::{Readiness, readiness};
use crate::core::types::{AgentRole, ROOT_TASK_ID, Task, TaskStatus};
use crate::events::{EventBus, Phase, WorkflowEvent};
use crate::io::cache::{CacheEntry, CachePreview};
use crate::io::config::OrchestratorConfig;
use crate::io::storage::ProjectStorage;
use crate::monitoring::{MonitoringBundle, UsageReport};

pub const TASK_COMPLETED_MESSAGE: &str = "task completed successfully";

/// Result of one `execute_task` call.
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Serialized context, `null` when no project was initialized.
    pub context: Value,
}

impl TaskOutcome {
    fn failure(error: impl Into<String>, context: Value) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
            context,
        }
    }
}

/// Counters from one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerReport {
    pub iterations: u32,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    /// Dispatch attempts skipped because no agent fills the task's role.
    pub unregistered: usize,
}

fn monitoring_disabled() -> Value {
    json!({ "error": "monitoring disabled" })
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| json!({ "error": err.to_string() }))
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    storage: Arc<dyn ProjectStorage>,
    registry: RoleRegistry,
    context: RwLock<Option<SharedContext>>,
    monitoring: Option<MonitoringBundle>,
    gate: Arc<AutoAcceptGate>,
    events: EventBus,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, storage: Arc<dyn ProjectStorage>) -> Self {
        let gate = Arc::new(AutoAcceptGate::new(
            config.auto_accept.enabled,
            config.auto_accept.history_capacity,
        ));
        Self {
            config,
            storage,
            registry: RoleRegistry::default(),
            context: RwLock::new(None),
            monitoring: None,
            gate,
            events: EventBus::default(),
        }
    }

    /// Share `gate` with the agents instead of the one built from config.
    pub fn with_gate(mut self, gate: Arc<AutoAcceptGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_monitoring(mut self, monitoring: MonitoringBundle) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<AutoAcceptGate> {
        &self.gate
    }

    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    /// The monitoring bundle, when monitoring is enabled and one is attached.
    pub fn monitoring(&self) -> Option<&MonitoringBundle> {
        self.monitoring
            .as_ref()
            .filter(|_| self.config.monitoring.enabled)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    /// Register `handle` under its role, replacing any earlier agent.
    pub fn register_agent(&mut self, handle: RoleHandle) {
        let role = handle.role();
        let name = handle.name().to_string();
        if let Some(previous) = self.registry.register(handle) {
            info!(%role, replaced = previous.name(), agent = %name, "agent replaced");
        } else {
            info!(%role, agent = %name, "agent registered");
        }
        if let Some(monitoring) = self.monitoring() {
            monitoring.dashboard.register_agent(&name, role);
        }
    }

    /// Start a fresh run context, replacing any previous one.
    ///
    /// Storage connectivity is probed; a failed probe is only logged.
    #[instrument(skip_all, fields(project = name))]
    pub async fn initialize_project(
        &self,
        path: &str,
        name: &str,
        description: &str,
    ) -> SharedContext {
        let ctx = SharedContext::new(Context::new(path, name, description));
        *self.context.write().unwrap_or_else(PoisonError::into_inner) = Some(ctx.clone());

        if self.storage.check_connection().await {
            debug!(backend = self.storage.backend(), "storage reachable");
        } else {
            warn!(
                backend = self.storage.backend(),
                "storage not reachable, continuing anyway"
            );
        }
        self.events.publish(WorkflowEvent::ProjectInitialized {
            project_name: name.to_string(),
        });
        info!(path, "project initialized");
        ctx
    }

    pub fn context(&self) -> Option<SharedContext> {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn snapshot(&self) -> Option<Context> {
        self.context().map(|ctx| ctx.snapshot())
    }

    /// Drop the current context.
    pub fn reset(&self) {
        *self.context.write().unwrap_or_else(PoisonError::into_inner) = None;
        info!("orchestrator reset");
    }

    /// Run the full workflow for `description` against the current context.
    #[instrument(skip_all)]
    pub async fn execute_task(&self, description: &str) -> TaskOutcome {
        let Some(ctx) = self.context() else {
            warn!("execute_task called before initialize_project");
            return TaskOutcome::failure("context not initialized", Value::Null);
        };

        ctx.update(|c| {
            c.add_message("system", format!("New task: {description}"), None);
            c.insert_task(Task::new(ROOT_TASK_ID, description).with_status(TaskStatus::InProgress));
            c.current_task = Some(ROOT_TASK_ID.to_string());
        });
        self.publish_status(ROOT_TASK_ID, TaskStatus::InProgress, None);
        info!(description, "task started");

        let outcome = match self.run_pipeline(description, &ctx).await {
            Ok(()) => {
                ctx.update(|c| {
                    c.update_task_status(
                        ROOT_TASK_ID,
                        TaskStatus::Completed,
                        Some(TASK_COMPLETED_MESSAGE.to_string()),
                    );
                });
                self.publish_status(ROOT_TASK_ID, TaskStatus::Completed, None);
                info!("task completed");
                TaskOutcome {
                    success: true,
                    message: Some(TASK_COMPLETED_MESSAGE.to_string()),
                    error: None,
                    context: ctx.serialize(),
                }
            }
            Err(err) => {
                let error = format!("{err:#}");
                ctx.update(|c| {
                    c.update_task_status(ROOT_TASK_ID, TaskStatus::Failed, Some(error.clone()));
                });
                self.publish_status(ROOT_TASK_ID, TaskStatus::Failed, None);
                warn!(error = %error, "task failed");
                TaskOutcome::failure(error, ctx.serialize())
            }
        };
        self.events.publish(WorkflowEvent::WorkflowFinished {
            success: outcome.success,
        });
        outcome
    }

    async fn run_pipeline(&self, description: &str, ctx: &SharedContext) -> Result<()> {
        if let Some(planner) = self.registry.planner() {
            self.events.publish(WorkflowEvent::PhaseStarted {
                phase: Phase::Planning,
            });
            self.agent_started(planner.name(), ROOT_TASK_ID);
            let planned = planner.plan(description, ctx).await;
            self.agent_finished(planner.name(), planned.as_ref().err());
            let ids = planned.context("planning failed")?;
            ctx.update(|c| {
                if let Some(root) = c.tasks.get_mut(ROOT_TASK_ID) {
                    root.subtasks = ids;
                }
            });
        } else {
            debug!("no planner registered, skipping planning");
        }

        self.events.publish(WorkflowEvent::PhaseStarted {
            phase: Phase::Subtasks,
        });
        let report = self.run_subtasks(ctx).await;
        info!(
            iterations = report.iterations,
            dispatched = report.dispatched,
            completed = report.completed,
            failed = report.failed,
            blocked = report.blocked,
            "subtasks finished"
        );

        if let Some(reviewer) = self.registry.reviewer() {
            self.events.publish(WorkflowEvent::PhaseStarted {
                phase: Phase::Review,
            });
            self.agent_started(reviewer.name(), ROOT_TASK_ID);
            let reviewed = reviewer.review(ctx).await;
            self.agent_finished(reviewer.name(), reviewed.as_ref().err());
            let summary = reviewed.context("review failed")?;
            ctx.update(|c| {
                c.add_message(
                    "assistant",
                    format!("Review: {}", summary.summary),
                    Some(AgentRole::Reviewer),
                );
            });
        }

        if let Some(tester) = self.registry.tester() {
            self.events.publish(WorkflowEvent::PhaseStarted {
                phase: Phase::Testing,
            });
            self.agent_started(tester.name(), ROOT_TASK_ID);
            let tested = tester.test(ctx).await;
            self.agent_finished(tester.name(), tested.as_ref().err());
            let summary = tested.context("testing failed")?;
            ctx.update(|c| {
                c.add_message(
                    "assistant",
                    format!("Tests: {}", summary.summary),
                    Some(AgentRole::Tester),
                );
            });
        }
        Ok(())
    }

    /// Dispatch pending subtasks until none remain or the iteration ceiling
    /// is reached.
    ///
    /// Readiness is re-checked at dispatch time, so a task whose dependency
    /// completed earlier in the same iteration runs in that iteration.
    #[instrument(skip_all, fields(max_iterations = self.config.max_iterations))]
    pub async fn run_subtasks(&self, ctx: &SharedContext) -> SchedulerReport {
        let mut report = SchedulerReport::default();
        for iteration in 1..=self.config.max_iterations {
            let pending = ctx.read(|c| c.get_pending_tasks());
            if pending.is_empty() {
                break;
            }
            debug!(iteration, pending = pending.len(), "scheduler iteration");

            let mut dispatched = 0;
            for task in pending {
                let Some(role) = task.assigned_role else {
                    continue;
                };
                let Some(handle) = self.registry.get(role) else {
                    warn!(task_id = %task.id, %role, "no agent registered for role, skipping");
                    report.unregistered += 1;
                    continue;
                };

                let current = ctx.read(|c| {
                    c.get_task(&task.id)
                        .filter(|t| t.status == TaskStatus::Pending)
                        .map(|t| (t.clone(), readiness(t, c)))
                });
                let Some((current, ready)) = current else {
                    continue;
                };
                match ready {
                    Readiness::Waiting => continue,
                    Readiness::Blocked(reason) => {
                        info!(task_id = %current.id, reason = %reason, "task blocked");
                        ctx.update(|c| {
                            c.update_task_status(&current.id, TaskStatus::Blocked, Some(reason));
                        });
                        self.publish_status(&current.id, TaskStatus::Blocked, Some(role));
                        report.blocked += 1;
                        continue;
                    }
                    Readiness::Ready => {}
                }

                dispatched += 1;
                if self.dispatch(handle, &current, ctx).await {
                    report.completed += 1;
                } else {
                    report.failed += 1;
                }
            }

            // Cumulative for the context; `report.iterations` is this run's count.
            ctx.update(|c| c.total_iterations += 1);
            report.iterations = iteration;
            report.dispatched += dispatched;
            self.events.publish(WorkflowEvent::IterationCompleted {
                iteration,
                dispatched,
            });
        }
        report
    }

    /// Run one task on its agent; returns whether it completed.
    async fn dispatch(&self, handle: &RoleHandle, task: &Task, ctx: &SharedContext) -> bool {
        let role = handle.role();
        ctx.update(|c| {
            c.current_task = Some(task.id.clone());
            c.update_task_status(&task.id, TaskStatus::InProgress, None);
        });
        self.publish_status(&task.id, TaskStatus::InProgress, Some(role));
        self.agent_started(handle.name(), &task.id);
        debug!(task_id = %task.id, agent = handle.name(), "dispatching task");

        let result = handle.execute(task, ctx).await;
        self.agent_finished(handle.name(), result.as_ref().err());
        match result {
            Ok(text) => {
                ctx.update(|c| c.update_task_status(&task.id, TaskStatus::Completed, Some(text)));
                self.publish_status(&task.id, TaskStatus::Completed, Some(role));
                true
            }
            Err(err) => {
                let error = format!("{err:#}");
                warn!(task_id = %task.id, error = %error, "task failed");
                ctx.update(|c| c.update_task_status(&task.id, TaskStatus::Failed, Some(error)));
                self.publish_status(&task.id, TaskStatus::Failed, Some(role));
                false
            }
        }
    }

    fn publish_status(&self, task_id: &str, status: TaskStatus, role: Option<AgentRole>) {
        self.events.publish(WorkflowEvent::TaskStatusChanged {
            task_id: task_id.to_string(),
            status,
            role,
        });
    }

    fn agent_started(&self, name: &str, task_id: &str) {
        if let Some(monitoring) = self.monitoring() {
            monitoring.dashboard.agent_started(name, task_id);
        }
    }

    fn agent_finished(&self, name: &str, error: Option<&anyhow::Error>) {
        if let Some(monitoring) = self.monitoring() {
            let message = error.map(|err| format!("{err:#}"));
            monitoring.dashboard.agent_finished(name, message.as_deref());
        }
    }

    // Monitoring pass-throughs.

    pub fn dashboard_data(&self) -> Value {
        self.monitoring().map_or_else(monitoring_disabled, |m| {
            to_json(&m.full_data(self.gate.is_enabled()))
        })
    }

    pub fn quota_summary(&self) -> Value {
        self.monitoring()
            .map_or_else(monitoring_disabled, |m| to_json(&m.dashboard.quota_summary()))
    }

    pub fn agents_summary(&self) -> Value {
        self.monitoring()
            .map_or_else(monitoring_disabled, |m| to_json(&m.dashboard.agents_summary()))
    }

    pub fn cache_summary(&self) -> Value {
        match self.monitoring().and_then(|m| m.cache.as_ref()) {
            Some(cache) => to_json(&cache.summary()),
            None => monitoring_disabled(),
        }
    }

    pub fn cache_statistics(&self) -> Value {
        match self.monitoring().and_then(|m| m.cache.as_ref()) {
            Some(cache) => to_json(&cache.statistics()),
            None => monitoring_disabled(),
        }
    }

    pub fn usage_trends(&self, minutes: i64) -> Value {
        self.monitoring().map_or_else(monitoring_disabled, |m| {
            to_json(&m.dashboard.usage_trends(minutes))
        })
    }

    pub fn auto_accept_stats(&self) -> Value {
        self.monitoring()
            .map_or_else(monitoring_disabled, |_| to_json(&self.gate.statistics()))
    }

    pub async fn run_diagnostics(&self) -> Value {
        match self.monitoring() {
            Some(m) => to_json(&m.recovery.run_diagnostics().await),
            None => monitoring_disabled(),
        }
    }

    pub async fn health_check(&self) -> Value {
        match self.monitoring() {
            Some(m) => to_json(&m.recovery.health_check().await),
            None => monitoring_disabled(),
        }
    }

    pub fn system_metrics(&self) -> Value {
        self.monitoring()
            .map_or_else(monitoring_disabled, |m| to_json(&m.recovery.system_metrics()))
    }

    pub fn reset_status_cache(&self) -> Value {
        self.monitoring()
            .map_or_else(monitoring_disabled, |m| to_json(&m.recovery.reset_status_cache()))
    }

    /// Record reported model credits; false when monitoring is off.
    pub fn record_model_usage(&self, report: &UsageReport) -> bool {
        match self.monitoring() {
            Some(m) => {
                m.dashboard.record_usage(report);
                true
            }
            None => false,
        }
    }

    // Cache operations.

    pub fn clear_cache(&self) -> Result<usize> {
        match self.monitoring().and_then(|m| m.cache.as_ref()) {
            Some(cache) => cache.clear_all(),
            None => Ok(0),
        }
    }

    pub fn auto_clean_cache(&self) -> Result<usize> {
        match self.monitoring().and_then(|m| m.cache.as_ref()) {
            Some(cache) => cache.auto_clean(),
            None => Ok(0),
        }
    }

    /// Drop cache entries older than `max_age_days` (configured default when
    /// `None`).
    pub fn cleanup_old_cache(&self, max_age_days: Option<u32>) -> Result<usize> {
        match self.monitoring().and_then(|m| m.cache.as_ref()) {
            Some(cache) => cache.cleanup_old(max_age_days),
            None => Ok(0),
        }
    }

    pub fn delete_cache_entry(&self, task_id: &str) -> Result<bool> {
        match self.monitoring().and_then(|m| m.cache.as_ref()) {
            Some(cache) => cache.delete_entry(task_id),
            None => Ok(false),
        }
    }

    pub fn cache_entries(&self, role: Option<AgentRole>) -> Vec<CacheEntry> {
        self.monitoring()
            .and_then(|m| m.cache.as_ref())
            .map(|cache| cache.list_entries(role))
            .unwrap_or_default()
    }

    pub fn cache_preview(&self, task_id: &str) -> Option<CachePreview> {
        self.monitoring()
            .and_then(|m| m.cache.as_ref())
            .and_then(|cache| cache.preview(task_id))
    }

    // Gate operations.

    pub fn toggle_auto_accept(&self) -> bool {
        let enabled = self.gate.toggle();
        info!(enabled, "auto-accept toggled");
        self.events
            .publish(WorkflowEvent::AutoAcceptToggled { enabled });
        enabled
    }

    pub fn set_auto_accept(&self, enabled: bool) {
        self.gate.set_enabled(enabled);
        info!(enabled, "auto-accept set");
        self.events
            .publish(WorkflowEvent::AutoAcceptToggled { enabled });
    }

    pub fn recent_actions(&self, limit: usize) -> Vec<HistoryEntry> {
        self.gate.recent_actions(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryStorage, ScriptedAgent, pending_task};

    fn orchestrator(max_iterations: u32) -> Orchestrator {
        let config = OrchestratorConfig {
            max_iterations,
            ..OrchestratorConfig::default()
        };
        Orchestrator::new(config, Arc::new(MemoryStorage::default()))
    }

    #[tokio::test]
    async fn execute_without_context_fails_cleanly() {
        let outcome = orchestrator(10).execute_task("anything").await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("context not initialized"));
        assert_eq!(outcome.context, Value::Null);
    }

    #[tokio::test]
    async fn no_agents_completes_root_without_iterations() {
        let orch = orchestrator(10);
        orch.initialize_project("/p", "p", "").await;

        let outcome = orch.execute_task("do nothing").await;
        assert!(outcome.success);
        let snapshot = orch.snapshot().expect("context");
        assert_eq!(
            snapshot.get_task(ROOT_TASK_ID).map(|t| t.status),
            Some(TaskStatus::Completed)
        );
        assert_eq!(snapshot.tasks_completed, 1);
        assert_eq!(snapshot.total_iterations, 0);
    }

    #[tokio::test]
    async fn failing_subtask_does_not_stop_siblings() {
        let mut orch = orchestrator(10);
        let coder = Arc::new(ScriptedAgent::new("Coder", AgentRole::Coder).failing_on("t1"));
        orch.register_agent(RoleHandle::Coder(coder.clone()));
        let ctx = orch.initialize_project("/p", "p", "").await;
        ctx.update(|c| {
            c.insert_task(pending_task("t1", AgentRole::Coder));
            c.insert_task(pending_task("t2", AgentRole::Coder));
        });

        let report = orch.run_subtasks(&ctx).await;
        assert_eq!(report.iterations, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.get_task("t1").map(|t| t.status), Some(TaskStatus::Failed));
        assert_eq!(snapshot.get_task("t2").map(|t| t.status), Some(TaskStatus::Completed));
        assert_eq!(coder.executions(), 2);
    }

    #[tokio::test]
    async fn dependent_task_runs_in_same_iteration_once_ready() {
        let mut orch = orchestrator(10);
        orch.register_agent(RoleHandle::Coder(Arc::new(ScriptedAgent::new(
            "Coder",
            AgentRole::Coder,
        ))));
        let ctx = orch.initialize_project("/p", "p", "").await;
        ctx.update(|c| {
            c.insert_task(pending_task("a", AgentRole::Coder));
            c.insert_task(
                pending_task("b", AgentRole::Coder).with_dependencies(vec!["a".to_string()]),
            );
        });

        let report = orch.run_subtasks(&ctx).await;
        assert_eq!(report.iterations, 1);
        assert_eq!(report.completed, 2);
    }

    #[tokio::test]
    async fn passthroughs_report_disabled_monitoring() {
        let orch = orchestrator(10);
        let disabled = json!({ "error": "monitoring disabled" });
        assert_eq!(orch.dashboard_data(), disabled);
        assert_eq!(orch.quota_summary(), disabled);
        assert_eq!(orch.run_diagnostics().await, disabled);
        assert_eq!(orch.clear_cache().expect("clear"), 0);
        assert!(orch.cache_entries(None).is_empty());
    }

    #[tokio::test]
    async fn events_follow_status_transitions() {
        let mut orch = orchestrator(10);
        orch.register_agent(RoleHandle::Coder(Arc::new(ScriptedAgent::new(
            "Coder",
            AgentRole::Coder,
        ))));
        let ctx = orch.initialize_project("/p", "p", "").await;
        ctx.update(|c| c.insert_task(pending_task("t1", AgentRole::Coder)));
        let mut rx = orch.subscribe();

        orch.run_subtasks(&ctx).await;
        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkflowEvent::TaskStatusChanged { task_id, status, .. } = event {
                statuses.push((task_id, status));
            }
        }
        assert_eq!(
            statuses,
            vec![
                ("t1".to_string(), TaskStatus::InProgress),
                ("t1".to_string(), TaskStatus::Completed),
            ]
        );
    }

    #[test]
    fn toggle_flips_shared_gate() {
        let orch = orchestrator(10);
        assert!(!orch.gate().is_enabled());
        assert!(orch.toggle_auto_accept());
        assert!(orch.gate().is_enabled());
        orch.set_auto_accept(false);
        assert!(!orch.gate().is_enabled());
    }
}
