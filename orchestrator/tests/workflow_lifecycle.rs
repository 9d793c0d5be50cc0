//! Workflow-level tests driving `execute_task` and the subtask scheduler with
//! scripted agents.

use std::sync::Arc;

use orchestrator::agents::{AgentDeps, PlannerAgent, RoleHandle};
use orchestrator::core::types::{AgentRole, ROOT_TASK_ID, TaskStatus};
use orchestrator::io::config::OrchestratorConfig;
use orchestrator::test_support::{MemoryStorage, ScriptedAgent, ScriptedModel, pending_task};
use orchestrator::workflow::{Orchestrator, TASK_COMPLETED_MESSAGE};

fn orchestrator(max_iterations: u32) -> Orchestrator {
    let config = OrchestratorConfig {
        max_iterations,
        ..OrchestratorConfig::default()
    };
    Orchestrator::new(config, Arc::new(MemoryStorage::default()))
}

/// Full pipeline: plan two subtasks, run both in one iteration, review and
/// test once.
///
/// Expected counters: 2 subtasks + root completed, one scheduler iteration.
#[tokio::test]
async fn hello_function_scenario_completes() {
    let mut orch = orchestrator(10);
    let planner = Arc::new(ScriptedAgent::new("Planner", AgentRole::Planner).with_plan(vec![
        pending_task("main_subtask_1", AgentRole::Coder),
        pending_task("main_subtask_2", AgentRole::Tester),
    ]));
    let coder = Arc::new(ScriptedAgent::new("Coder", AgentRole::Coder));
    let reviewer = Arc::new(ScriptedAgent::new("Reviewer", AgentRole::Reviewer));
    let tester = Arc::new(ScriptedAgent::new("Tester", AgentRole::Tester));
    orch.register_agent(RoleHandle::Planner(planner.clone()));
    orch.register_agent(RoleHandle::Coder(coder.clone()));
    orch.register_agent(RoleHandle::Reviewer(reviewer.clone()));
    orch.register_agent(RoleHandle::Tester(tester.clone()));

    orch.initialize_project("/work/hello", "hello", "").await;
    let outcome = orch.execute_task("add a hello function").await;

    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.message.as_deref(), Some(TASK_COMPLETED_MESSAGE));
    let snapshot = orch.snapshot().expect("context");
    let root = snapshot.get_task(ROOT_TASK_ID).expect("root");
    assert_eq!(root.status, TaskStatus::Completed);
    assert_eq!(root.subtasks, vec!["main_subtask_1", "main_subtask_2"]);
    assert_eq!(snapshot.tasks_completed, 3);
    assert_eq!(snapshot.tasks_failed, 0);
    assert_eq!(snapshot.total_iterations, 1);

    assert_eq!(planner.phase_calls(), 1);
    assert_eq!(coder.executions(), 1);
    assert_eq!(tester.executions(), 1);
    assert_eq!(reviewer.phase_calls(), 1);
    assert_eq!(tester.phase_calls(), 1);

    assert_eq!(outcome.context["tasks_completed"], 3);
    assert_eq!(outcome.context["project_name"], "hello");
}

/// Tasks whose role has no agent stay pending; the loop stops at the ceiling.
#[tokio::test]
async fn unregistered_role_runs_to_iteration_ceiling() {
    let orch = orchestrator(4);
    let ctx = orch.initialize_project("/p", "p", "").await;
    ctx.update(|c| c.insert_task(pending_task("orphan", AgentRole::Coder)));

    let report = orch.run_subtasks(&ctx).await;
    assert_eq!(report.iterations, 4);
    assert_eq!(report.unregistered, 4);
    let snapshot = ctx.snapshot();
    assert_eq!(snapshot.total_iterations, 4);
    assert_eq!(
        snapshot.get_task("orphan").map(|t| t.status),
        Some(TaskStatus::Pending)
    );
}

/// Repeated scheduler runs on one context add to its iteration total.
#[tokio::test]
async fn iteration_total_accumulates_across_runs() {
    let orch = orchestrator(2);
    let ctx = orch.initialize_project("/p", "p", "").await;
    ctx.update(|c| c.insert_task(pending_task("orphan", AgentRole::Coder)));

    let first = orch.run_subtasks(&ctx).await;
    let second = orch.run_subtasks(&ctx).await;
    assert_eq!(first.iterations, 2);
    assert_eq!(second.iterations, 2);
    assert_eq!(ctx.snapshot().total_iterations, 4);
}

/// An agent that keeps enqueueing work cannot keep the loop alive forever.
#[tokio::test]
async fn self_replicating_agent_stops_at_ceiling() {
    let mut orch = orchestrator(3);
    let coder = Arc::new(ScriptedAgent::new("Coder", AgentRole::Coder).replicating());
    orch.register_agent(RoleHandle::Coder(coder.clone()));
    let ctx = orch.initialize_project("/p", "p", "").await;
    ctx.update(|c| c.insert_task(pending_task("seed", AgentRole::Coder)));

    let report = orch.run_subtasks(&ctx).await;
    assert_eq!(report.iterations, 3);
    assert_eq!(coder.executions(), 3);
    let snapshot = ctx.snapshot();
    assert_eq!(snapshot.total_iterations, 3);
    assert_eq!(snapshot.get_pending_tasks().len(), 1);
}

/// A failed dependency blocks its dependents; a missing one does too.
#[tokio::test]
async fn failed_and_missing_dependencies_block() {
    let mut orch = orchestrator(10);
    orch.register_agent(RoleHandle::Coder(Arc::new(
        ScriptedAgent::new("Coder", AgentRole::Coder).failing_on("a"),
    )));
    let ctx = orch.initialize_project("/p", "p", "").await;
    ctx.update(|c| {
        c.insert_task(pending_task("a", AgentRole::Coder));
        c.insert_task(pending_task("b", AgentRole::Coder).with_dependencies(vec!["a".into()]));
        c.insert_task(pending_task("c", AgentRole::Coder).with_dependencies(vec!["ghost".into()]));
    });

    let report = orch.run_subtasks(&ctx).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.blocked, 2);
    assert_eq!(report.iterations, 1);

    let snapshot = ctx.snapshot();
    let b = snapshot.get_task("b").expect("b");
    assert_eq!(b.status, TaskStatus::Blocked);
    assert_eq!(b.result.as_deref(), Some("dependency 'a' is failed"));
    let c = snapshot.get_task("c").expect("c");
    assert_eq!(c.status, TaskStatus::Blocked);
    assert_eq!(c.result.as_deref(), Some("dependency 'ghost' does not exist"));
}

/// A phase error marks the root failed and still returns the context.
#[tokio::test]
async fn planner_failure_fails_root_task() {
    let mut orch = orchestrator(10);
    // Empty script: the planner's first model call fails.
    let model = Arc::new(ScriptedModel::new(Vec::new()));
    let deps = AgentDeps::new(model, Arc::new(MemoryStorage::default()));
    orch.register_agent(RoleHandle::Planner(Arc::new(PlannerAgent::new(deps))));
    orch.initialize_project("/p", "p", "").await;

    let outcome = orch.execute_task("anything").await;
    assert!(!outcome.success);
    let error = outcome.error.expect("error text");
    assert!(error.contains("planning failed"), "{error}");
    assert_eq!(outcome.context["tasks"]["main"]["status"], "failed");
}

/// Re-initializing replaces the context; reset drops it.
#[tokio::test]
async fn reinitialize_and_reset_replace_context() {
    let orch = orchestrator(10);
    orch.initialize_project("/one", "one", "").await;
    orch.initialize_project("/two", "two", "").await;
    assert_eq!(orch.snapshot().map(|c| c.project_name), Some("two".to_string()));

    orch.reset();
    assert!(orch.snapshot().is_none());
    let outcome = orch.execute_task("late").await;
    assert_eq!(outcome.error.as_deref(), Some("context not initialized"));
}
