use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::{Agent, AgentDeps, Planner, ProjectInfo, log_action};
use crate::core::context::SharedContext;
use crate::core::parse::{PlannedSubtask, fallback_plan, parse_plan};
use crate::core::types::{AgentRole, ROOT_TASK_ID, Task};

const TEMPERATURE: f32 = 0.7;
const MAX_TOKENS: u32 = 2000;

/// Decomposes a task description into prioritized, role-assigned subtasks.
pub struct PlannerAgent {
    name: String,
    deps: AgentDeps,
}

impl PlannerAgent {
    pub fn new(deps: AgentDeps) -> Self {
        Self {
            name: "Planner".to_string(),
            deps,
        }
    }

    async fn generate_plan(
        &self,
        description: &str,
        ctx: &SharedContext,
    ) -> Result<Vec<PlannedSubtask>> {
        let prompt = ctx.read(|c| {
            self.deps
                .prompts
                .planner(&ProjectInfo::from_context(c), description)
        })?;
        let response = self
            .deps
            .model
            .generate(&prompt, TEMPERATURE, MAX_TOKENS)
            .await
            .context("planner model call")?;
        Ok(parse_plan(&response).unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "plan output unusable, using single-task fallback");
            fallback_plan(&response)
        }))
    }

    #[instrument(skip_all, fields(parent_id))]
    async fn plan_under(
        &self,
        parent_id: &str,
        description: &str,
        ctx: &SharedContext,
    ) -> Result<Vec<String>> {
        let plan = self.generate_plan(description, ctx).await?;
        let ids = ctx.update(|c| {
            let ids = subtask_ids(parent_id, plan.len());
            for (idx, (planned, id)) in plan.iter().zip(&ids).enumerate() {
                let dependencies = resolve_dependencies(&planned.dependencies, &ids, idx);
                let mut task = Task::new(id.clone(), planned.description.clone())
                    .with_role(planned.role)
                    .with_dependencies(dependencies);
                task.priority = planned.priority;
                task.metadata.insert("parent".to_string(), json!(parent_id));
                c.insert_task(task);
            }
            c.add_message(
                "assistant",
                format!("Created plan with {} subtasks", ids.len()),
                Some(AgentRole::Planner),
            );
            ids
        });
        log_action(
            ctx,
            &self.name,
            "plan",
            json!({ "parent": parent_id, "subtasks": ids }),
        );
        info!(parent_id, subtasks = ids.len(), "plan created");
        Ok(ids)
    }
}

fn subtask_ids(parent_id: &str, count: usize) -> Vec<String> {
    (1..=count)
        .map(|n| format!("{parent_id}_subtask_{n}"))
        .collect()
}

/// Map plan-relative references ("1", "2", ...) to sibling ids. Anything else
/// is kept as written so existing task ids still resolve. A subtask naming
/// itself is dropped.
fn resolve_dependencies(raw: &[String], siblings: &[String], own_idx: usize) -> Vec<String> {
    raw.iter()
        .filter_map(|dep| {
            let resolved = match dep.trim().parse::<usize>() {
                Ok(n) if (1..=siblings.len()).contains(&n) => siblings[n - 1].clone(),
                _ => dep.trim().to_string(),
            };
            if resolved == siblings[own_idx] || resolved.is_empty() {
                warn!(dep = %dep, "ignoring self or empty dependency");
                return None;
            }
            Some(resolved)
        })
        .collect()
}

#[async_trait]
impl Agent for PlannerAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        AgentRole::Planner
    }

    async fn execute(&self, task: &Task, ctx: &SharedContext) -> Result<String> {
        let ids = self.plan_under(&task.id, &task.description, ctx).await?;
        ctx.update(|c| {
            if let Some(parent) = c.tasks.get_mut(&task.id) {
                parent.subtasks.extend(ids.iter().cloned());
            }
        });
        Ok(format!("plan generated with {} subtasks", ids.len()))
    }
}

#[async_trait]
impl Planner for PlannerAgent {
    async fn plan(&self, description: &str, ctx: &SharedContext) -> Result<Vec<String>> {
        self.plan_under(ROOT_TASK_ID, description, ctx).await
    }
}
