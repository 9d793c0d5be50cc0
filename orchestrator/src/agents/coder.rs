use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::{Agent, AgentDeps, FileOutcome, ProjectInfo, log_action, write_generated_file};
use crate::core::context::SharedContext;
use crate::core::parse::{GeneratedFile, fallback_files, parse_files};
use crate::core::types::{ActionKind, AgentRole, Task};

const TEMPERATURE: f32 = 0.3;
const MAX_TOKENS: u32 = 4000;

/// Generates files for a task and writes them through project storage.
pub struct CoderAgent {
    name: String,
    deps: AgentDeps,
}

impl CoderAgent {
    pub fn new(deps: AgentDeps) -> Self {
        Self {
            name: "Coder".to_string(),
            deps,
        }
    }

    async fn generate_files(&self, task: &Task, ctx: &SharedContext) -> Result<Vec<GeneratedFile>> {
        let prompt = ctx.read(|c| {
            self.deps.prompts.coder(
                &ProjectInfo::from_context(c),
                &task.description,
                &c.ledger_files(),
            )
        })?;
        let response = self
            .deps
            .model
            .generate(&prompt, TEMPERATURE, MAX_TOKENS)
            .await
            .context("coder model call")?;
        Ok(parse_files(&response, "files").unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "code output unusable, saving raw response");
            fallback_files(&response)
        }))
    }
}

#[async_trait]
impl Agent for CoderAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        AgentRole::Coder
    }

    #[instrument(skip_all, fields(task_id = %task.id))]
    async fn execute(&self, task: &Task, ctx: &SharedContext) -> Result<String> {
        log_action(
            ctx,
            &self.name,
            "code_task",
            json!({ "task_id": task.id, "description": task.description }),
        );

        let files = self.generate_files(task, ctx).await?;
        let generated_size: usize = files.iter().map(|f| f.content.len()).sum();
        let payload = json!({
            "task_id": task.id,
            "file_count": files.len(),
            "file_size": generated_size,
        });
        if let Err(reason) = self
            .deps
            .admit(ctx, &self.name, ActionKind::CodeGeneration, payload)
        {
            return Ok(format!("code generation not accepted: {reason}"));
        }

        let mut written = Vec::new();
        let mut skipped = Vec::new();
        for file in &files {
            let outcome = write_generated_file(
                &self.deps,
                ctx,
                &self.name,
                &task.id,
                &file.path,
                &file.content,
            )
            .await?;
            match outcome {
                FileOutcome::Written => written.push((file.path.clone(), file.content.clone())),
                FileOutcome::Skipped(reason) => skipped.push(format!("{} ({reason})", file.path)),
            }
        }

        self.deps
            .cache_artifacts(&task.id, AgentRole::Coder, &written, &task.description);

        let names: Vec<&str> = written.iter().map(|(p, _)| p.as_str()).collect();
        let mut summary = format!("{} file(s) written", written.len());
        if !names.is_empty() {
            summary.push_str(&format!(": {}", names.join(", ")));
        }
        if !skipped.is_empty() {
            summary.push_str(&format!("; {} skipped: {}", skipped.len(), skipped.join(", ")));
        }
        ctx.update(|c| c.add_message("assistant", summary.clone(), Some(AgentRole::Coder)));
        info!(written = written.len(), skipped = skipped.len(), "coding task finished");
        Ok(summary)
    }
}
