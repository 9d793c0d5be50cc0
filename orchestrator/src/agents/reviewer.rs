use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, instrument, warn};

use super::{Agent, AgentDeps, ProjectInfo, ReviewSummary, Reviewer, log_action};
use crate::core::context::SharedContext;
use crate::core::parse::{ReviewFindings, ReviewIssue, fallback_review, parse_review};
use crate::core::types::{ActionKind, AgentRole, Task};

const TEMPERATURE: f32 = 0.3;
const MAX_TOKENS: u32 = 2000;

/// Reviews every file in the context ledger.
pub struct ReviewerAgent {
    name: String,
    deps: AgentDeps,
}

impl ReviewerAgent {
    pub fn new(deps: AgentDeps) -> Self {
        Self {
            name: "Reviewer".to_string(),
            deps,
        }
    }

    async fn review_file(&self, path: &str, ctx: &SharedContext) -> Result<ReviewFindings> {
        let content = match self.deps.storage.read(path).await {
            Ok(Some(content)) if !content.trim().is_empty() => content,
            Ok(_) => return Ok(unreadable(path, "file is missing or empty")),
            Err(err) => {
                warn!(path, err = %format!("{err:#}"), "failed to read file for review");
                return Ok(unreadable(path, &format!("{err:#}")));
            }
        };

        let prompt = ctx.read(|c| {
            self.deps
                .prompts
                .reviewer(&ProjectInfo::from_context(c), path, &content)
        })?;
        let response = self
            .deps
            .model
            .generate(&prompt, TEMPERATURE, MAX_TOKENS)
            .await
            .with_context(|| format!("reviewer model call for {path}"))?;
        let mut findings = parse_review(&response).unwrap_or_else(|err| {
            warn!(path, err = %format!("{err:#}"), "review output unusable, keeping raw text");
            fallback_review(&response)
        });
        for issue in &mut findings.issues {
            issue.file.get_or_insert_with(|| path.to_string());
        }
        for suggestion in &mut findings.suggestions {
            suggestion.file.get_or_insert_with(|| path.to_string());
        }
        Ok(findings)
    }
}

fn unreadable(path: &str, detail: &str) -> ReviewFindings {
    ReviewFindings {
        issues: vec![ReviewIssue {
            severity: "error".to_string(),
            message: format!("unable to read file: {detail}"),
            file: Some(path.to_string()),
            line: None,
            code: None,
        }],
        suggestions: Vec::new(),
    }
}

/// Ledger files in first-seen order, each once.
fn files_to_review(ctx: &SharedContext) -> Vec<String> {
    let mut files = ctx.read(|c| c.ledger_files());
    let mut seen = std::collections::HashSet::new();
    files.retain(|f| seen.insert(f.clone()));
    files
}

#[async_trait]
impl Agent for ReviewerAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        AgentRole::Reviewer
    }

    async fn execute(&self, _task: &Task, ctx: &SharedContext) -> Result<String> {
        Ok(self.review(ctx).await?.summary)
    }
}

#[async_trait]
impl Reviewer for ReviewerAgent {
    #[instrument(skip_all)]
    async fn review(&self, ctx: &SharedContext) -> Result<ReviewSummary> {
        let files = files_to_review(ctx);
        if files.is_empty() {
            return Ok(ReviewSummary {
                summary: "no files to review".to_string(),
                ..ReviewSummary::default()
            });
        }

        let payload = json!({ "files": files, "file_count": files.len() });
        if let Err(reason) = self
            .deps
            .admit(ctx, &self.name, ActionKind::CodeReview, payload)
        {
            return Ok(ReviewSummary {
                summary: format!("review not accepted: {reason}"),
                ..ReviewSummary::default()
            });
        }

        let mut summary = ReviewSummary {
            files_reviewed: files.len(),
            ..ReviewSummary::default()
        };
        for path in &files {
            let findings = self.review_file(path, ctx).await?;
            summary.issues.extend(findings.issues);
            summary.suggestions.extend(findings.suggestions);
        }
        summary.summary = format!(
            "{} file(s) reviewed, {} issue(s) found",
            summary.files_reviewed,
            summary.issues.len()
        );

        log_action(
            ctx,
            &self.name,
            "review",
            json!({
                "files": files,
                "issues": summary.issues.len(),
                "suggestions": summary.suggestions.len(),
            }),
        );
        ctx.update(|c| {
            c.add_message("assistant", summary.summary.clone(), Some(AgentRole::Reviewer))
        });
        info!(
            files = summary.files_reviewed,
            issues = summary.issues.len(),
            "review finished"
        );
        Ok(summary)
    }
}
