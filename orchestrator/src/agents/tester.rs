use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::{
    Agent, AgentDeps, FileOutcome, ProjectInfo, TestSummary, Tester, log_action,
    write_generated_file,
};
use crate::core::context::SharedContext;
use crate::core::parse::{parse_files, parse_test_counts};
use crate::core::pattern::GlobPattern;
use crate::core::types::{ActionKind, AgentRole, Task};
use crate::io::config::TesterConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout, shell_command};

const TEMPERATURE: f32 = 0.3;
const MAX_TOKENS: u32 = 3000;
const MAX_DISCOVERY_DEPTH: usize = 8;
const SKIPPED_DIRS: [&str; 5] = ["node_modules", "target", "__pycache__", "venv", "dist"];

static TEST_FILE_PATTERNS: LazyLock<Vec<GlobPattern>> = LazyLock::new(|| {
    [
        "test_*.py",
        "*_test.py",
        "*.test.js",
        "*.test.ts",
        "*_test.go",
        "*tests/*.rs",
    ]
    .iter()
    .map(|p| GlobPattern::new(p).expect("test file pattern should be valid"))
    .collect()
});

fn is_test_file(path: &str) -> bool {
    let normalized = path.replace('\\', "/");
    let file_name = normalized.rsplit('/').next().unwrap_or(&normalized);
    TEST_FILE_PATTERNS.iter().any(|p| {
        if p.as_str().contains('/') {
            p.matches(&normalized)
        } else {
            p.matches(file_name)
        }
    })
}

/// Finds or generates tests, then runs the configured test command.
pub struct TesterAgent {
    name: String,
    deps: AgentDeps,
    config: TesterConfig,
}

impl TesterAgent {
    pub fn new(deps: AgentDeps, config: TesterConfig) -> Self {
        Self {
            name: "Tester".to_string(),
            deps,
            config,
        }
    }

    /// Test files from the ledger plus any found under the project directory.
    fn discover(&self, ctx: &SharedContext) -> Vec<String> {
        let (ledger, root) = ctx.read(|c| (c.ledger_files(), PathBuf::from(&c.project_path)));
        let mut found: BTreeSet<String> = ledger.into_iter().filter(|f| is_test_file(f)).collect();
        if root.is_dir() {
            found.extend(walk_test_files(&root));
        }
        found.into_iter().collect()
    }

    async fn generate_tests(&self, task_id: &str, ctx: &SharedContext) -> Result<Vec<String>> {
        let prompt = ctx.read(|c| {
            self.deps
                .prompts
                .tests(&ProjectInfo::from_context(c), &c.ledger_files())
        })?;
        let response = self
            .deps
            .model
            .generate(&prompt, TEMPERATURE, MAX_TOKENS)
            .await
            .context("tester model call")?;
        let files = parse_files(&response, "tests").unwrap_or_else(|err| {
            warn!(err = %format!("{err:#}"), "generated tests unusable");
            Vec::new()
        });

        let mut written = Vec::new();
        for file in &files {
            let outcome =
                write_generated_file(&self.deps, ctx, &self.name, task_id, &file.path, &file.content)
                    .await?;
            match outcome {
                FileOutcome::Written => written.push((file.path.clone(), file.content.clone())),
                FileOutcome::Skipped(reason) => {
                    debug!(path = %file.path, reason = %reason, "test file skipped")
                }
            }
        }
        self.deps
            .cache_artifacts(task_id, AgentRole::Tester, &written, "generated tests");
        Ok(written.into_iter().map(|(path, _)| path).collect())
    }

    async fn run_tests(&self, cwd: PathBuf) -> Result<CommandOutput> {
        let command = self.config.command.clone();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let limit = self.config.output_limit_bytes;
        tokio::task::spawn_blocking(move || {
            let cmd = shell_command(&command, &cwd)?;
            run_command_with_timeout(cmd, timeout, limit)
        })
        .await
        .map_err(|err| anyhow!("test runner task failed: {err}"))?
    }
}

fn walk_test_files(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .max_depth(MAX_DISCOVERY_DEPTH)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            entry.depth() == 0
                || !(entry.file_type().is_dir()
                    && (name.starts_with('.') || SKIPPED_DIRS.contains(&&*name)))
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(root).ok()?;
            let rel = rel.to_string_lossy().replace('\\', "/");
            is_test_file(&rel).then_some(rel)
        })
        .collect()
}

#[async_trait]
impl Agent for TesterAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        AgentRole::Tester
    }

    async fn execute(&self, _task: &Task, ctx: &SharedContext) -> Result<String> {
        Ok(self.test(ctx).await?.summary)
    }
}

#[async_trait]
impl Tester for TesterAgent {
    #[instrument(skip_all)]
    async fn test(&self, ctx: &SharedContext) -> Result<TestSummary> {
        let mut summary = TestSummary::default();
        let mut test_files = self.discover(ctx);
        if test_files.is_empty() {
            info!("no test files found, generating tests");
            let task_id = ctx.read(|c| c.current_task.clone()).unwrap_or_else(|| "tests".into());
            test_files = self.generate_tests(&task_id, ctx).await?;
            summary.tests_generated = test_files.len();
            if test_files.is_empty() {
                summary.summary = "no tests found and none could be generated".to_string();
                return Ok(summary);
            }
        }

        let cwd = ctx.read(|c| PathBuf::from(&c.project_path));
        let payload = json!({
            "command": self.config.command,
            "cwd": cwd.display().to_string(),
        });
        if let Err(reason) = self
            .deps
            .admit(ctx, &self.name, ActionKind::TestExecution, payload)
        {
            summary.summary = format!("test execution not accepted: {reason}");
            return Ok(summary);
        }

        let output = match self.run_tests(cwd).await {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "test command failed to run");
                summary.summary = format!("test command failed to run: {err:#}");
                return Ok(summary);
            }
        };
        let text = output.combined_text();
        let counts = parse_test_counts(&text);
        summary.executed = true;
        summary.tests_passed = counts.passed;
        summary.tests_failed = counts.failed;
        summary.tests_run = counts.total();
        summary.summary = format!(
            "{} test(s) run, {} passed, {} failed",
            summary.tests_run, summary.tests_passed, summary.tests_failed
        );
        if output.timed_out {
            summary.summary.push_str(" (timed out)");
        }
        summary.output = Some(text);

        log_action(
            ctx,
            &self.name,
            "test_run",
            json!({
                "command": self.config.command,
                "test_files": test_files,
                "passed": summary.tests_passed,
                "failed": summary.tests_failed,
                "timed_out": output.timed_out,
            }),
        );
        ctx.update(|c| c.add_message("assistant", summary.summary.clone(), Some(AgentRole::Tester)));
        info!(
            passed = summary.tests_passed,
            failed = summary.tests_failed,
            "test run finished"
        );
        Ok(summary)
    }
}
