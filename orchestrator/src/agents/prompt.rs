//! Prompt rendering for the model-backed agents.
//!
//! Templates carry `<!-- section:KEY required|droppable -->` markers. After
//! rendering, droppable sections are removed (project details last) until the
//! prompt fits the byte budget.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::context::Context;

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const CODER_TEMPLATE: &str = include_str!("prompts/coder.md");
const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");
const TESTS_TEMPLATE: &str = include_str!("prompts/tests.md");

/// Characters of file content shown to the reviewer.
pub const REVIEW_CONTENT_LIMIT: usize = 3000;

const DROP_ORDER: [&str; 2] = ["files", "project"];
const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Project identity rendered into every prompt.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectInfo {
    pub name: String,
    pub description: String,
    pub path: String,
}

impl ProjectInfo {
    pub fn from_context(ctx: &Context) -> Self {
        Self {
            name: ctx.project_name.clone(),
            description: ctx.project_description.clone(),
            path: ctx.project_path.clone(),
        }
    }
}

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_template("planner", PLANNER_TEMPLATE)
        .expect("planner template should be valid");
    env.add_template("coder", CODER_TEMPLATE)
        .expect("coder template should be valid");
    env.add_template("reviewer", REVIEWER_TEMPLATE)
        .expect("reviewer template should be valid");
    env.add_template("tests", TESTS_TEMPLATE)
        .expect("tests template should be valid");
    env
}

/// Renders agent prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    pub fn planner(&self, project: &ProjectInfo, task: &str) -> Result<String> {
        self.render(
            "planner",
            context! { project => project, task => task.trim() },
        )
    }

    pub fn coder(&self, project: &ProjectInfo, task: &str, files: &[String]) -> Result<String> {
        self.render(
            "coder",
            context! { project => project, task => task.trim(), files => files },
        )
    }

    /// Review prompt for one file; content beyond [`REVIEW_CONTENT_LIMIT`]
    /// characters is cut.
    pub fn reviewer(&self, project: &ProjectInfo, file_path: &str, content: &str) -> Result<String> {
        let shown: String = content.chars().take(REVIEW_CONTENT_LIMIT).collect();
        self.render(
            "reviewer",
            context! { project => project, file_path => file_path, content => shown },
        )
    }

    pub fn tests(&self, project: &ProjectInfo, files: &[String]) -> Result<String> {
        self.render("tests", context! { project => project, files => files })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let env = environment();
        let rendered = env.get_template(name)?.render(ctx)?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(join_sections(&sections))
    }
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker regex is valid")
    });

    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[Section]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget(sections: &mut Vec<Section>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }

    // Still over: shorten the largest section.
    let total = total_len(sections);
    if total <= budget {
        return;
    }
    let Some(largest) = sections.iter_mut().max_by_key(|s| s.content.len()) else {
        return;
    };
    let allowed = largest.content.len().saturating_sub(total - budget);
    let before_len = largest.content.len();
    let mut cut = allowed.saturating_sub(TRUNCATION_MARKER.len());
    while !largest.content.is_char_boundary(cut) {
        cut -= 1;
    }
    largest.content.truncate(cut);
    largest.content.push_str(TRUNCATION_MARKER);
    debug!(
        section = largest.key,
        before_len,
        after_len = largest.content.len(),
        "truncated prompt section for budget"
    );
}

fn join_sections(sections: &[Section]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
