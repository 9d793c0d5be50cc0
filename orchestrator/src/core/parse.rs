//! Parsing of structured model responses.
//!
//! Models are asked for a single JSON object but often wrap it in prose or
//! code fences. Every parser here extracts the outermost `{...}` span first,
//! then deserializes it. Callers decide on fallbacks when parsing fails.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::AgentRole;

const PLAN_OUTPUT_SCHEMA: &str = include_str!("../../schemas/plan_output.schema.json");

/// The outermost `{...}` span of `response`, if any.
pub fn extract_json_object(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    (end > start).then(|| &response[start..=end])
}

fn parse_object(response: &str) -> Result<Value> {
    let raw = extract_json_object(response).ok_or_else(|| anyhow!("no JSON object in response"))?;
    serde_json::from_str(raw).context("parse JSON object from response")
}

/// One planned subtask, normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSubtask {
    pub description: String,
    pub role: AgentRole,
    pub priority: i64,
    /// Raw dependency references as written by the model.
    pub dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    subtasks: Vec<RawSubtask>,
}

#[derive(Debug, Deserialize)]
struct RawSubtask {
    description: String,
    #[serde(default)]
    agent_type: Option<String>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    dependencies: Vec<Value>,
}

/// Parse a planner response and validate it against the plan schema.
pub fn parse_plan(response: &str) -> Result<Vec<PlannedSubtask>> {
    let value = parse_object(response)?;
    validate_schema(&value, PLAN_OUTPUT_SCHEMA)?;
    let plan: RawPlan = serde_json::from_value(value).context("deserialize plan")?;

    Ok(plan
        .subtasks
        .into_iter()
        .map(|raw| PlannedSubtask {
            description: raw.description,
            role: raw
                .agent_type
                .as_deref()
                .and_then(|t| t.parse().ok())
                .unwrap_or(AgentRole::Coder),
            priority: raw.priority.unwrap_or(0),
            dependencies: raw
                .dependencies
                .iter()
                .filter_map(|dep| match dep {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
        })
        .collect())
}

/// Plan used when the model's answer cannot be parsed: the whole answer
/// becomes one coder subtask.
pub fn fallback_plan(response: &str) -> Vec<PlannedSubtask> {
    vec![PlannedSubtask {
        description: response.to_string(),
        role: AgentRole::Coder,
        priority: 1,
        dependencies: Vec::new(),
    }]
}

/// Validate JSON instance against a JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema_raw: &str) -> Result<()> {
    let schema: Value = serde_json::from_str(schema_raw).context("parse schema json")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// A file the model asked to write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    #[serde(default)]
    path: String,
    #[serde(default)]
    content: String,
}

/// Parse `{"<key>": [{path, content}, ...]}`; entries with an empty path or
/// empty content are dropped.
pub fn parse_files(response: &str, key: &str) -> Result<Vec<GeneratedFile>> {
    let value = parse_object(response)?;
    let Some(entries) = value.get(key) else {
        return Ok(Vec::new());
    };
    let raw: Vec<RawFile> =
        serde_json::from_value(entries.clone()).with_context(|| format!("deserialize '{key}'"))?;
    Ok(raw
        .into_iter()
        .filter(|f| !f.path.is_empty() && !f.content.is_empty())
        .map(|f| GeneratedFile {
            path: f.path,
            content: f.content,
        })
        .collect())
}

/// Single-file fallback used when code output cannot be parsed.
pub fn fallback_files(response: &str) -> Vec<GeneratedFile> {
    vec![GeneratedFile {
        path: "output.txt".to_string(),
        content: response.to_string(),
    }]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewIssue {
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

fn default_severity() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSuggestion {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewFindings {
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub suggestions: Vec<ReviewSuggestion>,
}

/// Issues and suggestions are read element by element: a bare string becomes
/// the `message`, and elements of any other unusable shape are dropped.
pub fn parse_review(response: &str) -> Result<ReviewFindings> {
    let value = parse_object(response)?;
    Ok(ReviewFindings {
        issues: review_items(&value, "issues", |message| ReviewIssue {
            severity: default_severity(),
            message,
            file: None,
            line: None,
            code: None,
        }),
        suggestions: review_items(&value, "suggestions", |message| ReviewSuggestion {
            message,
            file: None,
            line: None,
        }),
    })
}

fn review_items<T: DeserializeOwned>(
    value: &Value,
    key: &str,
    from_text: impl Fn(String) -> T,
) -> Vec<T> {
    let Some(items) = value.get(key).and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(text) => Some(from_text(text.clone())),
            other => serde_json::from_value(other.clone()).ok(),
        })
        .collect()
}

/// Findings used when a review answer cannot be parsed: no issues, the raw
/// text kept as one suggestion.
pub fn fallback_review(response: &str) -> ReviewFindings {
    ReviewFindings {
        issues: Vec::new(),
        suggestions: vec![ReviewSuggestion {
            message: response.trim().to_string(),
            file: None,
            line: None,
        }],
    }
}

/// Passed/failed counts scraped from test runner output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
}

impl TestCounts {
    pub fn total(self) -> u32 {
        self.passed + self.failed
    }
}

/// Read the first "N passed" and "N failed" figures from runner output.
pub fn parse_test_counts(output: &str) -> TestCounts {
    static PASSED_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(\d+)\s+passed").expect("passed regex is valid"));
    static FAILED_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(\d+)\s+failed").expect("failed regex is valid"));

    let first = |re: &Regex| {
        re.captures(output)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };
    TestCounts {
        passed: first(&PASSED_RE),
        failed: first(&FAILED_RE),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_object_wrapped_in_prose_and_fences() {
        let response = "Here you go:\n```json\n{\"a\": {\"b\": 1}}\n```\nThanks";
        assert_eq!(extract_json_object(response), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("} {"), None);
    }

    #[test]
    fn plan_normalizes_roles_and_dependencies() {
        let response = r#"{"subtasks": [
            {"description": "write code", "agent_type": "coder", "priority": 1, "dependencies": []},
            {"description": "test it", "agent_type": "Tester", "priority": 2, "dependencies": ["1", 1]},
            {"description": "design", "agent_type": "architect"}
        ]}"#;
        let plan = parse_plan(response).expect("plan");
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[1].role, AgentRole::Tester);
        assert_eq!(plan[1].dependencies, vec!["1".to_string(), "1".to_string()]);
        assert_eq!(plan[2].role, AgentRole::Coder);
        assert_eq!(plan[2].priority, 0);
    }

    #[test]
    fn plan_schema_rejects_missing_description() {
        let response = r#"{"subtasks": [{"agent_type": "coder"}]}"#;
        let err = parse_plan(response).expect_err("schema failure");
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn plan_fallback_is_single_coder_task() {
        assert!(parse_plan("just do it").is_err());
        let plan = fallback_plan("just do it");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].role, AgentRole::Coder);
        assert_eq!(plan[0].description, "just do it");
    }

    #[test]
    fn files_drop_empty_entries() {
        let response = r#"{"files": [
            {"path": "hello.py", "content": "def hello(): pass"},
            {"path": "", "content": "orphan"},
            {"path": "empty.py", "content": ""}
        ]}"#;
        let files = parse_files(response, "files").expect("files");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "hello.py");
        assert!(parse_files(response, "tests").expect("tests").is_empty());
    }

    #[test]
    fn review_parses_and_falls_back() {
        let response = r#"{"issues": [{"severity": "high", "message": "bug", "line": 3}], "suggestions": [{"message": "rename"}]}"#;
        let review = parse_review(response).expect("review");
        assert_eq!(review.issues[0].severity, "high");
        assert_eq!(review.issues[0].line, Some(3));
        assert_eq!(review.suggestions[0].message, "rename");

        assert!(parse_review("looks fine to me").is_err());
        let fallback = fallback_review("looks fine to me");
        assert!(fallback.issues.is_empty());
        assert_eq!(fallback.suggestions[0].message, "looks fine to me");
    }

    #[test]
    fn review_keeps_usable_elements_of_mixed_shapes() {
        let response = r#"{
            "issues": [
                {"severity": "high", "message": "sql injection"},
                "unchecked input",
                {"message": "off by one", "line": "10"}
            ],
            "suggestions": ["use parameterized queries", {"message": "add tests", "file": "a.py"}, 7]
        }"#;
        let review = parse_review(response).expect("review");

        assert_eq!(review.issues.len(), 2);
        assert_eq!(review.issues[0].severity, "high");
        assert_eq!(review.issues[0].message, "sql injection");
        assert_eq!(review.issues[1].severity, "medium");
        assert_eq!(review.issues[1].message, "unchecked input");

        let messages: Vec<&str> = review.suggestions.iter().map(|s| s.message.as_str()).collect();
        assert_eq!(messages, vec!["use parameterized queries", "add tests"]);
        assert_eq!(review.suggestions[1].file.as_deref(), Some("a.py"));

        let empty = parse_review(r#"{"verdict": "ok"}"#).expect("review");
        assert_eq!(empty, ReviewFindings::default());
    }

    #[test]
    fn test_counts_read_pytest_summary() {
        let counts = parse_test_counts("==== 4 passed, 1 failed in 0.12s ====");
        assert_eq!(counts, TestCounts { passed: 4, failed: 1 });
        assert_eq!(counts.total(), 5);
        assert_eq!(parse_test_counts("nothing ran"), TestCounts::default());
    }
}
