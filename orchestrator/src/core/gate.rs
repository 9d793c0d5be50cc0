//! Rule-based auto-accept decisions for side-effecting agent actions.
//!
//! Each [`ActionKind`] has one [`AutoAcceptRule`]. [`AutoAcceptGate::evaluate`]
//! walks a fixed check order and returns a [`GateDecision`]; every call is
//! counted and appended to a bounded history.
//!
//! Check order:
//! 1. gate disabled, missing rule, disabled rule (reject)
//! 2. `requires_confirmation` (confirmation, overrides everything below)
//! 3. custom validator (an `Err` is a reject)
//! 4. blocked patterns, then allowed patterns
//! 5. payload size for file writes
//!
//! The gate is shared between agents and the orchestrator as
//! `Arc<AutoAcceptGate>`; its state sits behind a mutex.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::pattern::GlobPattern;
use crate::core::types::ActionKind;

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    RequireConfirmation,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub verdict: Verdict,
    pub reason: String,
}

impl GateDecision {
    fn accept() -> Self {
        Self {
            verdict: Verdict::Accept,
            reason: "accepted automatically".to_string(),
        }
    }

    fn confirm() -> Self {
        Self {
            verdict: Verdict::RequireConfirmation,
            reason: "confirmation required by rule".to_string(),
        }
    }

    fn reject(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Reject,
            reason: reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accept
    }
}

/// Outcome of a custom validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Accept,
    Reject(String),
}

/// Caller-supplied predicate attached to a rule.
///
/// Returning `Err` is treated as a rejection, never as a crash.
pub trait ActionValidator: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<Validation>;
}

impl<F> ActionValidator for F
where
    F: Fn(&Value) -> Result<Validation> + Send + Sync,
{
    fn validate(&self, payload: &Value) -> Result<Validation> {
        self(payload)
    }
}

/// Policy for one action kind.
#[derive(Clone)]
pub struct AutoAcceptRule {
    pub action_kind: ActionKind,
    pub enabled: bool,
    pub requires_confirmation: bool,
    pub max_payload_size_mb: u64,
    pub allowed_patterns: Vec<String>,
    pub blocked_patterns: Vec<String>,
    pub custom_validator: Option<Arc<dyn ActionValidator>>,
}

impl fmt::Debug for AutoAcceptRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoAcceptRule")
            .field("action_kind", &self.action_kind)
            .field("enabled", &self.enabled)
            .field("requires_confirmation", &self.requires_confirmation)
            .field("max_payload_size_mb", &self.max_payload_size_mb)
            .field("allowed_patterns", &self.allowed_patterns)
            .field("blocked_patterns", &self.blocked_patterns)
            .field("custom_validator", &self.custom_validator.is_some())
            .finish()
    }
}

impl AutoAcceptRule {
    pub fn new(action_kind: ActionKind) -> Self {
        Self {
            action_kind,
            enabled: true,
            requires_confirmation: false,
            max_payload_size_mb: 10,
            allowed_patterns: Vec::new(),
            blocked_patterns: Vec::new(),
            custom_validator: None,
        }
    }

    /// Built-in rule for `kind`, seeded at gate construction.
    pub fn default_for(kind: ActionKind) -> Self {
        let mut rule = Self::new(kind);
        match kind {
            ActionKind::FileWrite => {
                rule.blocked_patterns = patterns(&["*.env", "*.key", "*secret*"]);
            }
            ActionKind::TerminalCommand => {
                rule.blocked_patterns = patterns(&[
                    "*rm -rf*",
                    "*del /s /q*",
                    "*format *",
                    "*mkfs*",
                    "*sudo *",
                    "*format-volume*",
                ]);
            }
            ActionKind::CodeGeneration => rule.max_payload_size_mb = 5,
            ActionKind::TestExecution | ActionKind::CodeReview => {}
        }
        rule
    }

    pub fn view(&self) -> RuleView {
        RuleView {
            action_kind: self.action_kind,
            enabled: self.enabled,
            requires_confirmation: self.requires_confirmation,
            max_payload_size_mb: self.max_payload_size_mb,
            allowed_patterns: self.allowed_patterns.clone(),
            blocked_patterns: self.blocked_patterns.clone(),
            has_custom_validator: self.custom_validator.is_some(),
        }
    }
}

fn patterns(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|p| (*p).to_string()).collect()
}

/// Serializable copy of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleView {
    pub action_kind: ActionKind,
    pub enabled: bool,
    pub requires_confirmation: bool,
    pub max_payload_size_mb: u64,
    pub allowed_patterns: Vec<String>,
    pub blocked_patterns: Vec<String>,
    pub has_custom_validator: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action_kind: ActionKind,
    pub payload: Value,
    pub decision: GateDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuleState {
    pub enabled: bool,
    pub requires_confirmation: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateStatistics {
    pub enabled: bool,
    pub actions_processed: u64,
    pub actions_auto_accepted: u64,
    pub actions_rejected: u64,
    pub actions_required_confirmation: u64,
    /// Accepted share of processed actions, in percent.
    pub auto_accept_rate: f64,
    pub rules: BTreeMap<ActionKind, RuleState>,
}

struct CompiledRule {
    rule: AutoAcceptRule,
    allowed: Vec<GlobPattern>,
    blocked: Vec<GlobPattern>,
}

impl CompiledRule {
    fn compile(rule: AutoAcceptRule) -> Result<Self> {
        let allowed = rule
            .allowed_patterns
            .iter()
            .map(|p| GlobPattern::new(p))
            .collect::<Result<Vec<_>>>()?;
        let blocked = rule
            .blocked_patterns
            .iter()
            .map(|p| GlobPattern::new(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rule,
            allowed,
            blocked,
        })
    }
}

#[derive(Default)]
struct Counters {
    processed: u64,
    accepted: u64,
    rejected: u64,
    confirmation: u64,
}

struct GateState {
    enabled: bool,
    rules: BTreeMap<ActionKind, CompiledRule>,
    counters: Counters,
    history: VecDeque<HistoryEntry>,
    history_capacity: usize,
}

pub struct AutoAcceptGate {
    state: Mutex<GateState>,
}

impl fmt::Debug for AutoAcceptGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("AutoAcceptGate")
            .field("enabled", &state.enabled)
            .field("rules", &state.rules.len())
            .field("history", &state.history.len())
            .finish()
    }
}

impl Default for AutoAcceptGate {
    fn default() -> Self {
        Self::new(false, DEFAULT_HISTORY_CAPACITY)
    }
}

impl AutoAcceptGate {
    /// Gate seeded with the built-in rule for every action kind.
    pub fn new(enabled: bool, history_capacity: usize) -> Self {
        let rules = ActionKind::ALL
            .into_iter()
            .filter_map(|kind| {
                CompiledRule::compile(AutoAcceptRule::default_for(kind))
                    .ok()
                    .map(|compiled| (kind, compiled))
            })
            .collect();
        Self {
            state: Mutex::new(GateState {
                enabled,
                rules,
                counters: Counters::default(),
                history: VecDeque::new(),
                history_capacity: history_capacity.max(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Flip the global switch and return the new value.
    pub fn toggle(&self) -> bool {
        let mut state = self.lock();
        state.enabled = !state.enabled;
        state.enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    /// Replace the rule for `rule.action_kind`.
    pub fn update_rule(&self, rule: AutoAcceptRule) -> Result<()> {
        let compiled = CompiledRule::compile(rule)?;
        self.lock()
            .rules
            .insert(compiled.rule.action_kind, compiled);
        Ok(())
    }

    pub fn remove_rule(&self, kind: ActionKind) {
        self.lock().rules.remove(&kind);
    }

    pub fn enable_rule(&self, kind: ActionKind) {
        if let Some(compiled) = self.lock().rules.get_mut(&kind) {
            compiled.rule.enabled = true;
        }
    }

    pub fn disable_rule(&self, kind: ActionKind) {
        if let Some(compiled) = self.lock().rules.get_mut(&kind) {
            compiled.rule.enabled = false;
        }
    }

    pub fn rule(&self, kind: ActionKind) -> Option<RuleView> {
        self.lock().rules.get(&kind).map(|c| c.rule.view())
    }

    pub fn evaluate(&self, kind: ActionKind, payload: &Value) -> GateDecision {
        let mut state = self.lock();
        state.counters.processed += 1;

        let decision = decide(&state, kind, payload);
        match decision.verdict {
            Verdict::Accept => state.counters.accepted += 1,
            Verdict::RequireConfirmation => state.counters.confirmation += 1,
            Verdict::Reject => state.counters.rejected += 1,
        }

        let entry = HistoryEntry {
            timestamp: Utc::now(),
            action_kind: kind,
            payload: payload.clone(),
            decision: decision.clone(),
        };
        while state.history.len() >= state.history_capacity {
            state.history.pop_front();
        }
        state.history.push_back(entry);

        decision
    }

    /// Up to `limit` most recent history entries, oldest first.
    pub fn recent_actions(&self, limit: usize) -> Vec<HistoryEntry> {
        let state = self.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    pub fn reset_statistics(&self) {
        self.lock().counters = Counters::default();
    }

    pub fn statistics(&self) -> GateStatistics {
        let state = self.lock();
        let c = &state.counters;
        let auto_accept_rate = if c.processed == 0 {
            0.0
        } else {
            c.accepted as f64 / c.processed as f64 * 100.0
        };
        GateStatistics {
            enabled: state.enabled,
            actions_processed: c.processed,
            actions_auto_accepted: c.accepted,
            actions_rejected: c.rejected,
            actions_required_confirmation: c.confirmation,
            auto_accept_rate,
            rules: state
                .rules
                .iter()
                .map(|(kind, compiled)| {
                    (
                        *kind,
                        RuleState {
                            enabled: compiled.rule.enabled,
                            requires_confirmation: compiled.rule.requires_confirmation,
                        },
                    )
                })
                .collect(),
        }
    }
}

fn decide(state: &GateState, kind: ActionKind, payload: &Value) -> GateDecision {
    if !state.enabled {
        return GateDecision::reject("auto-accept is disabled");
    }
    let Some(compiled) = state.rules.get(&kind) else {
        return GateDecision::reject(format!("no rule for {kind}"));
    };
    let rule = &compiled.rule;
    if !rule.enabled {
        return GateDecision::reject(format!("rule disabled for {kind}"));
    }
    if rule.requires_confirmation {
        return GateDecision::confirm();
    }

    if let Some(validator) = &rule.custom_validator {
        match validator.validate(payload) {
            Ok(Validation::Accept) => {}
            Ok(Validation::Reject(reason)) => return GateDecision::reject(reason),
            Err(err) => return GateDecision::reject(format!("validator error: {err:#}")),
        }
    }

    let targets = match_targets(payload);
    if let Some(pattern) = compiled
        .blocked
        .iter()
        .find(|p| targets.iter().any(|t| p.matches(t)))
    {
        return GateDecision::reject(format!("blocked by pattern '{}'", pattern.as_str()));
    }
    if !compiled.allowed.is_empty()
        && !compiled
            .allowed
            .iter()
            .any(|p| targets.iter().any(|t| p.matches(t)))
    {
        return GateDecision::reject("not matched by any allowed pattern");
    }

    if kind == ActionKind::FileWrite {
        let size = payload_size(payload);
        let max = rule.max_payload_size_mb.saturating_mul(BYTES_PER_MB);
        if size > max {
            return GateDecision::reject(format!("payload too large: size {size} > {max} bytes"));
        }
    }

    GateDecision::accept()
}

/// Texts a pattern is matched against: the whole payload, then its path and
/// command fields when present.
fn match_targets(payload: &Value) -> Vec<String> {
    let mut targets = vec![serde_json::to_string(payload).unwrap_or_default()];
    let path = payload
        .get("file_path")
        .and_then(Value::as_str)
        .or_else(|| payload.get("path").and_then(Value::as_str));
    if let Some(path) = path {
        targets.push(path.to_string());
    }
    if let Some(command) = payload.get("command").and_then(Value::as_str) {
        targets.push(command.to_string());
    }
    targets
}

fn payload_size(payload: &Value) -> u64 {
    match payload.get("file_size") {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    fn enabled_gate() -> AutoAcceptGate {
        AutoAcceptGate::new(true, DEFAULT_HISTORY_CAPACITY)
    }

    #[test]
    fn disabled_gate_rejects_and_counts() {
        let gate = AutoAcceptGate::default();
        let decision = gate.evaluate(ActionKind::FileWrite, &json!({"file_path": "a.rs"}));
        assert_eq!(decision.verdict, Verdict::Reject);
        assert!(decision.reason.contains("disabled"));

        let stats = gate.statistics();
        assert_eq!(stats.actions_processed, 1);
        assert_eq!(stats.actions_rejected, 1);
    }

    #[test]
    fn confirmation_takes_precedence_over_blocked_patterns() {
        let gate = enabled_gate();
        let mut rule = AutoAcceptRule::default_for(ActionKind::FileWrite);
        rule.requires_confirmation = true;
        gate.update_rule(rule).expect("update rule");

        let decision = gate.evaluate(
            ActionKind::FileWrite,
            &json!({"file_path": "prod.env", "file_size": 999_999_999}),
        );
        assert_eq!(decision.verdict, Verdict::RequireConfirmation);
        assert_eq!(gate.statistics().actions_required_confirmation, 1);
    }

    #[test]
    fn env_files_are_blocked_by_default() {
        let gate = enabled_gate();
        let decision = gate.evaluate(
            ActionKind::FileWrite,
            &json!({"file_path": "config/.env", "file_size": 10}),
        );
        assert_eq!(decision.verdict, Verdict::Reject);
        assert!(decision.reason.contains("*.env"));

        let ok = gate.evaluate(
            ActionKind::FileWrite,
            &json!({"file_path": "src/main.rs", "file_size": 10}),
        );
        assert!(ok.is_accepted());
    }

    #[test]
    fn dangerous_commands_are_blocked() {
        let gate = enabled_gate();
        let rm = gate.evaluate(
            ActionKind::TerminalCommand,
            &json!({"command": "rm -rf /tmp/x"}),
        );
        assert_eq!(rm.verdict, Verdict::Reject);

        let sudo = gate.evaluate(
            ActionKind::TerminalCommand,
            &json!({"command": "SUDO apt install"}),
        );
        assert_eq!(sudo.verdict, Verdict::Reject);

        let ls = gate.evaluate(ActionKind::TerminalCommand, &json!({"command": "ls -la"}));
        assert!(ls.is_accepted());
    }

    #[test]
    fn oversized_file_write_is_rejected_with_size_reason() {
        let gate = enabled_gate();
        let decision = gate.evaluate(
            ActionKind::FileWrite,
            &json!({"file_path": "big.bin", "file_size": 15 * 1024 * 1024}),
        );
        assert_eq!(decision.verdict, Verdict::Reject);
        assert!(decision.reason.contains("size"));
    }

    #[test]
    fn size_limit_only_applies_to_file_writes() {
        let gate = enabled_gate();
        let generation = gate.evaluate(
            ActionKind::CodeGeneration,
            &json!({"file_size": 6 * 1024 * 1024}),
        );
        assert!(generation.is_accepted(), "{generation:?}");
        let command = gate.evaluate(
            ActionKind::TerminalCommand,
            &json!({"command": "ls", "file_size": 50 * 1024 * 1024}),
        );
        assert!(command.is_accepted(), "{command:?}");
    }

    #[test]
    fn allowed_patterns_require_a_match() {
        let gate = enabled_gate();
        let mut rule = AutoAcceptRule::new(ActionKind::FileWrite);
        rule.allowed_patterns = vec!["src/*".to_string()];
        gate.update_rule(rule).expect("update rule");

        assert!(
            gate.evaluate(ActionKind::FileWrite, &json!({"file_path": "src/lib.rs"}))
                .is_accepted()
        );
        let outside = gate.evaluate(ActionKind::FileWrite, &json!({"file_path": "docs/a.md"}));
        assert!(outside.reason.contains("allowed pattern"));
    }

    #[test]
    fn validator_errors_and_rejections_reject() {
        let gate = enabled_gate();
        let mut rule = AutoAcceptRule::new(ActionKind::CodeReview);
        let validator: Arc<dyn ActionValidator> =
            Arc::new(|payload: &Value| -> Result<Validation> {
                match payload.get("mode").and_then(Value::as_str) {
                    Some("explode") => Err(anyhow!("kaboom")),
                    Some("deny") => Ok(Validation::Reject("denied by reviewer policy".to_string())),
                    _ => Ok(Validation::Accept),
                }
            });
        rule.custom_validator = Some(validator);
        gate.update_rule(rule).expect("update rule");

        let err = gate.evaluate(ActionKind::CodeReview, &json!({"mode": "explode"}));
        assert_eq!(err.verdict, Verdict::Reject);
        assert!(err.reason.contains("kaboom"));

        let deny = gate.evaluate(ActionKind::CodeReview, &json!({"mode": "deny"}));
        assert_eq!(deny.reason, "denied by reviewer policy");

        assert!(
            gate.evaluate(ActionKind::CodeReview, &json!({}))
                .is_accepted()
        );
    }

    #[test]
    fn missing_and_disabled_rules_reject() {
        let gate = enabled_gate();
        gate.disable_rule(ActionKind::TestExecution);
        let disabled = gate.evaluate(ActionKind::TestExecution, &json!({}));
        assert!(disabled.reason.contains("rule disabled"));

        gate.enable_rule(ActionKind::TestExecution);
        assert!(gate.evaluate(ActionKind::TestExecution, &json!({})).is_accepted());

        gate.remove_rule(ActionKind::CodeReview);
        let missing = gate.evaluate(ActionKind::CodeReview, &json!({}));
        assert!(missing.reason.contains("no rule"));
    }

    #[test]
    fn rate_and_counters_add_up() {
        let gate = enabled_gate();
        for _ in 0..3 {
            gate.evaluate(ActionKind::CodeReview, &json!({}));
        }
        gate.evaluate(ActionKind::FileWrite, &json!({"file_path": "a.key"}));

        let stats = gate.statistics();
        assert_eq!(stats.actions_processed, 4);
        assert_eq!(stats.actions_auto_accepted, 3);
        assert!((stats.auto_accept_rate - 75.0).abs() < f64::EPSILON);
        assert_eq!(
            stats.actions_processed,
            stats.actions_auto_accepted
                + stats.actions_rejected
                + stats.actions_required_confirmation
        );

        gate.reset_statistics();
        assert_eq!(gate.statistics().auto_accept_rate, 0.0);
    }

    #[test]
    fn history_is_bounded_and_keeps_newest() {
        let gate = AutoAcceptGate::new(true, 5);
        for i in 0..12 {
            gate.evaluate(ActionKind::CodeReview, &json!({ "n": i }));
        }
        assert_eq!(gate.history_len(), 5);

        let recent = gate.recent_actions(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].payload, json!({"n": 10}));
        assert_eq!(recent[1].payload, json!({"n": 11}));

        gate.clear_history();
        assert!(gate.recent_actions(10).is_empty());
    }

    #[test]
    fn toggle_flips_switch() {
        let gate = AutoAcceptGate::default();
        assert!(gate.toggle());
        assert!(gate.is_enabled());
        assert!(!gate.toggle());
    }
}
