//! Agents acting through the auto-accept gate.

use std::sync::Arc;

use orchestrator::agents::{Agent, AgentDeps, CoderAgent};
use orchestrator::core::context::{Context, SharedContext};
use orchestrator::core::gate::{AutoAcceptGate, AutoAcceptRule};
use orchestrator::core::types::{ActionKind, Task};
use orchestrator::test_support::{MemoryStorage, ScriptedModel};
use serde_json::json;

fn shared() -> SharedContext {
    SharedContext::new(Context::new("/work/big", "big", ""))
}

#[tokio::test]
async fn oversized_file_write_is_rejected_with_size_reason() {
    let content = "x".repeat(15 * 1024 * 1024);
    let response = json!({ "files": [{ "path": "big.bin", "content": content }] }).to_string();
    let model = Arc::new(ScriptedModel::new(vec![response.as_str()]));
    let storage = Arc::new(MemoryStorage::default());

    let gate = Arc::new(AutoAcceptGate::new(true, 100));
    let coder = CoderAgent::new(AgentDeps::new(model, storage.clone()).with_gate(gate.clone()));
    let ctx = shared();
    let summary = coder
        .execute(&Task::new("t1", "make a big file"), &ctx)
        .await
        .expect("execute");

    assert!(summary.starts_with("0 file(s) written; 1 skipped: big.bin"), "{summary}");
    assert!(storage.get("big.bin").is_none());

    let snapshot = ctx.snapshot();
    assert!(snapshot.files_created.is_empty());
    let refusal = snapshot
        .action_history
        .iter()
        .find(|a| a.action_type == "action_not_accepted")
        .expect("refusal recorded");
    let reason = refusal.details["reason"].as_str().unwrap_or_default();
    assert!(reason.contains("payload too large"), "{reason}");

    let stats = gate.statistics();
    assert_eq!(stats.actions_processed, 2);
    assert_eq!(stats.actions_auto_accepted, 1);
    assert_eq!(stats.actions_rejected, 1);
}

#[tokio::test]
async fn disabled_gate_stops_code_generation() {
    let model = Arc::new(ScriptedModel::new(vec![
        r#"{"files": [{"path": "a.py", "content": "a = 1"}]}"#,
    ]));
    let storage = Arc::new(MemoryStorage::default());
    let gate = Arc::new(AutoAcceptGate::new(false, 100));
    let coder = CoderAgent::new(AgentDeps::new(model, storage.clone()).with_gate(gate));

    let summary = coder
        .execute(&Task::new("t1", "make a"), &shared())
        .await
        .expect("execute");
    assert_eq!(summary, "code generation not accepted: auto-accept is disabled");
    assert!(storage.paths().is_empty());
}

#[tokio::test]
async fn confirmation_rule_is_not_an_acceptance() {
    let model = Arc::new(ScriptedModel::new(vec![
        r#"{"files": [{"path": "a.py", "content": "a = 1"}]}"#,
    ]));
    let storage = Arc::new(MemoryStorage::default());
    let gate = Arc::new(AutoAcceptGate::new(true, 100));
    let mut write = AutoAcceptRule::default_for(ActionKind::FileWrite);
    write.requires_confirmation = true;
    gate.update_rule(write).expect("rule");
    let coder = CoderAgent::new(AgentDeps::new(model, storage.clone()).with_gate(gate.clone()));

    coder
        .execute(&Task::new("t1", "make a"), &shared())
        .await
        .expect("execute");
    assert!(storage.get("a.py").is_none());
    assert_eq!(gate.statistics().actions_required_confirmation, 1);
}
