//! HTTP route handlers for the dashboard API.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post, put};
use orchestrator::core::gate::{GateDecision, HistoryEntry, RuleView};
use orchestrator::core::types::{ActionKind, AgentRole};
use orchestrator::io::cache::{CacheEntry, CachePreview};
use orchestrator::monitoring::UsageReport;
use orchestrator::monitoring::dashboard::DEFAULT_TREND_MINUTES;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::state::AppState;

const DEFAULT_ACTION_LIMIT: usize = 50;

type ApiResult = Result<Json<Value>, StatusCode>;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/dashboard", get(get_dashboard))
        .route("/quota", get(get_quota))
        .route("/quota/usage", post(record_usage))
        .route("/agents", get(get_agents))
        .route("/usage/trends", get(get_usage_trends))
        .route("/cache", get(get_cache_summary).delete(clear_cache))
        .route("/cache/stats", get(get_cache_stats))
        .route("/cache/entries", get(list_cache_entries))
        .route(
            "/cache/entries/{task_id}",
            get(get_cache_preview).delete(delete_cache_entry),
        )
        .route("/cache/auto-clean", post(auto_clean_cache))
        .route("/cache/cleanup", post(cleanup_cache))
        .route("/auto-accept/stats", get(get_auto_accept_stats))
        .route("/auto-accept/toggle", post(toggle_auto_accept))
        .route("/auto-accept/enabled", put(set_auto_accept))
        .route("/auto-accept/actions", get(get_recent_actions))
        .route("/auto-accept/rules/{kind}", get(get_rule))
        .route("/auto-accept/rules/{kind}/enable", post(enable_rule))
        .route("/auto-accept/rules/{kind}/disable", post(disable_rule))
        .route("/auto-accept/evaluate", post(evaluate_action))
        .route("/task", post(start_task))
        .route("/context", get(get_context))
        .route("/system/health", get(system_health))
        .route("/system/diagnostics", get(system_diagnostics))
        .route("/system/metrics", get(system_metrics))
        .route("/system/reset-status", post(reset_status))
}

async fn health() -> &'static str {
    "ok"
}

fn internal_error(err: anyhow::Error) -> StatusCode {
    warn!("request failed: {err:#}");
    StatusCode::INTERNAL_SERVER_ERROR
}

fn parse_kind(raw: &str) -> Result<ActionKind, StatusCode> {
    raw.parse().map_err(|_| StatusCode::BAD_REQUEST)
}

/// GET /api/dashboard - everything the home view shows.
async fn get_dashboard(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.dashboard_data())
}

async fn get_quota(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.quota_summary())
}

/// POST /api/quota/usage - record credits reported for one model.
async fn record_usage(
    State(state): State<AppState>,
    Json(report): Json<UsageReport>,
) -> Json<Value> {
    let recorded = state.orchestrator.record_model_usage(&report);
    Json(json!({ "recorded": recorded }))
}

async fn get_agents(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.agents_summary())
}

#[derive(Debug, Deserialize)]
struct TrendsQuery {
    minutes: Option<i64>,
}

/// GET /api/usage/trends?minutes=N - per-family usage over the window.
async fn get_usage_trends(
    State(state): State<AppState>,
    Query(query): Query<TrendsQuery>,
) -> Json<Value> {
    let minutes = query.minutes.unwrap_or(DEFAULT_TREND_MINUTES);
    Json(state.orchestrator.usage_trends(minutes))
}

async fn get_cache_summary(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.cache_summary())
}

async fn get_cache_stats(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.cache_statistics())
}

#[derive(Debug, Deserialize)]
struct EntriesQuery {
    role: Option<String>,
}

/// GET /api/cache/entries?role=coder - newest first.
async fn list_cache_entries(
    State(state): State<AppState>,
    Query(query): Query<EntriesQuery>,
) -> Result<Json<Vec<CacheEntry>>, StatusCode> {
    let role = match query.role.as_deref() {
        Some(raw) => Some(raw.parse::<AgentRole>().map_err(|_| StatusCode::BAD_REQUEST)?),
        None => None,
    };
    Ok(Json(state.orchestrator.cache_entries(role)))
}

/// GET /api/cache/entries/:task_id - entry metadata plus cached files.
async fn get_cache_preview(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<CachePreview>, StatusCode> {
    state
        .orchestrator
        .cache_preview(&task_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn delete_cache_entry(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult {
    let deleted = state
        .orchestrator
        .delete_cache_entry(&task_id)
        .map_err(internal_error)?;
    if !deleted {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({ "deleted": task_id })))
}

async fn clear_cache(State(state): State<AppState>) -> ApiResult {
    let removed = state.orchestrator.clear_cache().map_err(internal_error)?;
    Ok(Json(json!({ "removed": removed })))
}

async fn auto_clean_cache(State(state): State<AppState>) -> ApiResult {
    let removed = state
        .orchestrator
        .auto_clean_cache()
        .map_err(internal_error)?;
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Debug, Deserialize)]
struct CleanupRequest {
    max_age_days: Option<u32>,
}

/// POST /api/cache/cleanup - drop entries past the age limit.
async fn cleanup_cache(
    State(state): State<AppState>,
    Json(request): Json<CleanupRequest>,
) -> ApiResult {
    let removed = state
        .orchestrator
        .cleanup_old_cache(request.max_age_days)
        .map_err(internal_error)?;
    Ok(Json(json!({ "removed": removed })))
}

async fn get_auto_accept_stats(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.auto_accept_stats())
}

async fn toggle_auto_accept(State(state): State<AppState>) -> Json<Value> {
    let enabled = state.orchestrator.toggle_auto_accept();
    Json(json!({ "enabled": enabled }))
}

#[derive(Debug, Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

async fn set_auto_accept(
    State(state): State<AppState>,
    Json(request): Json<EnabledRequest>,
) -> Json<Value> {
    state.orchestrator.set_auto_accept(request.enabled);
    Json(json!({ "enabled": request.enabled }))
}

#[derive(Debug, Deserialize)]
struct ActionsQuery {
    limit: Option<usize>,
}

/// GET /api/auto-accept/actions?limit=N - most recent decisions, oldest first.
async fn get_recent_actions(
    State(state): State<AppState>,
    Query(query): Query<ActionsQuery>,
) -> Json<Vec<HistoryEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_ACTION_LIMIT);
    Json(state.orchestrator.recent_actions(limit))
}

type RuleResult = Result<Json<RuleView>, StatusCode>;

async fn get_rule(State(state): State<AppState>, Path(kind): Path<String>) -> RuleResult {
    let kind = parse_kind(&kind)?;
    state
        .orchestrator
        .gate()
        .rule(kind)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn enable_rule(State(state): State<AppState>, Path(kind): Path<String>) -> RuleResult {
    let kind = parse_kind(&kind)?;
    let gate = state.orchestrator.gate();
    gate.enable_rule(kind);
    info!(%kind, "rule enabled");
    gate.rule(kind).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn disable_rule(State(state): State<AppState>, Path(kind): Path<String>) -> RuleResult {
    let kind = parse_kind(&kind)?;
    let gate = state.orchestrator.gate();
    gate.disable_rule(kind);
    info!(%kind, "rule disabled");
    gate.rule(kind).map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct EvaluateRequest {
    action_kind: ActionKind,
    #[serde(default)]
    payload: Value,
}

/// POST /api/auto-accept/evaluate - run one action through the gate.
///
/// The decision is counted and recorded like any agent-originated one.
async fn evaluate_action(
    State(state): State<AppState>,
    Json(request): Json<EvaluateRequest>,
) -> Json<GateDecision> {
    let decision = state
        .orchestrator
        .gate()
        .evaluate(request.action_kind, &request.payload);
    Json(decision)
}

#[derive(Debug, Deserialize)]
struct TaskRequest {
    project_path: String,
    project_name: String,
    #[serde(default)]
    project_description: String,
    description: String,
}

/// POST /api/task - initialize the project and run the task in the
/// background. Progress is observable on `/events` and `/api/context`.
async fn start_task(
    State(state): State<AppState>,
    Json(request): Json<TaskRequest>,
) -> (StatusCode, Json<Value>) {
    let orchestrator = state.orchestrator.clone();
    info!(project = %request.project_name, "task accepted");
    tokio::spawn(async move {
        orchestrator
            .initialize_project(
                &request.project_path,
                &request.project_name,
                &request.project_description,
            )
            .await;
        let outcome = orchestrator.execute_task(&request.description).await;
        match &outcome.error {
            None => info!("background task completed"),
            Some(error) => warn!(error = %error, "background task failed"),
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "started" })))
}

/// GET /api/context - snapshot of the current run.
async fn get_context(State(state): State<AppState>) -> ApiResult {
    let ctx = state.orchestrator.context().ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(ctx.serialize()))
}

async fn system_health(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.health_check().await)
}

async fn system_diagnostics(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.run_diagnostics().await)
}

async fn system_metrics(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.system_metrics())
}

/// POST /api/system/reset-status - clear agent error states.
async fn reset_status(State(state): State<AppState>) -> Json<Value> {
    Json(state.orchestrator.reset_status_cache())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use orchestrator::core::gate::Verdict;
    use orchestrator::io::config::OrchestratorConfig;
    use orchestrator::monitoring::{ModelFamily, MonitoringBundle};
    use orchestrator::test_support::MemoryStorage;
    use orchestrator::workflow::Orchestrator;

    use super::*;

    fn bare_state() -> AppState {
        let orch = Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(MemoryStorage::default()),
        );
        AppState::new(orch)
    }

    fn monitored_state() -> AppState {
        let storage = Arc::new(MemoryStorage::default());
        let orch = Orchestrator::new(OrchestratorConfig::default(), storage.clone())
            .with_monitoring(MonitoringBundle::new(storage, None));
        AppState::new(orch)
    }

    #[tokio::test]
    async fn health_is_ok() {
        assert_eq!(health().await, "ok");
    }

    #[tokio::test]
    async fn monitoring_routes_report_disabled() {
        let Json(body) = get_quota(State(bare_state())).await;
        assert_eq!(body, json!({ "error": "monitoring disabled" }));
        let Json(body) = get_auto_accept_stats(State(bare_state())).await;
        assert_eq!(body, json!({ "error": "monitoring disabled" }));
    }

    #[tokio::test]
    async fn toggle_is_visible_in_stats() {
        let state = monitored_state();
        let Json(body) = toggle_auto_accept(State(state.clone())).await;
        assert_eq!(body, json!({ "enabled": true }));

        let Json(stats) = get_auto_accept_stats(State(state.clone())).await;
        assert_eq!(stats["enabled"], true);

        set_auto_accept(State(state.clone()), Json(EnabledRequest { enabled: false })).await;
        assert!(!state.orchestrator.gate().is_enabled());
    }

    #[tokio::test]
    async fn rule_routes_validate_kind() {
        let state = bare_state();
        let err = enable_rule(State(state.clone()), Path("teleport".to_string()))
            .await
            .expect_err("unknown kind");
        assert_eq!(err, StatusCode::BAD_REQUEST);

        let Json(rule) = disable_rule(State(state.clone()), Path("code_review".to_string()))
            .await
            .expect("known kind");
        assert!(!rule.enabled);
        let Json(rule) = enable_rule(State(state), Path("code_review".to_string()))
            .await
            .expect("known kind");
        assert!(rule.enabled);
    }

    #[tokio::test]
    async fn evaluate_rejects_while_gate_disabled() {
        let state = bare_state();
        let request = EvaluateRequest {
            action_kind: ActionKind::FileWrite,
            payload: json!({ "file_path": "src/main.rs", "file_size": 10 }),
        };
        let Json(decision) = evaluate_action(State(state.clone()), Json(request)).await;
        assert_eq!(decision.verdict, Verdict::Reject);
        assert_eq!(decision.reason, "auto-accept is disabled");

        let Json(actions) =
            get_recent_actions(State(state), Query(ActionsQuery { limit: None })).await;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_kind, ActionKind::FileWrite);
    }

    #[tokio::test]
    async fn usage_is_recorded_only_with_monitoring() {
        let report = UsageReport {
            model: "claude-sonnet".to_string(),
            family: ModelFamily::Claude,
            thinking_credits: 10,
            flow_credits: 5,
            thinking_limit: Some(100),
            flow_limit: None,
        };
        let Json(body) = record_usage(State(monitored_state()), Json(report.clone())).await;
        assert_eq!(body, json!({ "recorded": true }));
        let Json(body) = record_usage(State(bare_state()), Json(report)).await;
        assert_eq!(body, json!({ "recorded": false }));
    }

    #[tokio::test]
    async fn cache_entries_reject_unknown_role() {
        let err = list_cache_entries(
            State(bare_state()),
            Query(EntriesQuery {
                role: Some("designer".to_string()),
            }),
        )
        .await
        .expect_err("bad role");
        assert_eq!(err, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn task_runs_in_background_and_context_follows() {
        let state = bare_state();
        assert_eq!(
            get_context(State(state.clone())).await.expect_err("no context"),
            StatusCode::NOT_FOUND
        );

        let request = TaskRequest {
            project_path: "/work/hello".to_string(),
            project_name: "hello".to_string(),
            project_description: String::new(),
            description: "say hello".to_string(),
        };
        let (status, _) = start_task(State(state.clone()), Json(request)).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let mut root_status = Value::Null;
        for _ in 0..100 {
            if let Ok(Json(ctx)) = get_context(State(state.clone())).await {
                root_status = ctx["tasks"]["main"]["status"].clone();
                if root_status == "completed" {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(root_status, "completed");
    }
}
