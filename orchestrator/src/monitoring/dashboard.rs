//! Agent status and model quota bookkeeping shown on the dashboard.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::types::AgentRole;

pub const DEFAULT_WARNING_PCT: f64 = 30.0;
pub const DEFAULT_CRITICAL_PCT: f64 = 10.0;
pub const HISTORY_RETENTION_DAYS: i64 = 90;
pub const DEFAULT_TREND_MINUTES: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Claude,
    Gemini,
    Openai,
}

impl ModelFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::Claude => "claude",
            ModelFamily::Gemini => "gemini",
            ModelFamily::Openai => "openai",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(ModelFamily::Claude),
            "gemini" => Ok(ModelFamily::Gemini),
            "openai" => Ok(ModelFamily::Openai),
            other => bail!("unknown model family '{other}'"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Active,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub name: String,
    pub role: AgentRole,
    pub status: AgentState,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub total_tasks: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub current_task: Option<String>,
    pub error_message: Option<String>,
}

impl AgentStatus {
    fn new(name: &str, role: AgentRole) -> Self {
        Self {
            name: name.to_string(),
            role,
            status: AgentState::Idle,
            tasks_completed: 0,
            tasks_failed: 0,
            total_tasks: 0,
            last_activity: None,
            current_task: None,
            error_message: None,
        }
    }

    /// Completed share of all finished tasks, in percent.
    pub fn success_rate(&self) -> f64 {
        percentage(self.tasks_completed, self.total_tasks)
    }
}

/// Credits reported for one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub model: String,
    pub family: ModelFamily,
    #[serde(default)]
    pub thinking_credits: u64,
    #[serde(default)]
    pub flow_credits: u64,
    #[serde(default)]
    pub thinking_limit: Option<u64>,
    #[serde(default)]
    pub flow_limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
struct ModelUsage {
    family: ModelFamily,
    thinking_used: u64,
    thinking_limit: u64,
    flow_used: u64,
    flow_limit: u64,
    requests: u64,
    last_used: DateTime<Utc>,
}

impl ModelUsage {
    /// Smallest remaining share across the quotas that have a limit.
    fn min_remaining_pct(&self) -> Option<f64> {
        [
            (self.thinking_used, self.thinking_limit),
            (self.flow_used, self.flow_limit),
        ]
        .into_iter()
        .filter(|(_, limit)| *limit > 0)
        .map(|(used, limit)| (100.0 - percentage(used, limit)).max(0.0))
        .reduce(f64::min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct UsageSample {
    timestamp: DateTime<Utc>,
    family: ModelFamily,
    thinking_credits: u64,
    flow_credits: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelQuota {
    pub name: String,
    pub family: ModelFamily,
    pub thinking_used: u64,
    pub thinking_limit: u64,
    pub thinking_percentage: f64,
    pub flow_used: u64,
    pub flow_limit: u64,
    pub flow_percentage: f64,
    pub requests: u64,
    pub last_used: DateTime<Utc>,
    pub is_low: bool,
    pub is_critical: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuotaSummary {
    pub models: Vec<ModelQuota>,
    /// Models below the warning threshold but not critical.
    pub warnings: Vec<String>,
    pub critical: Vec<String>,
    pub total_thinking_used: u64,
    pub total_thinking_limit: u64,
    pub total_flow_used: u64,
    pub total_flow_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSummaryRow {
    #[serde(flatten)]
    pub status: AgentStatus,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentsSummary {
    pub agents: Vec<AgentSummaryRow>,
    pub total_agents: usize,
    pub active_agents: usize,
    pub error_agents: usize,
    pub idle_agents: usize,
    pub total_tasks_completed: u64,
    pub total_tasks_failed: u64,
    pub total_tasks: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamilyTrend {
    pub family: ModelFamily,
    pub thinking_credits: Vec<u64>,
    pub flow_credits: Vec<u64>,
    pub timestamps: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageTrends {
    pub trends: Vec<FamilyTrend>,
}

#[derive(Debug)]
struct DashboardState {
    agents: BTreeMap<String, AgentStatus>,
    models: BTreeMap<String, ModelUsage>,
    history: Vec<UsageSample>,
    warning_pct: f64,
    critical_pct: f64,
}

/// Live agent and quota tables.
#[derive(Debug)]
pub struct MonitoringDashboard {
    state: Mutex<DashboardState>,
}

impl Default for MonitoringDashboard {
    fn default() -> Self {
        Self {
            state: Mutex::new(DashboardState {
                agents: BTreeMap::new(),
                models: BTreeMap::new(),
                history: Vec::new(),
                warning_pct: DEFAULT_WARNING_PCT,
                critical_pct: DEFAULT_CRITICAL_PCT,
            }),
        }
    }
}

impl MonitoringDashboard {
    fn lock(&self) -> MutexGuard<'_, DashboardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an idle row for `name`; an existing row is left as is.
    pub fn register_agent(&self, name: &str, role: AgentRole) {
        let mut state = self.lock();
        if !state.agents.contains_key(name) {
            state
                .agents
                .insert(name.to_string(), AgentStatus::new(name, role));
            info!(agent = name, %role, "agent registered with dashboard");
        }
    }

    pub fn agent_started(&self, name: &str, task_id: &str) {
        let mut state = self.lock();
        if let Some(agent) = state.agents.get_mut(name) {
            agent.status = AgentState::Active;
            agent.current_task = Some(task_id.to_string());
            agent.last_activity = Some(Utc::now());
        }
    }

    /// Count a finished dispatch. An error message puts the agent in the
    /// error state until [`Self::reset_error_states`].
    pub fn agent_finished(&self, name: &str, error: Option<&str>) {
        let mut state = self.lock();
        let Some(agent) = state.agents.get_mut(name) else {
            return;
        };
        agent.total_tasks += 1;
        agent.last_activity = Some(Utc::now());
        agent.current_task = None;
        match error {
            None => {
                agent.tasks_completed += 1;
                agent.status = AgentState::Idle;
            }
            Some(message) => {
                agent.tasks_failed += 1;
                agent.status = AgentState::Error;
                agent.error_message = Some(message.to_string());
            }
        }
    }

    /// Return agents in the error state to idle; returns how many changed.
    pub fn reset_error_states(&self) -> usize {
        let mut state = self.lock();
        let mut cleared = 0;
        for agent in state.agents.values_mut() {
            if agent.status == AgentState::Error {
                agent.status = AgentState::Idle;
                agent.error_message = None;
                cleared += 1;
            }
        }
        info!(cleared, "agent error states reset");
        cleared
    }

    pub fn agent(&self, name: &str) -> Option<AgentStatus> {
        self.lock().agents.get(name).cloned()
    }

    pub fn record_usage(&self, report: &UsageReport) {
        self.record_usage_at(report, Utc::now());
    }

    fn record_usage_at(&self, report: &UsageReport, now: DateTime<Utc>) {
        let mut state = self.lock();
        let usage = state
            .models
            .entry(report.model.clone())
            .or_insert_with(|| ModelUsage {
                family: report.family,
                thinking_used: 0,
                thinking_limit: 0,
                flow_used: 0,
                flow_limit: 0,
                requests: 0,
                last_used: now,
            });
        usage.family = report.family;
        usage.thinking_used = report.thinking_credits;
        usage.flow_used = report.flow_credits;
        if let Some(limit) = report.thinking_limit {
            usage.thinking_limit = limit;
        }
        if let Some(limit) = report.flow_limit {
            usage.flow_limit = limit;
        }
        usage.requests += 1;
        usage.last_used = now;

        state.history.push(UsageSample {
            timestamp: now,
            family: report.family,
            thinking_credits: report.thinking_credits,
            flow_credits: report.flow_credits,
        });
        let cutoff = now - Duration::days(HISTORY_RETENTION_DAYS);
        state.history.retain(|s| s.timestamp > cutoff);
        debug!(
            model = %report.model,
            thinking = report.thinking_credits,
            flow = report.flow_credits,
            "model usage recorded"
        );
    }

    /// Remaining-percentage thresholds for the low and critical flags.
    pub fn set_thresholds(&self, warning_pct: f64, critical_pct: f64) -> Result<()> {
        if !(0.0..=100.0).contains(&critical_pct)
            || !(0.0..=100.0).contains(&warning_pct)
            || critical_pct > warning_pct
        {
            bail!("thresholds must satisfy 0 <= critical <= warning <= 100");
        }
        let mut state = self.lock();
        state.warning_pct = warning_pct;
        state.critical_pct = critical_pct;
        Ok(())
    }

    pub fn quota_summary(&self) -> QuotaSummary {
        let state = self.lock();
        let mut summary = QuotaSummary::default();
        for (name, usage) in &state.models {
            let remaining = usage.min_remaining_pct();
            let is_critical = remaining.is_some_and(|r| r < state.critical_pct);
            let is_low = remaining.is_some_and(|r| r < state.warning_pct);
            summary.models.push(ModelQuota {
                name: name.clone(),
                family: usage.family,
                thinking_used: usage.thinking_used,
                thinking_limit: usage.thinking_limit,
                thinking_percentage: percentage(usage.thinking_used, usage.thinking_limit),
                flow_used: usage.flow_used,
                flow_limit: usage.flow_limit,
                flow_percentage: percentage(usage.flow_used, usage.flow_limit),
                requests: usage.requests,
                last_used: usage.last_used,
                is_low,
                is_critical,
            });
            summary.total_thinking_used += usage.thinking_used;
            summary.total_thinking_limit += usage.thinking_limit;
            summary.total_flow_used += usage.flow_used;
            summary.total_flow_limit += usage.flow_limit;
            if is_critical {
                summary.critical.push(name.clone());
            } else if is_low {
                summary.warnings.push(name.clone());
            }
        }
        summary
    }

    pub fn agents_summary(&self) -> AgentsSummary {
        let state = self.lock();
        let mut summary = AgentsSummary {
            total_agents: state.agents.len(),
            ..AgentsSummary::default()
        };
        for agent in state.agents.values() {
            summary.total_tasks_completed += agent.tasks_completed;
            summary.total_tasks_failed += agent.tasks_failed;
            summary.total_tasks += agent.total_tasks;
            match agent.status {
                AgentState::Active => summary.active_agents += 1,
                AgentState::Error => summary.error_agents += 1,
                AgentState::Idle => summary.idle_agents += 1,
            }
            summary.agents.push(AgentSummaryRow {
                success_rate: agent.success_rate(),
                status: agent.clone(),
            });
        }
        summary
    }

    /// Usage samples from the last `minutes`, grouped by model family.
    ///
    /// The window is clamped to the retention period; negative values yield
    /// no samples.
    pub fn usage_trends(&self, minutes: i64) -> UsageTrends {
        self.usage_trends_at(minutes, Utc::now())
    }

    fn usage_trends_at(&self, minutes: i64, now: DateTime<Utc>) -> UsageTrends {
        let state = self.lock();
        let minutes = minutes.clamp(0, HISTORY_RETENTION_DAYS * 24 * 60);
        let cutoff = now - Duration::minutes(minutes);
        let mut by_family: BTreeMap<ModelFamily, FamilyTrend> = BTreeMap::new();
        for sample in state.history.iter().filter(|s| s.timestamp > cutoff) {
            let trend = by_family
                .entry(sample.family)
                .or_insert_with(|| FamilyTrend {
                    family: sample.family,
                    thinking_credits: Vec::new(),
                    flow_credits: Vec::new(),
                    timestamps: Vec::new(),
                });
            trend.thinking_credits.push(sample.thinking_credits);
            trend.flow_credits.push(sample.flow_credits);
            trend.timestamps.push(sample.timestamp);
        }
        UsageTrends {
            trends: by_family.into_values().collect(),
        }
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
