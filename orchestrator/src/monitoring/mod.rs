//! Monitoring collaborators: live dashboard tables, recovery probes and the
//! artifact cache, bundled so the workflow can treat them as one optional
//! unit.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::io::cache::{CachePolicy, CacheStore, CacheSummary};
use crate::io::config::OrchestratorConfig;
use crate::io::storage::ProjectStorage;

pub mod dashboard;
pub mod recovery;

pub use dashboard::{
    AgentState, AgentsSummary, ModelFamily, MonitoringDashboard, QuotaSummary, UsageReport,
    UsageTrends,
};
pub use recovery::{Diagnostics, HealthReport, RecoveryTools, StatusReset, SystemMetrics};

/// Everything the dashboard home view shows, captured at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardData {
    pub quota_summary: QuotaSummary,
    pub agents_summary: AgentsSummary,
    pub cache_summary: Option<CacheSummary>,
    pub usage_trends: UsageTrends,
    pub auto_accept_enabled: bool,
    pub timestamp: DateTime<Utc>,
}

pub struct MonitoringBundle {
    pub dashboard: Arc<MonitoringDashboard>,
    pub recovery: RecoveryTools,
    pub cache: Option<Arc<CacheStore>>,
}

impl MonitoringBundle {
    pub fn new(storage: Arc<dyn ProjectStorage>, cache: Option<Arc<CacheStore>>) -> Self {
        let dashboard = Arc::new(MonitoringDashboard::default());
        let recovery = RecoveryTools::new(storage, Arc::clone(&dashboard), cache.clone());
        Self {
            dashboard,
            recovery,
            cache,
        }
    }

    /// Bundle with a cache opened under `project_root` per `config`.
    pub fn from_config(
        config: &OrchestratorConfig,
        project_root: &Path,
        storage: Arc<dyn ProjectStorage>,
    ) -> Result<Self> {
        let cache = CacheStore::open(
            config.cache_dir(project_root),
            CachePolicy::from(&config.monitoring),
        )?;
        Ok(Self::new(storage, Some(Arc::new(cache))))
    }

    pub fn full_data(&self, auto_accept_enabled: bool) -> DashboardData {
        DashboardData {
            quota_summary: self.dashboard.quota_summary(),
            agents_summary: self.dashboard.agents_summary(),
            cache_summary: self.cache.as_ref().map(|c| c.summary()),
            usage_trends: self
                .dashboard
                .usage_trends(dashboard::DEFAULT_TREND_MINUTES),
            auto_accept_enabled,
            timestamp: Utc::now(),
        }
    }
}
