//! Connectivity diagnostics, health checks and process metrics.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result, bail};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::dashboard::MonitoringDashboard;
use crate::io::cache::CacheStore;
use crate::io::storage::ProjectStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentCheck {
    pub status: CheckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    pub error: Option<String>,
}

impl ComponentCheck {
    fn from_result(result: Result<()>, started: Instant) -> Self {
        let latency_ms = (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0;
        match result {
            Ok(()) => Self {
                status: CheckStatus::Ok,
                latency_ms: Some(latency_ms),
                error: None,
            },
            Err(err) => Self {
                status: CheckStatus::Failed,
                latency_ms: None,
                error: Some(format!("{err:#}")),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub success: bool,
    pub message: String,
    pub components: BTreeMap<String, ComponentCheck>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    /// "healthy" or "unhealthy".
    pub status: &'static str,
    pub details: ComponentCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub components: BTreeMap<String, ComponentHealth>,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemMetrics {
    pub os: &'static str,
    pub family: &'static str,
    pub arch: &'static str,
    pub logical_cores: usize,
    pub pid: u32,
    pub uptime_secs: u64,
    pub cache_size_mb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReset {
    pub success: bool,
    pub message: String,
    pub cleared_entries: usize,
}

/// Operational probes over the orchestrator's collaborators.
pub struct RecoveryTools {
    storage: Arc<dyn ProjectStorage>,
    dashboard: Arc<MonitoringDashboard>,
    cache: Option<Arc<CacheStore>>,
    scratch_dir: PathBuf,
    started: Instant,
}

impl RecoveryTools {
    pub fn new(
        storage: Arc<dyn ProjectStorage>,
        dashboard: Arc<MonitoringDashboard>,
        cache: Option<Arc<CacheStore>>,
    ) -> Self {
        Self {
            storage,
            dashboard,
            cache,
            scratch_dir: std::env::temp_dir(),
            started: Instant::now(),
        }
    }

    /// Directory used by the file-system write probe.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    #[instrument(skip_all)]
    pub async fn run_diagnostics(&self) -> Diagnostics {
        let mut components = BTreeMap::new();

        let started = Instant::now();
        let storage = if self.storage.check_connection().await {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "{} storage is not reachable",
                self.storage.backend()
            ))
        };
        components.insert(
            "storage".to_string(),
            ComponentCheck::from_result(storage, started),
        );

        let started = Instant::now();
        components.insert(
            "file_system".to_string(),
            ComponentCheck::from_result(probe_write(&self.scratch_dir), started),
        );

        let started = Instant::now();
        let cache = match &self.cache {
            Some(cache) => probe_write(cache.dir()),
            None => Err(anyhow::anyhow!("cache store not configured")),
        };
        components.insert(
            "cache_system".to_string(),
            ComponentCheck::from_result(cache, started),
        );

        let success = components.values().all(|c| c.status == CheckStatus::Ok);
        let message = if success {
            "diagnostics passed".to_string()
        } else {
            "diagnostics finished with errors".to_string()
        };
        if success {
            info!("{message}");
        } else {
            warn!("{message}");
        }
        Diagnostics {
            success,
            message,
            components,
        }
    }

    pub async fn health_check(&self) -> HealthReport {
        let diagnostics = self.run_diagnostics().await;
        let mut issues = Vec::new();
        let components = diagnostics
            .components
            .into_iter()
            .map(|(name, details)| {
                let healthy = details.status == CheckStatus::Ok;
                if !healthy {
                    let error = details.error.as_deref().unwrap_or("unknown error");
                    issues.push(format!("{name}: {error}"));
                }
                let status = if healthy { "healthy" } else { "unhealthy" };
                (name, ComponentHealth { status, details })
            })
            .collect();
        HealthReport {
            healthy: issues.is_empty(),
            components,
            issues,
        }
    }

    pub fn system_metrics(&self) -> SystemMetrics {
        SystemMetrics {
            os: std::env::consts::OS,
            family: std::env::consts::FAMILY,
            arch: std::env::consts::ARCH,
            logical_cores: std::thread::available_parallelism().map_or(1, |n| n.get()),
            pid: std::process::id(),
            uptime_secs: self.started.elapsed().as_secs(),
            cache_size_mb: self
                .cache
                .as_ref()
                .map(|c| c.total_size() as f64 / (1024.0 * 1024.0)),
        }
    }

    /// Clear agent error states on the dashboard.
    pub fn reset_status_cache(&self) -> StatusReset {
        let cleared_entries = self.dashboard.reset_error_states();
        StatusReset {
            success: true,
            message: format!("status cache reset ({cleared_entries} entries cleared)"),
            cleared_entries,
        }
    }
}

/// Create, write and remove a probe file inside `dir`.
fn probe_write(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let probe = dir.join(format!(".orchestrator-probe-{}", std::process::id()));
    fs::write(&probe, b"probe").with_context(|| format!("write {}", probe.display()))?;
    fs::remove_file(&probe).with_context(|| format!("remove {}", probe.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AgentRole;
    use crate::io::cache::CachePolicy;
    use crate::io::config::MonitoringConfig;
    use crate::io::storage::LocalStorage;

    fn tools(root: &Path, cache: Option<Arc<CacheStore>>) -> RecoveryTools {
        RecoveryTools::new(
            Arc::new(LocalStorage::new(root)),
            Arc::new(MonitoringDashboard::default()),
            cache,
        )
        .with_scratch_dir(root)
    }

    #[tokio::test]
    async fn diagnostics_pass_with_local_storage_and_cache() {
        let temp = tempfile::tempdir().expect("tempdir");
        let policy = CachePolicy::from(&MonitoringConfig::default());
        let cache = CacheStore::open(temp.path().join("cache"), policy).expect("cache");

        let report = tools(temp.path(), Some(Arc::new(cache))).run_diagnostics().await;
        assert!(report.success, "{report:?}");
        assert_eq!(report.components.len(), 3);
        assert!(report.components["storage"].latency_ms.is_some());
    }

    #[tokio::test]
    async fn missing_cache_is_reported_as_issue() {
        let temp = tempfile::tempdir().expect("tempdir");
        let health = tools(temp.path(), None).health_check().await;
        assert!(!health.healthy);
        assert_eq!(health.components["cache_system"].status, "unhealthy");
        assert_eq!(health.components["storage"].status, "healthy");
        assert_eq!(health.issues, vec!["cache_system: cache store not configured"]);
    }

    #[test]
    fn reset_reports_cleared_agents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tools = tools(temp.path(), None);
        tools.dashboard.register_agent("Coder", AgentRole::Coder);
        tools.dashboard.agent_finished("Coder", Some("boom"));

        let reset = tools.reset_status_cache();
        assert_eq!(reset.cleared_entries, 1);
        assert!(reset.success);
        assert!(tools.system_metrics().logical_cores >= 1);
    }
}
