//! Assemble a production [`Orchestrator`] from config: storage backend,
//! shared gate, monitoring bundle and one model-backed agent per role.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::agents::{AgentDeps, CoderAgent, PlannerAgent, ReviewerAgent, RoleHandle, TesterAgent};
use crate::core::gate::AutoAcceptGate;
use crate::io::config::OrchestratorConfig;
use crate::io::model::model_from_config;
use crate::io::storage::{LocalStorage, ProjectStorage, RemoteStorage};
use crate::monitoring::MonitoringBundle;
use crate::workflow::Orchestrator;

/// Build an orchestrator for the project rooted at `root`.
///
/// Storage is remote when `storage.remote_url` is set, else the local
/// directory. The gate is shared between the orchestrator and every agent.
/// Each role gets a client from the configured `[model] provider`.
pub fn build_orchestrator(config: &OrchestratorConfig, root: &Path) -> Result<Orchestrator> {
    let storage: Arc<dyn ProjectStorage> = match &config.storage.remote_url {
        Some(url) => Arc::new(RemoteStorage::new(
            url,
            std::env::var(&config.storage.api_key_env).ok(),
            Duration::from_secs(config.model.timeout_secs),
        )?),
        None => Arc::new(LocalStorage::new(root)),
    };
    debug!(backend = storage.backend(), "storage selected");
    let gate = Arc::new(AutoAcceptGate::new(
        config.auto_accept.enabled,
        config.auto_accept.history_capacity,
    ));

    let mut orchestrator =
        Orchestrator::new(config.clone(), Arc::clone(&storage)).with_gate(Arc::clone(&gate));
    let mut cache = None;
    if config.monitoring.enabled {
        let bundle = MonitoringBundle::from_config(config, root, Arc::clone(&storage))?;
        cache = bundle.cache.clone();
        orchestrator = orchestrator.with_monitoring(bundle);
    }

    let deps_for = |model_name: &str| -> Result<AgentDeps> {
        let model = model_from_config(&config.model, model_name)?;
        let mut deps = AgentDeps::new(model, Arc::clone(&storage))
            .with_gate(Arc::clone(&gate))
            .with_prompt_budget(config.model.prompt_budget_bytes);
        if let Some(cache) = &cache {
            deps = deps.with_cache(Arc::clone(cache));
        }
        Ok(deps)
    };

    orchestrator.register_agent(RoleHandle::Planner(Arc::new(PlannerAgent::new(deps_for(
        &config.model.planner,
    )?))));
    orchestrator.register_agent(RoleHandle::Coder(Arc::new(CoderAgent::new(deps_for(
        &config.model.coder,
    )?))));
    orchestrator.register_agent(RoleHandle::Reviewer(Arc::new(ReviewerAgent::new(
        deps_for(&config.model.reviewer)?,
    ))));
    orchestrator.register_agent(RoleHandle::Tester(Arc::new(TesterAgent::new(
        deps_for(&config.model.tester)?,
        config.tester.clone(),
    ))));
    Ok(orchestrator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::AgentRole;
    use crate::io::config::ModelProvider;

    #[test]
    fn null_provider_registers_every_role_without_credentials() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = OrchestratorConfig::default();
        config.model.provider = ModelProvider::Null;
        config.model.api_key_env = "ORCHESTRATOR_TEST_UNSET_KEY_VAR".to_string();

        let orchestrator = build_orchestrator(&config, temp.path()).expect("build");
        assert_eq!(orchestrator.registry().len(), 4);
        assert!(orchestrator.registry().contains(AgentRole::Tester));
        assert!(orchestrator.monitoring().is_some());
    }
}
