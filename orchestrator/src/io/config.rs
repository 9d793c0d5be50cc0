//! Orchestrator configuration stored in `orchestrator.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::gate::DEFAULT_HISTORY_CAPACITY;

pub const DEFAULT_CONFIG_FILE: &str = "orchestrator.toml";

/// Orchestrator configuration (TOML).
///
/// Missing fields fall back to defaults, so an empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Upper bound on subtask scheduler iterations per task.
    pub max_iterations: u32,

    pub monitoring: MonitoringConfig,
    pub auto_accept: AutoAcceptConfig,
    pub tester: TesterConfig,
    pub model: ModelConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    /// Cache directory, relative to the project root unless absolute.
    pub cache_dir: PathBuf,
    pub auto_clean_enabled: bool,
    /// Auto-clean runs once the cache reaches this many megabytes.
    pub auto_clean_threshold_mb: u64,
    /// Newest entries kept by auto-clean.
    pub auto_clean_keep_count: usize,
    pub max_age_days: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_dir: PathBuf::from(".orchestrator/cache"),
            auto_clean_enabled: true,
            auto_clean_threshold_mb: 500,
            auto_clean_keep_count: 50,
            max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutoAcceptConfig {
    pub enabled: bool,
    pub history_capacity: usize,
}

impl Default for AutoAcceptConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TesterConfig {
    /// Shell command line that runs the project's tests.
    pub command: String,
    pub timeout_secs: u64,
    /// Truncate test stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            command: "python -m pytest --verbose --tb=short".to_string(),
            timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

/// Backend that serves model requests.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    #[default]
    Anthropic,
    /// No backend: every request fails. Lets the monitoring surface run
    /// without credentials.
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub provider: ModelProvider,
    pub api_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub planner: String,
    pub coder: String,
    pub reviewer: String,
    pub tester: String,
    pub timeout_secs: u64,
    /// Rendered prompts are trimmed to fit this many bytes.
    pub prompt_budget_bytes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ModelProvider::Anthropic,
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            planner: "claude-sonnet-4-5".to_string(),
            coder: "claude-sonnet-4-5".to_string(),
            reviewer: "claude-sonnet-4-5".to_string(),
            tester: "claude-haiku-4-5".to_string(),
            timeout_secs: 120,
            prompt_budget_bytes: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    /// Base URL of a remote IDE file API; local filesystem when unset.
    pub remote_url: Option<String>,
    pub api_key_env: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            api_key_env: "IDE_API_KEY".to_string(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            monitoring: MonitoringConfig::default(),
            auto_accept: AutoAcceptConfig::default(),
            tester: TesterConfig::default(),
            model: ModelConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.auto_accept.history_capacity == 0 {
            return Err(anyhow!("auto_accept.history_capacity must be > 0"));
        }
        if self.tester.command.trim().is_empty() {
            return Err(anyhow!("tester.command must be non-empty"));
        }
        if self.tester.timeout_secs == 0 {
            return Err(anyhow!("tester.timeout_secs must be > 0"));
        }
        if self.tester.output_limit_bytes == 0 {
            return Err(anyhow!("tester.output_limit_bytes must be > 0"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.model.prompt_budget_bytes == 0 {
            return Err(anyhow!("model.prompt_budget_bytes must be > 0"));
        }
        if self.monitoring.cache_dir.as_os_str().is_empty() {
            return Err(anyhow!("monitoring.cache_dir must be non-empty"));
        }
        if let Some(url) = &self.storage.remote_url
            && url.trim().is_empty()
        {
            return Err(anyhow!("storage.remote_url must be non-empty when set"));
        }
        Ok(())
    }

    /// Cache directory resolved against `project_root`.
    pub fn cache_dir(&self, project_root: &Path) -> PathBuf {
        if self.monitoring.cache_dir.is_absolute() {
            self.monitoring.cache_dir.clone()
        } else {
            project_root.join(&self.monitoring.cache_dir)
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
        assert_eq!(cfg.max_iterations, 10);
        assert!(!cfg.auto_accept.enabled);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join(DEFAULT_CONFIG_FILE);
        let mut cfg = OrchestratorConfig::default();
        cfg.storage.remote_url = Some("http://localhost:8000".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, "max_iterations = 3\n[auto_accept]\nenabled = true\n").expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 3);
        assert!(cfg.auto_accept.enabled);
        assert_eq!(cfg.auto_accept.history_capacity, DEFAULT_HISTORY_CAPACITY);
        assert_eq!(cfg.tester, TesterConfig::default());
    }

    #[test]
    fn model_provider_is_selectable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, "[model]\nprovider = \"null\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.model.provider, ModelProvider::Null);
        assert_eq!(cfg.model.coder, ModelConfig::default().coder);

        fs::write(&path, "[model]\nprovider = \"gemini\"\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn zero_iterations_is_invalid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, "max_iterations = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("max_iterations"));
    }

    #[test]
    fn relative_cache_dir_resolves_under_project() {
        let cfg = OrchestratorConfig::default();
        let root = Path::new("/work/project");
        assert_eq!(
            cfg.cache_dir(root),
            PathBuf::from("/work/project/.orchestrator/cache")
        );
    }
}
