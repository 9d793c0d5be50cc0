//! Per-task artifact cache stored under a cache directory.
//!
//! Layout:
//!
//! ```text
//! <cache_dir>/
//!   cache_index.json        task id -> entry metadata
//!   <task_id>/<file path>   cached artifact files
//! ```
//!
//! The index is rewritten atomically (temp file + rename) after every change.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::core::types::AgentRole;
use crate::io::config::MonitoringConfig;

pub const INDEX_FILE: &str = "cache_index.json";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub task_id: String,
    pub role: AgentRole,
    pub file_count: usize,
    /// Total artifact bytes.
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
    pub preview: Option<String>,
}

impl CacheEntry {
    pub fn size_mb(&self) -> f64 {
        self.total_size as f64 / BYTES_PER_MB
    }
}

/// Auto-clean and retention policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub auto_clean_enabled: bool,
    pub auto_clean_threshold_mb: u64,
    pub auto_clean_keep_count: usize,
    pub max_age_days: u32,
}

impl From<&MonitoringConfig> for CachePolicy {
    fn from(cfg: &MonitoringConfig) -> Self {
        Self {
            auto_clean_enabled: cfg.auto_clean_enabled,
            auto_clean_threshold_mb: cfg.auto_clean_threshold_mb,
            auto_clean_keep_count: cfg.auto_clean_keep_count,
            max_age_days: cfg.max_age_days,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoleUsage {
    pub count: usize,
    pub size_mb: f64,
    pub files: usize,
}

/// Aggregate view used by the dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheSummary {
    pub total_entries: usize,
    pub total_size_mb: f64,
    pub total_files: usize,
    pub by_role: BTreeMap<AgentRole, RoleUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub total_entries: usize,
    pub total_size_mb: f64,
    pub total_files: usize,
    pub by_role_mb: BTreeMap<AgentRole, f64>,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
    pub avg_age_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewFile {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CachePreview {
    pub task_id: String,
    pub role: AgentRole,
    pub file_count: usize,
    pub total_size_mb: f64,
    pub created_at: DateTime<Utc>,
    pub preview: Option<String>,
    pub files: Vec<PreviewFile>,
}

#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    policy: CachePolicy,
    index: Mutex<BTreeMap<String, CacheEntry>>,
}

impl CacheStore {
    /// Open (creating if needed) the cache at `dir` and load its index.
    ///
    /// An unreadable index is logged and replaced by an empty one.
    pub fn open(dir: impl Into<PathBuf>, policy: CachePolicy) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create cache directory {}", dir.display()))?;
        let index = load_index(&dir.join(INDEX_FILE));
        info!(dir = %dir.display(), entries = index.len(), "cache opened");
        Ok(Self {
            dir,
            policy,
            index: Mutex::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, CacheEntry>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `files` (relative path -> content) under `task_id`, replacing any
    /// previous entry for that task.
    pub fn create_entry(
        &self,
        task_id: &str,
        role: AgentRole,
        files: &[(String, String)],
        preview: Option<String>,
    ) -> Result<CacheEntry> {
        self.create_entry_at(task_id, role, files, preview, Utc::now())
    }

    fn create_entry_at(
        &self,
        task_id: &str,
        role: AgentRole,
        files: &[(String, String)],
        preview: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Result<CacheEntry> {
        let task_dir = self.task_dir(task_id)?;
        let targets = files
            .iter()
            .map(|(name, content)| Ok((task_dir.join(relative(name)?), content)))
            .collect::<Result<Vec<_>>>()?;

        if task_dir.exists() {
            fs::remove_dir_all(&task_dir)
                .with_context(|| format!("replace cache entry {}", task_dir.display()))?;
        }
        fs::create_dir_all(&task_dir)
            .with_context(|| format!("create cache entry {}", task_dir.display()))?;

        let mut total_size = 0u64;
        for (path, content) in targets {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            fs::write(&path, content)
                .with_context(|| format!("write cache file {}", path.display()))?;
            total_size += content.len() as u64;
        }

        let entry = CacheEntry {
            task_id: task_id.to_string(),
            role,
            file_count: files.len(),
            total_size,
            created_at,
            preview,
        };

        let mut index = self.lock();
        index.insert(task_id.to_string(), entry.clone());
        self.save_index(&index)?;
        info!(
            task_id,
            files = entry.file_count,
            size_mb = entry.size_mb(),
            "cache entry created"
        );
        Ok(entry)
    }

    pub fn entry(&self, task_id: &str) -> Option<CacheEntry> {
        self.lock().get(task_id).cloned()
    }

    /// Entries, newest first, optionally restricted to one role.
    pub fn list_entries(&self, role: Option<AgentRole>) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self
            .lock()
            .values()
            .filter(|e| role.is_none_or(|r| e.role == r))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        entries
    }

    /// Remove one entry and its files. Returns `false` for unknown ids.
    pub fn delete_entry(&self, task_id: &str) -> Result<bool> {
        let mut index = self.lock();
        if !index.contains_key(task_id) {
            return Ok(false);
        }
        self.remove_locked(&mut index, task_id)?;
        self.save_index(&index)?;
        Ok(true)
    }

    /// Remove every entry; returns how many were removed.
    pub fn clear_all(&self) -> Result<usize> {
        let mut index = self.lock();
        let ids: Vec<String> = index.keys().cloned().collect();
        for id in &ids {
            self.remove_locked(&mut index, id)?;
        }
        self.save_index(&index)?;
        info!(removed = ids.len(), "cache cleared");
        Ok(ids.len())
    }

    pub fn total_size(&self) -> u64 {
        self.lock().values().map(|e| e.total_size).sum()
    }

    pub fn size_by_role(&self) -> BTreeMap<AgentRole, u64> {
        let mut sizes = BTreeMap::new();
        for entry in self.lock().values() {
            *sizes.entry(entry.role).or_insert(0) += entry.total_size;
        }
        sizes
    }

    /// Keep only the newest `auto_clean_keep_count` entries once the cache
    /// reaches the size threshold. No-op when auto-clean is disabled.
    pub fn auto_clean(&self) -> Result<usize> {
        if !self.policy.auto_clean_enabled {
            return Ok(0);
        }
        let total_mb = self.total_size() as f64 / BYTES_PER_MB;
        if total_mb < self.policy.auto_clean_threshold_mb as f64 {
            debug!(total_mb, "cache under auto-clean threshold");
            return Ok(0);
        }

        let stale: Vec<String> = self
            .list_entries(None)
            .into_iter()
            .skip(self.policy.auto_clean_keep_count)
            .map(|e| e.task_id)
            .collect();
        let removed = self.delete_many(&stale)?;
        info!(
            removed,
            remaining_mb = self.total_size() as f64 / BYTES_PER_MB,
            "cache auto-clean finished"
        );
        Ok(removed)
    }

    /// Remove entries older than `max_age_days` (policy default when `None`).
    pub fn cleanup_old(&self, max_age_days: Option<u32>) -> Result<usize> {
        let days = max_age_days.unwrap_or(self.policy.max_age_days);
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        let old: Vec<String> = self
            .lock()
            .values()
            .filter(|e| e.created_at < cutoff)
            .map(|e| e.task_id.clone())
            .collect();
        let removed = self.delete_many(&old)?;
        if removed > 0 {
            info!(removed, max_age_days = days, "old cache entries removed");
        }
        Ok(removed)
    }

    pub fn summary(&self) -> CacheSummary {
        let index = self.lock();
        let mut by_role: BTreeMap<AgentRole, RoleUsage> = BTreeMap::new();
        let mut total_size = 0u64;
        let mut total_files = 0usize;
        for entry in index.values() {
            let usage = by_role.entry(entry.role).or_default();
            usage.count += 1;
            usage.size_mb += entry.size_mb();
            usage.files += entry.file_count;
            total_size += entry.total_size;
            total_files += entry.file_count;
        }
        CacheSummary {
            total_entries: index.len(),
            total_size_mb: total_size as f64 / BYTES_PER_MB,
            total_files,
            by_role,
        }
    }

    pub fn statistics(&self) -> CacheStatistics {
        let index = self.lock();
        let now = Utc::now();
        let entries: Vec<&CacheEntry> = index.values().collect();
        let avg_age_hours = if entries.is_empty() {
            0.0
        } else {
            let total_secs: i64 = entries
                .iter()
                .map(|e| (now - e.created_at).num_seconds())
                .sum();
            total_secs as f64 / entries.len() as f64 / 3600.0
        };
        let mut by_role_mb = BTreeMap::new();
        for entry in &entries {
            *by_role_mb.entry(entry.role).or_insert(0.0) += entry.size_mb();
        }
        CacheStatistics {
            total_entries: entries.len(),
            total_size_mb: entries.iter().map(|e| e.total_size).sum::<u64>() as f64 / BYTES_PER_MB,
            total_files: entries.iter().map(|e| e.file_count).sum(),
            by_role_mb,
            oldest_entry: entries.iter().map(|e| e.created_at).min(),
            newest_entry: entries.iter().map(|e| e.created_at).max(),
            avg_age_hours,
        }
    }

    /// Entry metadata plus the files actually present on disk.
    pub fn preview(&self, task_id: &str) -> Option<CachePreview> {
        let entry = self.entry(task_id)?;
        let task_dir = self.task_dir(task_id).ok()?;
        if !task_dir.is_dir() {
            return None;
        }
        let mut files: Vec<PreviewFile> = WalkDir::new(&task_dir)
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                let size = e.metadata().ok()?.len();
                let rel = e.path().strip_prefix(&task_dir).ok()?;
                Some(PreviewFile {
                    path: rel.to_string_lossy().replace('\\', "/"),
                    size,
                })
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Some(CachePreview {
            task_id: entry.task_id.clone(),
            role: entry.role,
            file_count: entry.file_count,
            total_size_mb: entry.size_mb(),
            created_at: entry.created_at,
            preview: entry.preview,
            files,
        })
    }

    fn delete_many(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut index = self.lock();
        let mut removed = 0;
        for id in ids {
            if index.contains_key(id) {
                self.remove_locked(&mut index, id)?;
                removed += 1;
            }
        }
        self.save_index(&index)?;
        Ok(removed)
    }

    fn remove_locked(&self, index: &mut BTreeMap<String, CacheEntry>, task_id: &str) -> Result<()> {
        let task_dir = self.task_dir(task_id)?;
        if task_dir.exists() {
            fs::remove_dir_all(&task_dir)
                .with_context(|| format!("remove cache entry {}", task_dir.display()))?;
        }
        index.remove(task_id);
        debug!(task_id, "cache entry removed");
        Ok(())
    }

    fn task_dir(&self, task_id: &str) -> Result<PathBuf> {
        if task_id.is_empty()
            || task_id == INDEX_FILE
            || task_id.contains(['/', '\\'])
            || task_id.starts_with('.')
        {
            bail!("invalid cache task id '{task_id}'");
        }
        Ok(self.dir.join(task_id))
    }

    fn save_index(&self, index: &BTreeMap<String, CacheEntry>) -> Result<()> {
        let path = self.dir.join(INDEX_FILE);
        let mut buf = serde_json::to_string_pretty(index).context("serialize cache index")?;
        buf.push('\n');
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, buf)
            .with_context(|| format!("write temp index {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("replace index {}", path.display()))?;
        Ok(())
    }
}

fn load_index(path: &Path) -> BTreeMap<String, CacheEntry> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "cache index unreadable, starting empty");
            return BTreeMap::new();
        }
    };
    serde_json::from_str(&contents).unwrap_or_else(|err| {
        warn!(path = %path.display(), err = %err, "cache index corrupt, starting empty");
        BTreeMap::new()
    })
}

fn relative(name: &str) -> Result<&Path> {
    let path = Path::new(name);
    let ok = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !ok {
        bail!("invalid cache file name '{name}'");
    }
    Ok(path)
}
