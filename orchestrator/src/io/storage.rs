//! Project storage: where agents read and write project files.
//!
//! Two backends share the [`ProjectStorage`] trait: the local filesystem,
//! rooted at the project directory, and a remote IDE file API over HTTP.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

#[async_trait]
pub trait ProjectStorage: Send + Sync {
    /// Short backend label for diagnostics.
    fn backend(&self) -> &'static str;

    /// File contents, or `None` when the file does not exist.
    async fn read(&self, path: &str) -> Result<Option<String>>;

    async fn write(&self, path: &str, content: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Returns `true` when a file was removed.
    async fn delete(&self, path: &str) -> Result<bool>;

    /// Connectivity probe; never fails, only reports.
    async fn check_connection(&self) -> bool;
}

/// Storage backed by a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a project-relative path, refusing anything that escapes the root.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        if path.trim().is_empty() {
            bail!("empty path");
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => bail!("path escapes project root: {path}"),
            }
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ProjectStorage for LocalStorage {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn read(&self, path: &str) -> Result<Option<String>> {
        let full = self.resolve(path)?;
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", full.display())),
        }
    }

    #[instrument(skip_all, fields(path = %path, bytes = content.len()))]
    async fn write(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        tokio::fs::write(&full, content)
            .await
            .with_context(|| format!("write {}", full.display()))?;
        debug!(path = %full.display(), "file written");
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        tokio::fs::try_exists(&full)
            .await
            .with_context(|| format!("stat {}", full.display()))
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("delete {}", full.display())),
        }
    }

    async fn check_connection(&self) -> bool {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) => meta.is_dir(),
            Err(err) => {
                warn!(root = %self.root.display(), err = %err, "project root not accessible");
                false
            }
        }
    }
}

/// Storage backed by a remote IDE file API.
///
/// Endpoints: `GET /health`, `GET /files/read?path=`, `POST /files/write`,
/// `DELETE /files?path=`. The API key, when set, is sent as a bearer token.
#[derive(Debug, Clone)]
pub struct RemoteStorage {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct ReadResponse {
    #[serde(default)]
    content: String,
}

#[derive(Serialize)]
struct WriteRequest<'a> {
    path: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct SuccessResponse {
    #[serde(default)]
    success: bool,
}

impl RemoteStorage {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn request(&self, method: reqwest::Method, endpoint: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, self.url(endpoint))
            .header("Accept", "application/json");
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

#[async_trait]
impl ProjectStorage for RemoteStorage {
    fn backend(&self) -> &'static str {
        "remote"
    }

    #[instrument(skip_all, fields(path = %path))]
    async fn read(&self, path: &str) -> Result<Option<String>> {
        let response = self
            .request(reqwest::Method::GET, "/files/read")
            .query(&[("path", path)])
            .send()
            .await
            .with_context(|| format!("remote read {path}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .with_context(|| format!("remote read {path}"))?;
        let body: ReadResponse = response
            .json()
            .await
            .with_context(|| format!("decode remote read {path}"))?;
        Ok(Some(body.content))
    }

    #[instrument(skip_all, fields(path = %path, bytes = content.len()))]
    async fn write(&self, path: &str, content: &str) -> Result<()> {
        let body: SuccessResponse = self
            .request(reqwest::Method::POST, "/files/write")
            .json(&WriteRequest { path, content })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("remote write {path}"))?
            .json()
            .await
            .with_context(|| format!("decode remote write {path}"))?;
        if !body.success {
            return Err(anyhow!("remote write {path} was not acknowledged"));
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.read(path).await?.is_some())
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let response = self
            .request(reqwest::Method::DELETE, "/files")
            .query(&[("path", path)])
            .send()
            .await
            .with_context(|| format!("remote delete {path}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let body: SuccessResponse = response
            .error_for_status()
            .with_context(|| format!("remote delete {path}"))?
            .json()
            .await
            .with_context(|| format!("decode remote delete {path}"))?;
        Ok(body.success)
    }

    async fn check_connection(&self) -> bool {
        match self.request(reqwest::Method::GET, "/health").send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!(url = %self.base_url, err = %err, "remote storage unreachable");
                false
            }
        }
    }
}
