//! Artifact fetchers: how bytes get into a reserved cache slot.
//!
//! The cache manager only knows the [`Fetcher`] trait. It asks for a size
//! hint before reserving capacity, then calls `fetch` outside its lock.

use std::path::{Path, PathBuf};
use std::time::Duration;

use aim_common::fs::{copy_tree, directory_size};
use aim_common::process::run_command;
use aim_common::quantity::{deserialize_bytes, deserialize_duration, gib};
use aim_common::CacheError;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

/// Default Hugging Face endpoint
pub const DEFAULT_HUB_ENDPOINT: &str = "https://huggingface.co";

/// Materializes model artifacts into a directory
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Expected artifact size in bytes, used for the capacity reservation
    async fn size_hint(&self, model_id: &str) -> Result<u64, CacheError>;

    /// Write the artifact into `dest` (already created, empty) and return
    /// the bytes written
    async fn fetch(&self, model_id: &str, dest: &Path) -> Result<u64, CacheError>;
}

// =============================================================================
// Hugging Face hub
// =============================================================================

/// Settings for [`HubCliFetcher`]
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HubCliConfig {
    /// Hub base URL
    pub endpoint: String,
    /// Access token for gated models
    pub token: Option<String>,
    /// Downloader binary
    pub cli: String,
    /// Size assumed when the hub API cannot be reached
    #[serde(alias = "fallback_size", deserialize_with = "deserialize_bytes")]
    pub fallback_size_bytes: u64,
    /// Upper bound on one download attempt
    #[serde(deserialize_with = "deserialize_duration")]
    pub download_timeout: Duration,
}

impl Default for HubCliConfig {
    fn default() -> Self {
        Self {
            endpoint: std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_HUB_ENDPOINT.to_string()),
            token: std::env::var("HF_TOKEN").ok(),
            cli: "huggingface-cli".to_string(),
            fallback_size_bytes: gib(100),
            download_timeout: Duration::from_secs(6 * 3600),
        }
    }
}

/// Sizes models with the hub REST API and downloads with `huggingface-cli`.
#[derive(Clone, Debug)]
pub struct HubCliFetcher {
    config: HubCliConfig,
    http: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelInfo {
    #[serde(default)]
    used_storage: Option<u64>,
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Deserialize)]
struct Sibling {
    #[serde(default)]
    size: Option<u64>,
}

impl HubCliFetcher {
    /// Create a fetcher; fails only if the HTTP client cannot be built
    pub fn new(config: HubCliConfig) -> Result<Self, CacheError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| CacheError::fetch("-", format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    async fn query_size(&self, model_id: &str) -> Result<u64, String> {
        let url = format!(
            "{}/api/models/{}?blobs=true",
            self.config.endpoint.trim_end_matches('/'),
            model_id
        );
        let mut req = self.http.get(&url);
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("{} returned {}", url, resp.status()));
        }
        let info: ModelInfo = resp.json().await.map_err(|e| e.to_string())?;
        Ok(size_from_model_info(&info))
    }
}

fn size_from_model_info(info: &ModelInfo) -> u64 {
    info.used_storage
        .filter(|&n| n > 0)
        .unwrap_or_else(|| info.siblings.iter().filter_map(|s| s.size).sum())
}

#[async_trait]
impl Fetcher for HubCliFetcher {
    async fn size_hint(&self, model_id: &str) -> Result<u64, CacheError> {
        match self.query_size(model_id).await {
            Ok(size) if size > 0 => {
                debug!(model_id, size, "Hub size hint");
                Ok(size)
            }
            Ok(_) | Err(_) => {
                warn!(
                    model_id,
                    fallback = self.config.fallback_size_bytes,
                    "Hub size unavailable, reserving fallback size"
                );
                Ok(self.config.fallback_size_bytes)
            }
        }
    }

    async fn fetch(&self, model_id: &str, dest: &Path) -> Result<u64, CacheError> {
        let mut cmd = Command::new(&self.config.cli);
        cmd.arg("download")
            .arg(model_id)
            .arg("--local-dir")
            .arg(dest);
        if let Some(token) = &self.config.token {
            cmd.env("HF_TOKEN", token);
        }
        cmd.env("HF_ENDPOINT", &self.config.endpoint);

        info!(model_id, dest = %dest.display(), "Downloading model");
        run_command(&mut cmd, self.config.download_timeout, "huggingface-cli download")
            .await
            .map_err(|e| CacheError::fetch(model_id, e))?;

        measure(dest).await
    }
}

// =============================================================================
// Local directory
// =============================================================================

/// Copies an artifact that already exists on local disk.
#[derive(Clone, Debug)]
pub struct LocalCopyFetcher {
    source: PathBuf,
}

impl LocalCopyFetcher {
    /// Copy from `source` (a directory or single file)
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[async_trait]
impl Fetcher for LocalCopyFetcher {
    async fn size_hint(&self, model_id: &str) -> Result<u64, CacheError> {
        if !self.source.exists() {
            return Err(CacheError::fetch(
                model_id,
                format!("source {} does not exist", self.source.display()),
            ));
        }
        measure(&self.source).await
    }

    async fn fetch(&self, model_id: &str, dest: &Path) -> Result<u64, CacheError> {
        let source = self.source.clone();
        let target = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| CacheError::fetch(model_id, e.to_string()))?
            .map_err(|e| CacheError::fetch(model_id, format!("copy failed: {e}")))
    }
}

/// Size of a directory tree, computed off the async executor
pub async fn measure(path: &Path) -> Result<u64, CacheError> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || directory_size(&owned))
        .await
        .map_err(|e| CacheError::io(path, e.to_string()))?
        .map_err(|e| CacheError::io(path, e.to_string()))
}
