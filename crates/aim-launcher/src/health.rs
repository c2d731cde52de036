//! Health probing of started servers.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Default path probed on vLLM and SGLang servers
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Answers whether a server at `base_url` is ready to take requests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Ok when healthy; Err carries the reason for logs
    async fn check(&self, base_url: &str) -> Result<(), String>;
}

/// HTTP GET on `<base_url><path>`, healthy on 200.
#[derive(Clone, Debug)]
pub struct HttpHealthProbe {
    http: reqwest::Client,
    path: String,
}

impl HttpHealthProbe {
    /// Probe `path` with a per-request timeout
    pub fn new(path: impl Into<String>, timeout: Duration) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format!("failed to create HTTP client: {e}"))?;
        Ok(Self {
            http,
            path: path.into(),
        })
    }

    fn url(&self, base_url: &str) -> String {
        let path = self.path.trim_start_matches('/');
        format!("{}/{}", base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, base_url: &str) -> Result<(), String> {
        let url = self.url(base_url);
        let resp = self.http.get(&url).send().await.map_err(|e| e.to_string())?;
        let status = resp.status();
        debug!(url = %url, status = status.as_u16(), "Health probe");
        if status == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(format!("{url} returned {status}"))
        }
    }
}
