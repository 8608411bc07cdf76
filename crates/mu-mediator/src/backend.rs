//! Client for the local enhancement backend.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use mu_proto::config::BackendConfig;
use mu_proto::params::{BackendTuning, TransformParams};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::EnhanceError;

pub const MODEL_HEADER: &str = "X-MU-Model";
pub const HOST_ERROR_HEADER: &str = "X-MU-Host-Error";

#[derive(Debug, Clone, PartialEq)]
pub struct EnhanceRequest {
    pub locator: String,
    pub params: TransformParams,
}

/// A successful enhancement result.
#[derive(Debug, Clone, PartialEq)]
pub struct Enhanced {
    pub bytes: Bytes,
    pub content_type: String,
    pub model: String,
}

#[async_trait]
pub trait EnhanceBackend: Send + Sync {
    async fn enhance(&self, req: &EnhanceRequest) -> Result<Enhanced, EnhanceError>;

    /// True when the backend answered its health probe in time.
    async fn health(&self) -> bool;

    async fn shutdown(&self) -> anyhow::Result<()>;

    async fn push_config(&self, tuning: &BackendTuning) -> anyhow::Result<()>;

    async fn clear_cache(&self) -> anyhow::Result<()>;

    async fn download_models(&self, extra_tier: bool) -> anyhow::Result<()>;
}

pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    health_timeout: Duration,
}

impl HttpBackend {
    pub fn new(cfg: &BackendConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            health_timeout: Duration::from_millis(cfg.health_timeout_ms),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn query(params: &TransformParams) -> [(&'static str, String); 3] {
        let p = params.normalized();
        [
            ("scale", p.scale.to_string()),
            ("quality", p.quality.as_str().to_string()),
            ("format", p.format.as_str().to_string()),
        ]
    }

    async fn post_empty(&self, path: &str) -> anyhow::Result<()> {
        self.client
            .post(self.url(path))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl EnhanceBackend for HttpBackend {
    async fn enhance(&self, req: &EnhanceRequest) -> Result<Enhanced, EnhanceError> {
        let query = Self::query(&req.params);
        let builder = if req.locator.starts_with("data:") {
            let (mime, body) = parse_data_uri(&req.locator).ok_or_else(|| {
                EnhanceError::Decode("inline source is not base64 data".to_string())
            })?;
            debug!("enhance: POST {} bytes ({})", body.len(), mime);
            self.client
                .post(self.url("/enhance"))
                .query(&query)
                .header(CONTENT_TYPE, mime)
                .body(body)
        } else {
            debug!("enhance: GET {}", req.locator);
            self.client
                .get(self.url("/enhance"))
                .query(&query)
                .query(&[("url", req.locator.as_str())])
        };

        let resp = builder
            .send()
            .await
            .map_err(|e| EnhanceError::Transient(e.to_string()))?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(EnhanceError::Transient(format!("backend returned {}", status)));
        }
        if !status.is_success() {
            return Err(EnhanceError::HostError(describe_status(status)));
        }

        let headers = resp.headers();
        if let Some(err) = headers.get(HOST_ERROR_HEADER) {
            let text = err.to_str().unwrap_or("unreadable error header").to_string();
            return Err(EnhanceError::HostError(text));
        }
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| req.params.format.content_type().to_string());
        let model = headers
            .get(MODEL_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| EnhanceError::Transient(e.to_string()))?;
        if bytes.is_empty() {
            return Err(EnhanceError::HostError("empty response body".to_string()));
        }
        Ok(Enhanced {
            bytes,
            content_type,
            model,
        })
    }

    async fn health(&self) -> bool {
        let probe = self
            .client
            .get(self.url("/health"))
            .timeout(self.health_timeout)
            .send()
            .await;
        matches!(probe, Ok(resp) if resp.status().is_success())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.post_empty("/shutdown").await
    }

    async fn push_config(&self, tuning: &BackendTuning) -> anyhow::Result<()> {
        self.client
            .post(self.url("/config"))
            .json(tuning)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn clear_cache(&self) -> anyhow::Result<()> {
        self.post_empty("/cache/clear").await
    }

    async fn download_models(&self, extra_tier: bool) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(self.url("/models/download"))
            .json(&serde_json::json!({ "extra_tier": extra_tier }))
            .send()
            .await?;
        if !resp.status().is_success() {
            warn!("model download request returned {}", resp.status());
            anyhow::bail!("model download failed: {}", resp.status());
        }
        Ok(())
    }
}

fn describe_status(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

/// Split a base64 `data:` URI into its media type and decoded body.
pub fn parse_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    let rest = uri.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let mime = meta.strip_suffix(";base64")?;
    let mime = if mime.is_empty() {
        "application/octet-stream"
    } else {
        mime
    };
    let body = STANDARD.decode(payload.trim()).ok()?;
    Some((mime.to_string(), body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_data_uri() {
        let (mime, body) = parse_data_uri("data:image/png;base64,aGVsbG8=").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(body, b"hello");
        assert!(parse_data_uri("data:text/plain,hello").is_none());
        assert!(parse_data_uri("https://x.org/a.png").is_none());
    }

    #[test]
    fn test_query_is_normalised() {
        let q = HttpBackend::query(&TransformParams {
            scale: 1,
            ..Default::default()
        });
        assert_eq!(q[0], ("scale", "2".to_string()));
        assert_eq!(q[1], ("quality", "balanced".to_string()));
        assert_eq!(q[2], ("format", "png".to_string()));
    }
}
