//! HTTP client for the translation pipeline backend.
//!
//! Every endpoint the core consumes lives behind the `PipelineApi` trait so
//! orchestration code can be exercised against a fake backend in tests.

use crate::model::{
    ExecuteRequest, PipelineConfig, ProgressUpdate, SessionSummary, SplitStatus,
};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication rejected")]
    Auth,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Transient errors may be retried; everything else is definitive.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Network(_) | ApiError::Timeout)
    }
}

#[derive(Debug, Deserialize)]
struct SessionIdResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct GlossaryResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SessionListResponse {
    #[serde(default)]
    sessions: Vec<SessionSummary>,
}

/// Backend operations consumed by the orchestrator and the polling fallback.
#[async_trait]
pub trait PipelineApi: Send + Sync {
    async fn upload_and_split(
        &self,
        file: &Path,
        config_json: &serde_json::Value,
    ) -> Result<String, ApiError>;

    async fn split_from_parent(
        &self,
        parent_session_id: &str,
        processor: &str,
    ) -> Result<String, ApiError>;

    async fn split_status(&self, session_id: &str) -> Result<SplitStatus, ApiError>;

    async fn execute_start(&self, req: &ExecuteRequest) -> Result<(), ApiError>;

    async fn execution_progress(&self, session_id: &str) -> Result<ProgressUpdate, ApiError>;

    async fn download(&self, session_id: &str) -> Result<Bytes, ApiError>;

    async fn upload_glossary(&self, file: &Path) -> Result<String, ApiError>;

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ApiError>;
}

/// reqwest-backed implementation of `PipelineApi`.
pub struct HttpApiClient {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpApiClient {
    pub fn new(cfg: &PipelineConfig) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.http_timeout)
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            bearer_token: cfg.bearer_token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.bearer_token.as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status.as_u16() == 404 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::NotFound(body));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ApiError::Auth);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::Backend(format!("HTTP {}: {}", status, body)))
    }

    fn map_send_error(e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Network(e.to_string())
        }
    }

    async fn file_part(file: &Path) -> Result<multipart::Part, ApiError> {
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("read {}: {}", file.display(), e)))?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        multipart::Part::bytes(bytes)
            .file_name(name)
            .mime_str("application/octet-stream")
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    async fn parse_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ApiError> {
        resp.json::<T>()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl PipelineApi for HttpApiClient {
    async fn upload_and_split(
        &self,
        file: &Path,
        config_json: &serde_json::Value,
    ) -> Result<String, ApiError> {
        let part = Self::file_part(file).await?;
        let form = multipart::Form::new()
            .text("config", config_json.to_string())
            .part("file", part);

        let resp = self
            .apply_auth(self.client.post(self.url("/api/upload-and-split")))
            .multipart(form)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let resp = Self::check_status(resp).await?;
        let body: SessionIdResponse = Self::parse_json(resp).await?;
        Ok(body.session_id)
    }

    async fn split_from_parent(
        &self,
        parent_session_id: &str,
        processor: &str,
    ) -> Result<String, ApiError> {
        let resp = self
            .apply_auth(self.client.post(self.url("/api/split-from-parent")))
            .json(&serde_json::json!({
                "parent_session_id": parent_session_id,
                "processor": processor,
            }))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let resp = Self::check_status(resp).await?;
        let body: SessionIdResponse = Self::parse_json(resp).await?;
        Ok(body.session_id)
    }

    async fn split_status(&self, session_id: &str) -> Result<SplitStatus, ApiError> {
        let resp = self
            .apply_auth(
                self.client
                    .get(self.url(&format!("/api/split-status/{}", session_id))),
            )
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let resp = Self::check_status(resp).await?;
        Self::parse_json(resp).await
    }

    async fn execute_start(&self, req: &ExecuteRequest) -> Result<(), ApiError> {
        let resp = self
            .apply_auth(self.client.post(self.url("/api/execute-start")))
            .json(req)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn execution_progress(&self, session_id: &str) -> Result<ProgressUpdate, ApiError> {
        let resp = self
            .apply_auth(
                self.client
                    .get(self.url(&format!("/api/execution-progress/{}", session_id))),
            )
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let resp = Self::check_status(resp).await?;
        Self::parse_json(resp).await
    }

    async fn download(&self, session_id: &str) -> Result<Bytes, ApiError> {
        let resp = self
            .apply_auth(
                self.client
                    .get(self.url(&format!("/api/download/{}", session_id))),
            )
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let resp = Self::check_status(resp).await?;
        resp.bytes()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))
    }

    async fn upload_glossary(&self, file: &Path) -> Result<String, ApiError> {
        let part = Self::file_part(file).await?;
        let form = multipart::Form::new().part("file", part);

        let resp = self
            .apply_auth(self.client.post(self.url("/api/glossaries")))
            .multipart(form)
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let resp = Self::check_status(resp).await?;
        let body: GlossaryResponse = Self::parse_json(resp).await?;
        Ok(body.id)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, ApiError> {
        let resp = self
            .apply_auth(self.client.get(self.url("/api/sessions")))
            .send()
            .await
            .map_err(Self::map_send_error)?;
        let resp = Self::check_status(resp).await?;
        let body: SessionListResponse = Self::parse_json(resp).await?;
        Ok(body.sessions)
    }
}
