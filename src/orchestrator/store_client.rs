//! HTTP client for the session store's agent-facing endpoints.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Store client errors, split by retryability.
#[derive(Debug, Clone, Error)]
pub enum StoreClientError {
    #[error("store unreachable: {0}")]
    Transport(String),

    #[error("session not found")]
    NotFound,

    #[error("store rejected request: {0}")]
    Rejected(String),

    #[error("store upstream error: {0}")]
    Upstream(u16),
}

impl StoreClientError {
    /// Transport blips and 5xx are worth retrying; validation failures and
    /// missing sessions are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreClientError::Transport(_) | StoreClientError::Upstream(_)
        )
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, StoreClientError>;

/// Body of `POST /sessions/open`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionRequest {
    pub session_id: String,
    pub dev_id: String,
    pub start_ts: u64,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Body of `POST /sessions/close`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloseSessionRequest {
    pub session_id: String,
    pub end_ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postroll_sec: Option<u64>,
}

/// Capability the orchestrator uses to open and close sessions.
#[async_trait]
pub trait SessionStoreClient: Send + Sync {
    async fn open_session(&self, req: &OpenSessionRequest) -> Result<()>;
    async fn close_session(&self, req: &CloseSessionRequest) -> Result<()>;
}

/// reqwest-backed implementation against the store's base URL.
pub struct HttpStoreClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpStoreClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| StoreClientError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status.as_u16() == 404 {
            return Err(StoreClientError::NotFound);
        }
        if status.is_client_error() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(StoreClientError::Rejected(format!("{status}: {detail}")));
        }
        Err(StoreClientError::Upstream(status.as_u16()))
    }
}

#[async_trait]
impl SessionStoreClient for HttpStoreClient {
    async fn open_session(&self, req: &OpenSessionRequest) -> Result<()> {
        self.post_json("/sessions/open", req).await
    }

    async fn close_session(&self, req: &CloseSessionRequest) -> Result<()> {
        self.post_json("/sessions/close", req).await
    }
}
