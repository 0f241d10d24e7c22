use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::{HTTP_CONNECT_TIMEOUT_SECS, HTTP_TIMEOUT_SECS};
use crate::model::{Campaign, StartTestRequest, StartTestResponse};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("invalid backend url: {0}")]
    Url(#[from] url::ParseError),

    #[error("backend url cannot carry a path: {0}")]
    NotABase(String),
}

/// Typed client for the MFT backend's HTTP API.
#[derive(Clone)]
pub struct BackendClient {
    base: Url,
    http: reqwest::Client,
    /// No overall timeout: the event stream stays open indefinitely.
    stream_http: reqwest::Client,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(BackendError::NotABase(base_url.to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .pool_max_idle_per_host(4)
            .build()?;
        let stream_http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            base,
            http,
            stream_http,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Base URL extended with percent-encoded path segments.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::NotABase(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    // --- Campaigns ---

    pub async fn list_campaigns(&self) -> Result<Vec<String>, BackendError> {
        self.get_json(&["api", "campaigns"]).await
    }

    pub async fn create_campaign(&self, campaign: &Campaign) -> Result<(), BackendError> {
        let url = self.endpoint(&["api", "campaigns"])?;
        let resp = self.http.post(url).json(campaign).send().await?;
        check_status(resp).await.map(drop)
    }

    pub async fn update_campaign(&self, id: &str, campaign: &Campaign) -> Result<(), BackendError> {
        let url = self.endpoint(&["api", "campaigns", id])?;
        let resp = self.http.put(url).json(campaign).send().await?;
        check_status(resp).await.map(drop)
    }

    // --- Tests ---

    pub async fn start_test(
        &self,
        request: &StartTestRequest,
    ) -> Result<StartTestResponse, BackendError> {
        let url = self.endpoint(&["api", "tests"])?;
        let resp = self.http.post(url).json(request).send().await?;
        Ok(check_status(resp).await?.json().await?)
    }

    pub async fn stop_test(&self) -> Result<(), BackendError> {
        let url = self.endpoint(&["api", "test", "stop"])?;
        let resp = self.http.post(url).send().await?;
        check_status(resp).await.map(drop)
    }

    /// Raw history records. Each element is decoded on its own by the poller.
    pub async fn fetch_history(&self) -> Result<Vec<serde_json::Value>, BackendError> {
        self.get_json(&["api", "tests", "history"]).await
    }

    pub async fn delete_test(&self, test_id: &str) -> Result<(), BackendError> {
        let url = self.endpoint(&["api", "tests", test_id])?;
        let resp = self.http.delete(url).send().await?;
        check_status(resp).await.map(drop)
    }

    // --- Live feeds ---

    /// Open the server-push status stream. The body is consumed by the event ingestor.
    pub async fn open_event_stream(&self) -> Result<reqwest::Response, BackendError> {
        let url = self.endpoint(&["api", "events"])?;
        debug!("Opening event stream at {}", url);
        let resp = self
            .stream_http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        check_status(resp).await
    }

    pub async fn fetch_log(&self) -> Result<String, BackendError> {
        let url = self.endpoint(&["logs", "latest.log"])?;
        let resp = self.http.get(url).send().await?;
        Ok(check_status(resp).await?.text().await?)
    }

    async fn get_json<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, BackendError> {
        let url = self.endpoint(segments)?;
        let resp = self.http.get(url).send().await?;
        Ok(check_status(resp).await?.json().await?)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(BackendError::Status { status, body })
}
