//! REST-backed [`RunSource`] for the search backend's `/searches` API.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use rw_core::{FetchError, ResultRow, Run, RunFilter, RunSource};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid base url {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

pub struct HttpRunSource {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpRunSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidBaseUrl {
            url: config.base_url.clone(),
            reason,
        };
        let base = Url::parse(config.base_url.trim()).map_err(|err| invalid(err.to_string()))?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(invalid("expected an http(s) url".to_string()));
        }
        let client = Client::builder().timeout(config.timeout).build()?;
        let token = config
            .token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        Ok(Self {
            client,
            base,
            token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, FetchError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::Network(format!("unusable base url {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, FetchError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        debug!(event = "http_response", what, status = status.as_u16());
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(what.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        Err(FetchError::Server {
            status: Some(status.as_u16()),
            message: error_message(status, &body),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> Result<T, FetchError> {
        let response = self.send(request, what).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode(format!("{what}: {err}")))
    }
}

#[async_trait]
impl RunSource for HttpRunSource {
    async fn get_run(&self, run_id: &str) -> Result<Run, FetchError> {
        let url = self.endpoint(&["searches", run_id])?;
        debug!(event = "http_request", method = "GET", url = %url);
        self.get_json(self.request(Method::GET, url), &format!("run {run_id}"))
            .await
    }

    async fn get_result_rows(&self, run_id: &str) -> Result<Vec<ResultRow>, FetchError> {
        let url = self.endpoint(&["searches", run_id, "results"])?;
        debug!(event = "http_request", method = "GET", url = %url);
        self.get_json(
            self.request(Method::GET, url),
            &format!("results of run {run_id}"),
        )
        .await
    }

    async fn trigger_audit(&self, run_id: &str, row_id: &str) -> Result<(), FetchError> {
        let url = self.endpoint(&["searches", run_id, "results", row_id, "audit"])?;
        debug!(event = "http_request", method = "POST", url = %url);
        self.send(
            self.request(Method::POST, url),
            &format!("row {row_id} of run {run_id}"),
        )
        .await?;
        Ok(())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, FetchError> {
        let url = self.endpoint(&["searches"])?;
        debug!(event = "http_request", method = "GET", url = %url);
        let mut request = self.request(Method::GET, url);
        if let Some(status) = filter.status {
            request = request.query(&[("status", status.as_str())]);
        }
        let runs: Vec<Run> = self.get_json(request, "runs").await?;
        Ok(filter.apply(runs))
    }
}

fn transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Network(format!("request timed out: {err}"))
    } else {
        FetchError::Network(err.to_string())
    }
}

/// `detail` from a JSON error body, else the raw body, else the status reason.
fn error_message(status: StatusCode, body: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        match map.get("detail") {
            Some(Value::String(detail)) if !detail.trim().is_empty() => {
                return detail.trim().to_string()
            }
            Some(Value::Null) | None => {}
            Some(other) => return other.to_string(),
        }
    }
    let body = body.trim();
    if !body.is_empty() {
        return body.to_string();
    }
    status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
}
