//! HTTP search provider

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{Provider, ProviderError};
use crate::types::Candidate;

/// Configuration for the HTTP provider
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    /// Search endpoint; the name is passed as `?q=`
    pub base_url: String,
    /// Optional bearer token
    pub api_key: Option<String>,
    /// Client-side request timeout (default: 10 seconds)
    pub request_timeout: Duration,
}

impl Default for HttpProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/search".to_string(),
            api_key: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SearchResponse {
    Bare(Vec<Candidate>),
    Wrapped { results: Vec<Candidate> },
}

impl SearchResponse {
    fn into_candidates(self) -> Vec<Candidate> {
        match self {
            Self::Bare(c) | Self::Wrapped { results: c } => {
                c.into_iter().map(Candidate::normalized).collect()
            }
        }
    }
}

pub struct HttpProvider {
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("discovery-guard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(Self { config, client })
    }

    fn search_url(&self, name: &str) -> String {
        let sep = if self.config.base_url.contains('?') { '&' } else { '?' };
        format!("{}{}q={}", self.config.base_url, sep, urlencoding::encode(name))
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.get(url).header("Accept", "application/json");
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn map_send_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.config.request_timeout)
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

/// Map a non-success HTTP status to a provider error
fn status_error(status: StatusCode, retry_after: Option<u64>, body: String) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        ProviderError::Quota {
            retry_after_seconds: retry_after,
        }
    } else if status.is_server_error() {
        ProviderError::Server {
            status: status.as_u16(),
            message: body,
        }
    } else {
        ProviderError::Validation(format!("HTTP {}: {}", status.as_u16(), body))
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn id(&self) -> &str {
        &self.config.base_url
    }

    async fn search(&self, name: &str) -> Result<Vec<Candidate>, ProviderError> {
        let url = self.search_url(name);
        debug!(url = %url, "Provider search");

        let response = self
            .request(&url)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Provider returned error status");
            return Err(status_error(status, retry_after, body));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Server {
                status: status.as_u16(),
                message: format!("malformed response: {}", e),
            })?;

        Ok(parsed.into_candidates())
    }

    async fn ping(&self) -> Result<(), ProviderError> {
        let response = self
            .client
            .head(&self.config.base_url)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if response.status().is_server_error() {
            return Err(status_error(response.status(), None, String::new()));
        }
        Ok(())
    }
}
