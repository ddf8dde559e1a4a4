//! Web search collaborator.
//!
//! [`SearchProvider::search`] returns result URLs in rank order. Rate-limit
//! responses surface as [`CompIntelError::RateLimited`]; [`RetryingSearch`]
//! absorbs them with backoff so a throttled search never fails a competitor.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};

use compintel_shared::{CompIntelError, FetchConfig, Result, RetryPolicy};

/// Capability to turn a query into ranked result URLs.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, num_results: usize) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// SearxSearch
// ---------------------------------------------------------------------------

/// Client for a SearXNG-compatible JSON endpoint.
pub struct SearxSearch {
    client: Client,
    endpoint: String,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxResult>,
}

#[derive(Debug, Deserialize)]
struct SearxResult {
    url: String,
}

impl SearxSearch {
    pub fn new(endpoint: &str, fetch: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(fetch.user_agent.as_str())
            .timeout(Duration::from_secs(fetch.timeout_secs))
            .build()
            .map_err(|e| CompIntelError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            timeout_secs: fetch.timeout_secs,
        })
    }
}

#[async_trait]
impl SearchProvider for SearxSearch {
    #[instrument(skip(self), fields(endpoint = %self.endpoint))]
    async fn search(&self, query: &str, num_results: usize) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/search", self.endpoint))
            .query(&[("q", query), ("format", "json")])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompIntelError::Timeout {
                        operation: "search".into(),
                        timeout_secs: self.timeout_secs,
                    }
                } else {
                    CompIntelError::TransientNetwork(format!("search: {e}"))
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            return Err(CompIntelError::RateLimited {
                service: "search".into(),
                retry_after_secs,
            });
        }
        if status.is_server_error() {
            return Err(CompIntelError::TransientNetwork(format!("search: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(CompIntelError::Network(format!("search: HTTP {status}")));
        }

        let body: SearxResponse = response
            .json()
            .await
            .map_err(|e| CompIntelError::parse(format!("search response: {e}")))?;

        let urls: Vec<String> = body
            .results
            .into_iter()
            .map(|r| r.url)
            .take(num_results)
            .collect();
        debug!(query, results = urls.len(), "search complete");
        Ok(urls)
    }
}

// ---------------------------------------------------------------------------
// RetryingSearch
// ---------------------------------------------------------------------------

/// Wraps a provider so transient failures (including 429) are retried.
pub struct RetryingSearch<S> {
    inner: S,
    retry: RetryPolicy,
}

impl<S: SearchProvider> RetryingSearch<S> {
    pub fn new(inner: S, retry: RetryPolicy) -> Self {
        Self { inner, retry }
    }
}

#[async_trait]
impl<S: SearchProvider> SearchProvider for RetryingSearch<S> {
    async fn search(&self, query: &str, num_results: usize) -> Result<Vec<String>> {
        self.retry
            .run("search", |_| self.inner.search(query, num_results))
            .await
    }
}
