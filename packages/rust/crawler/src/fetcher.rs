//! Page fetching with retry, SSRF protection, and text extraction.
//!
//! [`Fetcher::fetch`] never fails: every attempt yields a [`FetchResponse`]
//! whose [`FetchStatus`] records what happened, so callers can always turn
//! it into a `Source`.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Node, Selector};
use tracing::{debug, instrument, warn};
use url::Url;

use compintel_shared::{CompIntelError, FetchConfig, FetchStatus, Result, RetryPolicy};

/// Elements whose text never counts as page content.
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "header", "noscript", "head", "template",
];

// ---------------------------------------------------------------------------
// FetchResponse
// ---------------------------------------------------------------------------

/// Outcome of fetching one URL.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: String,
    pub status: FetchStatus,
    /// HTTP status code of the final attempt, when a response arrived.
    pub status_code: Option<u16>,
    pub html: String,
    /// Visible text with page chrome removed.
    pub text: String,
    pub title: Option<String>,
    pub error: Option<String>,
}

impl FetchResponse {
    fn without_body(url: &str, status: FetchStatus, status_code: Option<u16>, error: String) -> Self {
        Self {
            url: url.to_string(),
            status,
            status_code,
            html: String::new(),
            text: String::new(),
            title: None,
            error: Some(error),
        }
    }

    /// First `max_chars` characters of the text, for source summaries.
    pub fn excerpt(&self, max_chars: usize) -> String {
        self.text.chars().take(max_chars).collect()
    }
}

/// Capability to retrieve a document by URL.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchResponse;
}

// ---------------------------------------------------------------------------
// HttpFetcher
// ---------------------------------------------------------------------------

/// reqwest-backed fetcher. 5xx, timeouts, and connection errors are retried;
/// any other non-success status is returned immediately.
pub struct HttpFetcher {
    client: Client,
    retry: RetryPolicy,
    timeout_secs: u64,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_private_hosts: bool,
}

impl HttpFetcher {
    pub fn new(config: &FetchConfig, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CompIntelError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            retry: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                ..retry
            },
            timeout_secs: config.timeout_secs,
            allow_private_hosts: config.allow_private_hosts,
        })
    }

    /// One GET. Returns `(status, body)` for any non-5xx response.
    async fn fetch_once(&self, url: &Url, last_status: &AtomicU16) -> Result<(u16, String)> {
        let response = self.client.get(url.as_str()).send().await.map_err(|e| {
            if e.is_timeout() {
                CompIntelError::Timeout {
                    operation: format!("fetch {url}"),
                    timeout_secs: self.timeout_secs,
                }
            } else if e.is_connect() || e.is_request() {
                CompIntelError::TransientNetwork(format!("{url}: {e}"))
            } else {
                CompIntelError::Network(format!("{url}: {e}"))
            }
        })?;

        let status = response.status();
        last_status.store(status.as_u16(), Ordering::Relaxed);

        if status.is_server_error() {
            return Err(CompIntelError::TransientNetwork(format!("{url}: HTTP {status}")));
        }

        let body = if status.is_success() {
            response.text().await.map_err(|e| {
                CompIntelError::TransientNetwork(format!("{url}: body read failed: {e}"))
            })?
        } else {
            String::new()
        };
        Ok((status.as_u16(), body))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip_all, fields(url = %url))]
    async fn fetch(&self, url: &str) -> FetchResponse {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                return FetchResponse::without_body(
                    url,
                    FetchStatus::Failed,
                    None,
                    format!("invalid URL: {e}"),
                );
            }
        };

        if !self.allow_private_hosts && is_ssrf_target(&parsed) {
            warn!(%url, "SSRF protection: blocked");
            return FetchResponse::without_body(
                url,
                FetchStatus::Blocked,
                None,
                "blocked: private or non-http target".into(),
            );
        }

        let last_status = AtomicU16::new(0);
        let outcome = self
            .retry
            .run("fetch", |_| self.fetch_once(&parsed, &last_status))
            .await;

        match outcome {
            Ok((code, body)) => {
                let response = build_response(url, code, body);
                debug!(
                    status = response.status.as_str(),
                    status_code = code,
                    text_len = response.text.len(),
                    "fetched"
                );
                response
            }
            Err(e) => {
                let code = match last_status.load(Ordering::Relaxed) {
                    0 => None,
                    code => Some(code),
                };
                warn!(error = %e, status_code = ?code, "fetch failed");
                FetchResponse::without_body(url, FetchStatus::Failed, code, e.to_string())
            }
        }
    }
}

/// Map a received response onto a fetch status.
fn build_response(url: &str, code: u16, html: String) -> FetchResponse {
    if !(200..300).contains(&code) {
        let status = match code {
            401 | 403 | 451 => FetchStatus::Blocked,
            _ => FetchStatus::Failed,
        };
        return FetchResponse::without_body(url, status, Some(code), format!("HTTP {code}"));
    }

    let doc = Html::parse_document(&html);
    let text = extract_text(&doc);
    let title = extract_title(&doc);
    let (status, error) = if text.is_empty() {
        (FetchStatus::Empty, Some("no extractable text".to_string()))
    } else {
        (FetchStatus::Fetched, None)
    };

    FetchResponse {
        url: url.to_string(),
        status,
        status_code: Some(code),
        html,
        text,
        title,
        error,
    }
}

// ---------------------------------------------------------------------------
// Content extraction
// ---------------------------------------------------------------------------

/// Visible text, one line per text node, skipping chrome and scripts.
pub fn extract_text(doc: &Html) -> String {
    let mut lines = Vec::new();
    for node in doc.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let in_chrome = node.ancestors().any(|a| {
            matches!(a.value(), Node::Element(el) if SKIPPED_TAGS.contains(&el.name()))
        });
        if in_chrome {
            continue;
        }
        let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines.join("\n")
}

/// Trimmed `<title>` text, if present and non-empty.
pub fn extract_title(doc: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    doc.select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub(crate) fn is_ssrf_target(url: &Url) -> bool {
    // Block non-HTTP schemes
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
