//! The provider interface every LLM backend implements.
//!
//! A provider exposes exactly two capabilities, free-text and structured
//! (JSON) generation, and reports the token usage the backend measured.
//! Cost is always derived from that reported usage, never estimated.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;

use compintel_shared::{CompIntelError, Result};

/// Appended to the system prompt for structured requests.
pub const JSON_INSTRUCTION: &str =
    "Respond with valid JSON only. No markdown fences, no explanation.";

/// Per-request HTTP timeout for provider calls.
pub const DISPATCH_TIMEOUT_SECS: u64 = 120;

// ---------------------------------------------------------------------------
// Requests and completions
// ---------------------------------------------------------------------------

/// Prompt text plus an optional JSON schema hint for structured mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
    pub schema: Option<Value>,
}

impl Prompt {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// System prompt extended with the JSON-only instruction and schema hint.
    pub fn structured_system(&self) -> String {
        let mut instruction = JSON_INSTRUCTION.to_string();
        if let Some(schema) = &self.schema {
            let pretty = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
            instruction.push_str("\n\nExpected JSON schema:\n");
            instruction.push_str(&pretty);
        }
        match self.system.as_deref().filter(|s| !s.is_empty()) {
            Some(system) => format!("{system}\n\n{instruction}"),
            None => instruction,
        }
    }

    /// Copy of this prompt whose system text carries the JSON instruction.
    pub fn into_structured(self) -> Self {
        Self {
            system: Some(self.structured_system()),
            ..self
        }
    }
}

/// A dispatchable request: one of the two provider capabilities.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmRequest {
    Text(Prompt),
    Structured(Prompt),
}

impl LlmRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Structured(_) => "structured",
        }
    }
}

/// What a provider returned, with the usage it reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: Option<String>,
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Pricing {
    pub const fn new(input_per_mtok: f64, output_per_mtok: f64) -> Self {
        Self {
            input_per_mtok,
            output_per_mtok,
        }
    }

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_mtok + output_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

// ---------------------------------------------------------------------------
// LlmProvider
// ---------------------------------------------------------------------------

/// A concrete LLM backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Canonical provider name (`claude`, `openai`, `gemini`, `grok`).
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    fn pricing(&self) -> Pricing;

    /// Free-text generation.
    async fn complete(&self, prompt: &Prompt) -> Result<Completion>;

    /// JSON generation. Defaults to a text call with the JSON instruction.
    async fn complete_structured(&self, prompt: &Prompt) -> Result<Completion> {
        self.complete(&prompt.clone().into_structured()).await
    }

    /// Route a request to the matching capability.
    async fn dispatch(&self, request: &LlmRequest) -> Result<Completion> {
        match request {
            LlmRequest::Text(prompt) => self.complete(prompt).await,
            LlmRequest::Structured(prompt) => self.complete_structured(prompt).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared HTTP plumbing
// ---------------------------------------------------------------------------

/// Build the HTTP client used by provider implementations.
pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(DISPATCH_TIMEOUT_SECS))
        .build()
        .map_err(|e| CompIntelError::Network(format!("failed to build HTTP client: {e}")))
}

/// Send a JSON request and return the parsed body, classifying failures.
pub(crate) async fn send_json(provider: &str, request: RequestBuilder) -> Result<Value> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            CompIntelError::Timeout {
                operation: format!("{provider} dispatch"),
                timeout_secs: DISPATCH_TIMEOUT_SECS,
            }
        } else if e.is_connect() || e.is_request() {
            CompIntelError::TransientNetwork(format!("{provider}: {e}"))
        } else {
            CompIntelError::Provider {
                provider: provider.to_string(),
                message: e.to_string(),
                transient: false,
            }
        }
    })?;

    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body_text = response
        .text()
        .await
        .map_err(|e| CompIntelError::TransientNetwork(format!("{provider}: body read failed: {e}")))?;

    if !status.is_success() {
        return Err(map_http_error(provider, status, retry_after, &body_text));
    }

    serde_json::from_str(&body_text).map_err(|e| CompIntelError::Provider {
        provider: provider.to_string(),
        message: format!("invalid JSON in response: {e}"),
        transient: false,
    })
}

/// Map an HTTP status code to the appropriate error.
///
/// 429 is a rate limit; 408 and 5xx (including 529 overloaded) are transient;
/// everything else is permanent for this provider.
pub(crate) fn map_http_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    body_text: &str,
) -> CompIntelError {
    let snippet: String = body_text.chars().take(300).collect();
    match status.as_u16() {
        429 => CompIntelError::RateLimited {
            service: provider.to_string(),
            retry_after_secs: retry_after,
        },
        408 | 500..=599 => CompIntelError::Provider {
            provider: provider.to_string(),
            message: format!("HTTP {status}: {snippet}"),
            transient: true,
        },
        _ => CompIntelError::Provider {
            provider: provider.to_string(),
            message: format!("HTTP {status}: {snippet}"),
            transient: false,
        },
    }
}

/// Missing-field error for a malformed provider response.
pub(crate) fn malformed(provider: &str, what: &str) -> CompIntelError {
    CompIntelError::Provider {
        provider: provider.to_string(),
        message: format!("malformed response: {what}"),
        transient: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_uses_reported_tokens() {
        let sonnet = Pricing::new(3.0, 15.0);
        assert!((sonnet.cost(1_000_000, 0) - 3.0).abs() < 1e-12);
        assert!((sonnet.cost(2_000, 500) - 0.0135).abs() < 1e-12);
        assert_eq!(sonnet.cost(0, 0), 0.0);
    }

    #[test]
    fn structured_system_appends_instruction_and_schema() {
        let prompt = Prompt::new("extract")
            .with_system("You are an analyst.")
            .with_schema(serde_json::json!({"type": "object"}));
        let system = prompt.structured_system();
        assert!(system.starts_with("You are an analyst.\n\n"));
        assert!(system.contains(JSON_INSTRUCTION));
        assert!(system.contains("\"type\": \"object\""));

        let bare = Prompt::new("x").structured_system();
        assert_eq!(bare, JSON_INSTRUCTION);
    }

    #[test]
    fn http_errors_are_classified() {
        let err = map_http_error("claude", StatusCode::TOO_MANY_REQUESTS, Some(12), "");
        assert!(err.is_transient());
        assert_eq!(err.retry_after_secs(), Some(12));

        let err = map_http_error("claude", StatusCode::SERVICE_UNAVAILABLE, None, "overloaded");
        assert!(err.is_transient());

        let err = map_http_error("openai", StatusCode::UNAUTHORIZED, None, "bad key");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("401"));
    }
}
