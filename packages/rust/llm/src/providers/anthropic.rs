//! Anthropic Messages API provider.
//!
//! Auth via `x-api-key` plus the required `anthropic-version` header; the
//! system prompt is a top-level `system` field.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use compintel_shared::Result;

use super::ProviderSettings;
use crate::provider::{Completion, LlmProvider, Pricing, Prompt, http_client, malformed, send_json};

/// The required Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    settings: ProviderSettings,
}

impl AnthropicProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            settings,
        })
    }

    fn build_request_body(&self, prompt: &Prompt) -> Value {
        let mut body = json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
            "messages": [{"role": "user", "content": prompt.user}],
        });
        if let Some(system) = prompt.system.as_deref().filter(|s| !s.is_empty()) {
            body["system"] = json!(system);
        }
        body
    }

    fn parse_response(&self, body: &Value) -> Result<Completion> {
        let blocks = body["content"]
            .as_array()
            .ok_or_else(|| malformed(self.name(), "missing 'content' array"))?;
        let content = blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        let usage = &body["usage"];
        Ok(Completion {
            content,
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0),
            finish_reason: body["stop_reason"].as_str().map(str::to_string),
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        self.settings.kind.canonical_name()
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    fn pricing(&self) -> Pricing {
        self.settings.pricing
    }

    async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        let url = format!("{}/messages", self.settings.base_url);
        debug!(model = self.model(), url = url.as_str(), "sending Anthropic request");

        let request = self
            .client
            .post(&url)
            .header("x-api-key", &self.settings.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&self.build_request_body(prompt));

        let body = send_json(self.name(), request).await?;
        self.parse_response(&body)
    }
}
