//! Google Gemini `generateContent` provider.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use compintel_shared::Result;

use super::ProviderSettings;
use crate::provider::{Completion, LlmProvider, Pricing, Prompt, http_client, malformed, send_json};

pub struct GeminiProvider {
    client: Client,
    settings: ProviderSettings,
}

impl GeminiProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            settings,
        })
    }

    /// System text is folded into the user turn ahead of the prompt.
    fn build_request_body(&self, prompt: &Prompt) -> Value {
        let text = match prompt.system.as_deref().filter(|s| !s.is_empty()) {
            Some(system) => format!("{system}\n\n{}", prompt.user),
            None => prompt.user.clone(),
        };
        json!({
            "contents": [{"role": "user", "parts": [{"text": text}]}],
            "generationConfig": {
                "maxOutputTokens": self.settings.max_tokens,
                "temperature": self.settings.temperature,
            }
        })
    }

    fn parse_response(&self, body: &Value) -> Result<Completion> {
        let candidate = body["candidates"]
            .get(0)
            .ok_or_else(|| malformed(self.name(), "missing 'candidates[0]'"))?;
        let parts = candidate["content"]["parts"]
            .as_array()
            .ok_or_else(|| malformed(self.name(), "missing 'content.parts'"))?;
        let content = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        let usage = &body["usageMetadata"];
        Ok(Completion {
            content,
            input_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0),
            output_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0),
            finish_reason: candidate["finishReason"].as_str().map(str::to_string),
        })
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
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
        let url = format!(
            "{}/models/{}:generateContent",
            self.settings.base_url, self.settings.model
        );
        debug!(model = self.model(), "sending Gemini request");

        let request = self
            .client
            .post(&url)
            .query(&[("key", self.settings.api_key.as_str())])
            .json(&self.build_request_body(prompt));

        let body = send_json(self.name(), request).await?;
        self.parse_response(&body)
    }
}
