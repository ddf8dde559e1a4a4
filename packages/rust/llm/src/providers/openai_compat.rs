//! OpenAI chat-completions provider.
//!
//! xAI Grok speaks the same wire format at a different base URL, so both
//! kinds share this implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::debug;

use compintel_shared::Result;

use super::{ProviderKind, ProviderSettings};
use crate::provider::{Completion, LlmProvider, Pricing, Prompt, http_client, malformed, send_json};

pub struct OpenAiCompatProvider {
    client: Client,
    settings: ProviderSettings,
}

impl OpenAiCompatProvider {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            settings,
        })
    }

    fn build_request_body(&self, prompt: &Prompt, json_mode: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = prompt.system.as_deref().filter(|s| !s.is_empty()) {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt.user}));

        let mut body = json!({
            "model": self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
            "messages": messages,
        });
        // xAI does not document json_object mode; the prompt instruction suffices there.
        if json_mode && self.settings.kind == ProviderKind::OpenAi {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }

    fn parse_response(&self, body: &Value) -> Result<Completion> {
        let choice = body["choices"]
            .get(0)
            .ok_or_else(|| malformed(self.name(), "missing 'choices[0]'"))?;
        let content = choice["message"]["content"]
            .as_str()
            .ok_or_else(|| malformed(self.name(), "missing 'message.content'"))?
            .to_string();
        let usage = &body["usage"];
        Ok(Completion {
            content,
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            finish_reason: choice["finish_reason"].as_str().map(str::to_string),
        })
    }

    async fn send(&self, prompt: &Prompt, json_mode: bool) -> Result<Completion> {
        let url = format!("{}/chat/completions", self.settings.base_url);
        debug!(
            provider = self.name(),
            model = self.model(),
            json_mode,
            "sending chat completion request"
        );

        let request = self
            .client
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&self.build_request_body(prompt, json_mode));

        let body = send_json(self.name(), request).await?;
        self.parse_response(&body)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
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
        self.send(prompt, false).await
    }

    async fn complete_structured(&self, prompt: &Prompt) -> Result<Completion> {
        self.send(&prompt.clone().into_structured(), true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_candidate;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, kind: ProviderKind, alias: &str, model: &str) -> OpenAiCompatProvider {
        let candidate = test_candidate(alias, model, &server.uri());
        OpenAiCompatProvider::new(ProviderSettings::with_key(kind, &candidate, "sk-test".into()))
            .expect("build provider")
    }

    fn chat_response(content: &str) -> Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 40, "completion_tokens": 10}
        })
    }

    #[tokio::test]
    async fn complete_sends_bearer_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("hello")))
            .mount(&server)
            .await;

        let openai = provider(&server, ProviderKind::OpenAi, "openai", "gpt-4o-mini");
        let completion = openai.complete(&Prompt::new("hi")).await.expect("complete");
        assert_eq!(completion.content, "hello");
        assert_eq!(completion.input_tokens, 40);
        assert_eq!(completion.output_tokens, 10);
        assert_eq!(openai.name(), "openai");
    }

    #[tokio::test]
    async fn structured_requests_json_object_format() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"response_format": {"type": "json_object"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("{\"claims\": []}")))
            .mount(&server)
            .await;

        let openai = provider(&server, ProviderKind::OpenAi, "openai", "gpt-4o");
        let completion = openai
            .complete_structured(&Prompt::new("extract"))
            .await
            .expect("structured");
        assert_eq!(completion.content, "{\"claims\": []}");
    }

    #[tokio::test]
    async fn grok_shares_wire_format() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("grok says hi")))
            .mount(&server)
            .await;

        let grok = provider(&server, ProviderKind::Grok, "grok", "grok-2");
        let completion = grok.complete(&Prompt::new("hi")).await.expect("complete");
        assert_eq!(completion.content, "grok says hi");
        assert_eq!(grok.name(), "grok");
        assert_eq!(grok.pricing(), Pricing::new(2.0, 10.0));
    }

    #[tokio::test]
    async fn missing_choices_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let openai = provider(&server, ProviderKind::OpenAi, "openai", "gpt-4o");
        let err = openai.complete(&Prompt::new("hi")).await.expect_err("malformed");
        assert!(err.to_string().contains("malformed"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let openai = provider(&server, ProviderKind::OpenAi, "openai", "gpt-4o");
        let err = openai.complete(&Prompt::new("hi")).await.expect_err("429");
        assert_eq!(err.retry_after_secs(), Some(3));
    }
}
