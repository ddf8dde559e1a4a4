//! Concrete provider implementations and construction from config.
//!
//! - [`AnthropicProvider`]: Anthropic Messages API (Claude)
//! - [`OpenAiCompatProvider`]: OpenAI chat completions, also used for xAI Grok
//! - [`GeminiProvider`]: Google `generateContent`

pub mod anthropic;
pub mod gemini;
pub mod openai_compat;

use std::sync::Arc;

use compintel_shared::{CompIntelError, ProviderCandidate, Result, resolve_api_key};

use crate::provider::{LlmProvider, Pricing};

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai_compat::OpenAiCompatProvider;

/// The closed set of supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Gemini,
    Grok,
}

impl ProviderKind {
    /// Resolve a config alias (`claude`/`anthropic`, `openai`/`gpt`,
    /// `gemini`/`google`, `grok`/`xai`).
    pub fn from_alias(alias: &str) -> Option<Self> {
        match alias.trim().to_ascii_lowercase().as_str() {
            "claude" | "anthropic" => Some(Self::Anthropic),
            "openai" | "gpt" => Some(Self::OpenAi),
            "gemini" | "google" => Some(Self::Gemini),
            "grok" | "xai" => Some(Self::Grok),
            _ => None,
        }
    }

    /// Name recorded on ledger entries.
    pub fn canonical_name(&self) -> &'static str {
        match self {
            Self::Anthropic => "claude",
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Grok => "grok",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            Self::Grok => "https://api.x.ai/v1",
        }
    }

    /// Built-in list price for `model`, falling back to the family's flagship.
    pub fn default_pricing(&self, model: &str) -> Pricing {
        match (self, model) {
            (Self::Anthropic, "claude-opus-4-20250514") => Pricing::new(15.0, 75.0),
            (Self::Anthropic, "claude-haiku-3-20250414") => Pricing::new(0.25, 1.25),
            (Self::Anthropic, _) => Pricing::new(3.0, 15.0),
            (Self::OpenAi, "gpt-4o-mini") => Pricing::new(0.15, 0.60),
            (Self::OpenAi, "gpt-4-turbo") => Pricing::new(10.0, 30.0),
            (Self::OpenAi, _) => Pricing::new(2.50, 10.0),
            (Self::Gemini, "gemini-1.5-pro") => Pricing::new(1.25, 5.00),
            (Self::Gemini, "gemini-1.5-flash") => Pricing::new(0.075, 0.30),
            (Self::Gemini, _) => Pricing::new(0.10, 0.40),
            (Self::Grok, "grok-2-mini") => Pricing::new(0.30, 0.50),
            (Self::Grok, _) => Pricing::new(2.0, 10.0),
        }
    }
}

/// Everything a provider needs besides its HTTP client.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub model: String,
    pub api_key: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub pricing: Pricing,
}

impl ProviderSettings {
    /// Resolve a config candidate, reading its API key from the environment.
    pub fn from_candidate(candidate: &ProviderCandidate) -> Result<Self> {
        let kind = ProviderKind::from_alias(&candidate.provider).ok_or_else(|| {
            CompIntelError::config(format!("unknown provider '{}'", candidate.provider))
        })?;
        let api_key = resolve_api_key(&candidate.api_key_env)?;
        Ok(Self::with_key(kind, candidate, api_key))
    }

    pub fn with_key(kind: ProviderKind, candidate: &ProviderCandidate, api_key: String) -> Self {
        let defaults = kind.default_pricing(&candidate.model);
        Self {
            kind,
            model: candidate.model.clone(),
            api_key,
            base_url: candidate
                .base_url
                .clone()
                .unwrap_or_else(|| kind.default_base_url().to_string())
                .trim_end_matches('/')
                .to_string(),
            max_tokens: candidate.max_tokens,
            temperature: candidate.temperature,
            pricing: Pricing::new(
                candidate.input_price_per_mtok.unwrap_or(defaults.input_per_mtok),
                candidate.output_price_per_mtok.unwrap_or(defaults.output_per_mtok),
            ),
        }
    }
}

/// Instantiate the provider for a config candidate.
pub fn build_provider(candidate: &ProviderCandidate) -> Result<Arc<dyn LlmProvider>> {
    provider_from_settings(ProviderSettings::from_candidate(candidate)?)
}

pub fn provider_from_settings(settings: ProviderSettings) -> Result<Arc<dyn LlmProvider>> {
    Ok(match settings.kind {
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(settings)?),
        ProviderKind::OpenAi | ProviderKind::Grok => Arc::new(OpenAiCompatProvider::new(settings)?),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(settings)?),
    })
}

#[cfg(test)]
pub(crate) fn test_candidate(provider: &str, model: &str, base_url: &str) -> ProviderCandidate {
    ProviderCandidate {
        provider: provider.into(),
        model: model.into(),
        api_key_env: "UNUSED_IN_TESTS".into(),
        max_tokens: 256,
        temperature: 0.0,
        base_url: Some(base_url.into()),
        input_price_per_mtok: None,
        output_price_per_mtok: None,
    }
}
