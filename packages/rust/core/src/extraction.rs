//! Claim extraction: build the structured prompt for one source and turn the
//! provider's JSON answer into [`Claim`]s attributed to that source.
//!
//! Malformed output never fails the stage; it yields no claims and a warning.

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::warn;

use compintel_llm::{Prompt, strip_code_fences};
use compintel_shared::{Claim, ClaimCategory, ConfidenceTier, Source};

const SYSTEM_PROMPT: &str = "You are a competitive-intelligence analyst. Extract concrete, \
factual claims about the named company from the page text. Only state what the text supports. \
Use confidence \"verified_on_source\" when the page states the fact directly, \"estimated\" for \
approximate figures, and \"inferred\" for conclusions drawn from indirect evidence. When a claim \
gives a value for a measurable attribute (employee_count, founded_year, revenue, headquarters, \
customer_count), include \"attribute\" and \"value\".";

/// JSON schema hint sent with structured extraction requests.
pub fn claims_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "claims": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["text", "category", "confidence"],
                    "properties": {
                        "text": {"type": "string"},
                        "category": {
                            "enum": ["scale", "technology", "ownership", "gtm", "financial",
                                     "ai_ml", "marketing", "service_model", "personnel", "other"]
                        },
                        "confidence": {"enum": ["verified_on_source", "estimated", "inferred"]},
                        "attribute": {"type": "string"},
                        "value": {"type": "string"}
                    }
                }
            }
        }
    })
}

/// Prompt asking for the claims `text` makes about `competitor`.
pub fn extraction_prompt(competitor: &str, source: &Source, text: &str, text_limit: usize) -> Prompt {
    let body: String = text.chars().take(text_limit).collect();
    Prompt::new(format!(
        "Company: {competitor}\nSource category: {}\nURL: {}\n\nPage text:\n{body}",
        source.category, source.url
    ))
    .with_system(SYSTEM_PROMPT)
    .with_schema(claims_schema())
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExtractionPayload {
    Wrapped {
        #[serde(default)]
        claims: Vec<RawClaim>,
    },
    Bare(Vec<RawClaim>),
}

#[derive(Debug, Deserialize)]
struct RawClaim {
    #[serde(default)]
    text: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    confidence: Option<String>,
    #[serde(default)]
    attribute: Option<String>,
    #[serde(default)]
    value: Option<Value>,
}

/// Parse a provider answer into claims attributed to `source`.
pub fn parse_claims(content: &str, source: &Source) -> Vec<Claim> {
    let payload: ExtractionPayload = match serde_json::from_str(strip_code_fences(content)) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(url = source.url.as_str(), error = %e, "unparseable extraction output; no claims");
            return Vec::new();
        }
    };
    let raw = match payload {
        ExtractionPayload::Wrapped { claims } | ExtractionPayload::Bare(claims) => claims,
    };

    raw.into_iter()
        .filter_map(|r| {
            let text = r.text.trim();
            if text.is_empty() {
                return None;
            }
            let category = r
                .category
                .as_deref()
                .and_then(|c| c.parse().ok())
                .unwrap_or(ClaimCategory::Other);
            // A model may not pre-judge contradictions; only reconciliation marks them.
            let confidence = r
                .confidence
                .as_deref()
                .and_then(|c| c.parse().ok())
                .filter(|c| *c != ConfidenceTier::Conflicting)
                .unwrap_or(ConfidenceTier::Inferred);
            let mut claim = Claim::new(text, category, confidence, &source.id);
            let value = r.value.as_ref().and_then(value_text);
            if let (Some(attribute), Some(value)) = (r.attribute.as_deref(), value) {
                let attribute = attribute.trim().to_ascii_lowercase().replace([' ', '-'], "_");
                if !attribute.is_empty() && !value.is_empty() {
                    claim = claim.with_attribute(attribute, value);
                }
            }
            Some(claim)
        })
        .collect()
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
