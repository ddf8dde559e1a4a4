//! Core domain types for competitor research.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Current schema version for persisted research documents and checkpoints.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// UnitKey
// ---------------------------------------------------------------------------

/// Stable identifier for one unit of work (a competitor), derived from its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitKey(String);

impl UnitKey {
    /// Build the key for a competitor name (`"EFM Logistics"` → `efm_logistics`).
    pub fn from_name(name: &str) -> Self {
        Self(slugify(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UnitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, ASCII-alphanumeric slug with `_` separators. Never empty.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_sep = false;
    for c in name.chars() {
        if c == '.' || c == '\'' {
            continue;
        }
        if c.is_ascii_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('_');
            }
            pending_sep = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_sep = true;
        }
    }
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// The ten source taxonomy classes a competitor is researched through.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    CompanySite,
    ProfessionalNetwork,
    MaAnnouncement,
    ParentCompany,
    DirectoryListing,
    TradePublication,
    RevenueEstimator,
    AdTransparency,
    News,
    SocialForum,
}

impl SourceCategory {
    /// All categories, in taxonomy order.
    pub const ALL: [SourceCategory; 10] = [
        Self::CompanySite,
        Self::ProfessionalNetwork,
        Self::MaAnnouncement,
        Self::ParentCompany,
        Self::DirectoryListing,
        Self::TradePublication,
        Self::RevenueEstimator,
        Self::AdTransparency,
        Self::News,
        Self::SocialForum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CompanySite => "company_site",
            Self::ProfessionalNetwork => "professional_network",
            Self::MaAnnouncement => "ma_announcement",
            Self::ParentCompany => "parent_company",
            Self::DirectoryListing => "directory_listing",
            Self::TradePublication => "trade_publication",
            Self::RevenueEstimator => "revenue_estimator",
            Self::AdTransparency => "ad_transparency",
            Self::News => "news",
            Self::SocialForum => "social_forum",
        }
    }

    /// Words appended to the competitor name when searching this category.
    pub fn search_hint(&self) -> &'static str {
        match self {
            Self::CompanySite => "official site",
            Self::ProfessionalNetwork => "linkedin company",
            Self::MaAnnouncement => "acquisition announcement",
            Self::ParentCompany => "parent company",
            Self::DirectoryListing => "company directory listing",
            Self::TradePublication => "trade publication",
            Self::RevenueEstimator => "revenue estimate",
            Self::AdTransparency => "ad library",
            Self::News => "news",
            Self::SocialForum => "reviews forum",
        }
    }
}

impl std::fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown source category '{s}'"))
    }
}

/// Outcome of one fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Fetched,
    Failed,
    Blocked,
    Empty,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Empty => "empty",
        }
    }
}

/// One fetched or attempted external document. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    /// Unique source identifier (UUID v7).
    pub id: String,
    pub url: String,
    pub category: SourceCategory,
    pub accessed_at: DateTime<Utc>,
    /// Short excerpt of the extracted text.
    #[serde(default)]
    pub summary: String,
    pub status: FetchStatus,
    /// Transport status code, when a response was received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl Source {
    /// Record a fetch attempt with a fresh identifier.
    pub fn record(
        url: impl Into<String>,
        category: SourceCategory,
        status: FetchStatus,
        status_code: Option<u16>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            url: url.into(),
            category,
            accessed_at: Utc::now(),
            summary: summary.into(),
            status,
            status_code,
        }
    }
}

// ---------------------------------------------------------------------------
// Claims
// ---------------------------------------------------------------------------

/// Semantic category of a claim. Claims never merge across categories.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ClaimCategory {
    Scale,
    Technology,
    Ownership,
    Gtm,
    Financial,
    AiMl,
    Marketing,
    ServiceModel,
    Personnel,
    Other,
}

impl ClaimCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scale => "scale",
            Self::Technology => "technology",
            Self::Ownership => "ownership",
            Self::Gtm => "gtm",
            Self::Financial => "financial",
            Self::AiMl => "ai_ml",
            Self::Marketing => "marketing",
            Self::ServiceModel => "service_model",
            Self::Personnel => "personnel",
            Self::Other => "other",
        }
    }
}

impl std::str::FromStr for ClaimCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' ', '/'], "_");
        Ok(match normalized.as_str() {
            "scale" => Self::Scale,
            "technology" | "tech" => Self::Technology,
            "ownership" => Self::Ownership,
            "gtm" | "go_to_market" => Self::Gtm,
            "financial" | "finance" => Self::Financial,
            "ai_ml" | "ai" | "ml" => Self::AiMl,
            "marketing" => Self::Marketing,
            "service_model" => Self::ServiceModel,
            "personnel" | "people" => Self::Personnel,
            "other" => Self::Other,
            _ => return Err(format!("unknown claim category '{s}'")),
        })
    }
}

/// How strongly a claim is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTier {
    VerifiedOnSource,
    Estimated,
    Inferred,
    Conflicting,
}

impl ConfidenceTier {
    /// Merge precedence: higher wins. `Conflicting` is handled separately.
    pub fn precedence(&self) -> u8 {
        match self {
            Self::VerifiedOnSource => 3,
            Self::Estimated => 2,
            Self::Inferred => 1,
            Self::Conflicting => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerifiedOnSource => "verified_on_source",
            Self::Estimated => "estimated",
            Self::Inferred => "inferred",
            Self::Conflicting => "conflicting",
        }
    }
}

impl std::str::FromStr for ConfidenceTier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "verified_on_source" | "verified" => Ok(Self::VerifiedOnSource),
            "estimated" => Ok(Self::Estimated),
            "inferred" => Ok(Self::Inferred),
            "conflicting" => Ok(Self::Conflicting),
            other => Err(format!("unknown confidence tier '{other}'")),
        }
    }
}

/// One factual assertion with cumulative provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    /// Stable identifier derived from category + normalized text.
    pub id: String,
    pub text: String,
    pub category: ClaimCategory,
    pub confidence: ConfidenceTier,
    /// Concrete attribute this claim asserts a value for (e.g. `employee_count`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
    /// Normalized value asserted for `attribute`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Sources that support this claim. Only ever grows.
    pub source_ids: BTreeSet<String>,
    /// Sources that support an incompatible value for the same attribute.
    #[serde(default)]
    pub contradicting_source_ids: BTreeSet<String>,
}

impl Claim {
    /// Create a claim extracted from a single source.
    pub fn new(
        text: impl Into<String>,
        category: ClaimCategory,
        confidence: ConfidenceTier,
        source_id: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            id: claim_id(category, &text),
            text,
            category,
            confidence,
            attribute: None,
            value: None,
            source_ids: BTreeSet::from([source_id.into()]),
            contradicting_source_ids: BTreeSet::new(),
        }
    }

    /// Attach an attribute/value pair.
    pub fn with_attribute(mut self, attribute: impl Into<String>, value: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self.value = Some(value.into());
        self
    }

    pub fn is_conflicting(&self) -> bool {
        self.confidence == ConfidenceTier::Conflicting
    }
}

/// Lowercase, strip punctuation, and collapse whitespace.
///
/// Digits, letters, `.` inside numbers, and `%`/`$` are preserved so that
/// `"$1.5M revenue"` and `"$15M revenue"` stay distinct.
pub fn normalize_text(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    for (i, &c) in chars.iter().enumerate() {
        let keep = c.is_alphanumeric()
            || c.is_whitespace()
            || c == '%'
            || c == '$'
            || (c == '.'
                && i > 0
                && chars[i - 1].is_ascii_digit()
                && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()));
        if keep {
            out.extend(c.to_lowercase());
        } else {
            out.push(' ');
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn claim_id(category: ClaimCategory, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(normalize_text(text).as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("clm_{}", &digest[..16])
}

// ---------------------------------------------------------------------------
// ResearchResult
// ---------------------------------------------------------------------------

/// The per-competitor research document consumed read-only by later stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchResult {
    pub schema_version: u32,
    pub competitor: String,
    pub website: String,
    pub slug: UnitKey,
    pub researched_at: DateTime<Utc>,
    /// Every fetch attempt, including failures.
    pub sources: Vec<Source>,
    /// Deduplicated, contradiction-annotated claims.
    pub claims: Vec<Claim>,
    /// Fetch attempts per source category.
    pub sources_by_category: BTreeMap<SourceCategory, usize>,
    /// Categories that yielded no surviving claim from a fetched source.
    pub coverage_gaps: Vec<SourceCategory>,
    /// Number of metered provider dispatches made for this competitor.
    pub llm_calls: u32,
    /// Accumulated provider spend in USD.
    pub cost_usd: f64,
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Pipeline stages that run under the checkpoint contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Research,
    Profiling,
    Scoring,
    Output,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Profiling => "profiling",
            Self::Scoring => "scoring",
            Self::Output => "output",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "research" => Ok(Self::Research),
            "profiling" => Ok(Self::Profiling),
            "scoring" => Ok(Self::Scoring),
            "output" => Ok(Self::Output),
            other => Err(format!("unknown stage '{other}'")),
        }
    }
}

/// Lifecycle status of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// A versioned snapshot of one (unit of work, stage) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub schema_version: u32,
    pub key: UnitKey,
    pub stage: Stage,
    pub status: CheckpointStatus,
    /// Monotonic per (key, stage); assigned by the store on write.
    #[serde(default)]
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    /// Stage output so far (the full result once `complete`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Failure reason when `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Domain invocations made so far under the current run.
    #[serde(default)]
    pub attempts: u32,
}

impl CheckpointRecord {
    pub fn new(key: UnitKey, stage: Stage, status: CheckpointStatus) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            key,
            stage,
            status,
            version: 0,
            timestamp: Utc::now(),
            payload: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

// ---------------------------------------------------------------------------
// Cost ledger
// ---------------------------------------------------------------------------

/// One metered provider operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLedgerEntry {
    /// Position in the ledger, starting at 1.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub task: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    /// Ledger total after this entry.
    pub cumulative_usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_competitor_names() {
        assert_eq!(slugify("EFM Logistics"), "efm_logistics");
        assert_eq!(slugify("Acme Corp."), "acme_corp");
        assert_eq!(slugify("  O'Brien & Sons, Inc. "), "obrien_sons_inc");
        assert_eq!(slugify("!!!"), "unnamed");
        assert_eq!(UnitKey::from_name("EFM Logistics").as_str(), "efm_logistics");
    }

    #[test]
    fn normalize_text_collapses_punctuation() {
        assert_eq!(normalize_text("  ~150 Employees!! "), "150 employees");
        assert_eq!(normalize_text("Revenue of $1.5M."), "revenue of $1.5m");
        assert_eq!(normalize_text("Founded in 1998"), normalize_text("founded in 1998."));
    }

    #[test]
    fn claim_id_is_stable_across_formatting() {
        let a = Claim::new("~150 employees", ClaimCategory::Scale, ConfidenceTier::Estimated, "s1");
        let b = Claim::new("150 Employees.", ClaimCategory::Scale, ConfidenceTier::Inferred, "s2");
        let c = Claim::new("150 employees", ClaimCategory::Personnel, ConfidenceTier::Inferred, "s3");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert!(a.id.starts_with("clm_"));
    }

    #[test]
    fn source_category_round_trips_as_map_key() {
        let mut counts = BTreeMap::new();
        counts.insert(SourceCategory::CompanySite, 2usize);
        counts.insert(SourceCategory::News, 1usize);
        let json = serde_json::to_string(&counts).expect("serialize");
        assert_eq!(json, r#"{"company_site":2,"news":1}"#);
        let parsed: BTreeMap<SourceCategory, usize> = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, counts);
    }

    #[test]
    fn category_parsing_accepts_aliases() {
        assert_eq!("go-to-market".parse::<ClaimCategory>(), Ok(ClaimCategory::Gtm));
        assert_eq!("AI/ML".parse::<ClaimCategory>(), Ok(ClaimCategory::AiMl));
        assert!("weather".parse::<ClaimCategory>().is_err());
        assert_eq!("news".parse::<SourceCategory>(), Ok(SourceCategory::News));
        assert_eq!(
            "verified".parse::<ConfidenceTier>(),
            Ok(ConfidenceTier::VerifiedOnSource)
        );
    }

    #[test]
    fn research_result_fixture_validates() {
        let fixture = std::fs::read_to_string("../../../fixtures/json/research_result.fixture.json")
            .expect("read fixture");
        let parsed: ResearchResult =
            serde_json::from_str(&fixture).expect("deserialize fixture research result");
        assert_eq!(parsed.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(parsed.slug.as_str(), "efm_logistics");
        assert_eq!(parsed.sources.len(), 3);
        assert_eq!(parsed.claims.len(), 2);
        assert!(parsed.claims.iter().all(Claim::is_conflicting));
        assert!(parsed.coverage_gaps.contains(&SourceCategory::SocialForum));
    }

    #[test]
    fn checkpoint_record_serialization() {
        let record = CheckpointRecord::new(
            UnitKey::from_name("Acme"),
            Stage::Research,
            CheckpointStatus::Failed,
        )
        .with_error("rate limited")
        .with_attempts(2);
        let json = serde_json::to_string(&record).expect("serialize");
        assert!(json.contains(r#""status":"failed""#));
        assert!(json.contains(r#""stage":"research""#));
        assert!(!json.contains("payload"));
        let parsed: CheckpointRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.attempts, 2);
        assert_eq!(parsed.error.as_deref(), Some("rate limited"));
    }
}
